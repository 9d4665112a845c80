use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::request::GenerationSettings;

/// Lifecycle state of a generation job.
///
/// Transitions are monotonic: `Pending -> Processing -> {Succeeded, Failed}`,
/// plus `Pending -> Failed` when admission or the housekeeping sweep kills a
/// job before processing starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Succeeded)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    /// Deterministic progress percentage surfaced by the status API.
    pub fn progress(&self) -> u8 {
        match self {
            JobStatus::Pending => 5,
            JobStatus::Processing => 50,
            JobStatus::Succeeded => 100,
            JobStatus::Failed => 0,
        }
    }
}

/// One end-to-end generation request. Created at admission, mutated only by
/// the orchestrator, never deleted by this system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub account_id: Uuid,
    pub status: JobStatus,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub seed: Option<i64>,
    pub reference_image_url: Option<String>,
    pub settings: GenerationSettings,
    pub provider: String,
    /// Credits reserved at admission; the refund on failure reverses exactly
    /// this amount.
    pub credits_charged: i64,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_image_url: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_deterministic_per_status() {
        assert_eq!(JobStatus::Pending.progress(), 5);
        assert_eq!(JobStatus::Processing.progress(), 50);
        assert_eq!(JobStatus::Succeeded.progress(), 100);
        assert_eq!(JobStatus::Failed.progress(), 0);
    }

    #[test]
    fn status_never_regresses() {
        use JobStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Succeeded));
        assert!(Processing.can_transition_to(Failed));

        // No skips, no reversals, no leaving a terminal state.
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Succeeded.can_transition_to(Processing));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Succeeded));
    }
}
