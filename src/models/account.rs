use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Account entitlement level. Governs rate-limit windows and credit metering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    /// Enterprise accounts are unmetered: the ledger never touches their balance.
    pub fn is_unmetered(&self) -> bool {
        matches!(self, Tier::Enterprise)
    }
}

/// An account as the orchestrator sees it. Owned by the excluded auth/billing
/// subsystems; only `credits_remaining` is ever mutated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub tier: Tier,
    pub credits_remaining: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn tier_round_trips_through_db_representation() {
        assert_eq!(Tier::Free.to_string(), "FREE");
        assert_eq!(Tier::Enterprise.to_string(), "ENTERPRISE");
        assert_eq!(Tier::from_str("PRO").unwrap(), Tier::Pro);
        assert!(Tier::from_str("GOLD").is_err());
    }

    #[test]
    fn only_enterprise_is_unmetered() {
        assert!(!Tier::Free.is_unmetered());
        assert!(!Tier::Pro.is_unmetered());
        assert!(Tier::Enterprise.is_unmetered());
    }
}
