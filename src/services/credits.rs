use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;

/// Atomic credit accounting for an account.
///
/// Reservation is a single conditional UPDATE, so two concurrent submissions
/// can never both pass a balance that covers only one of them. Enterprise
/// accounts are unmetered: every operation is a no-op success for them.
pub struct CreditLedger {
    db: PgPool,
}

#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    #[error("Insufficient credits. Required: {required}, Available: {available}")]
    Insufficient { required: i64, available: i64 },

    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CreditLedger {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Whether the account can cover `required` credits right now. Advisory:
    /// only `reserve` is authoritative under concurrency.
    pub async fn has_sufficient_credits(
        &self,
        account_id: Uuid,
        required: i64,
    ) -> Result<bool, CreditError> {
        match queries::get_account(&self.db, account_id).await? {
            None => Ok(false),
            Some(account) if account.tier.is_unmetered() => Ok(true),
            Some(account) => Ok(account.credits_remaining >= required),
        }
    }

    /// Atomically deduct `required` credits. Returns the remaining balance.
    pub async fn reserve(&self, account_id: Uuid, required: i64) -> Result<i64, CreditError> {
        if let Some(remaining) = queries::try_reserve_credits(&self.db, account_id, required).await?
        {
            tracing::debug!(
                account_id = %account_id,
                credits = required,
                remaining,
                "Reserved credits"
            );
            return Ok(remaining);
        }

        // The conditional update matched nothing: unmetered account,
        // insufficient balance, or no such account.
        match queries::get_account(&self.db, account_id).await? {
            None => Err(CreditError::AccountNotFound(account_id)),
            Some(account) if account.tier.is_unmetered() => Ok(account.credits_remaining),
            Some(account) => Err(CreditError::Insufficient {
                required,
                available: account.credits_remaining,
            }),
        }
    }

    /// Atomically return `amount` credits, reversing a reservation whose job
    /// terminated as FAILED. Returns the new balance.
    pub async fn refund(&self, account_id: Uuid, amount: i64) -> Result<i64, CreditError> {
        if let Some(balance) = queries::add_credits(&self.db, account_id, amount).await? {
            metrics::counter!("credits_refunded_total").increment(amount as u64);
            tracing::debug!(account_id = %account_id, credits = amount, balance, "Refunded credits");
            return Ok(balance);
        }

        match queries::get_account(&self.db, account_id).await? {
            None => Err(CreditError::AccountNotFound(account_id)),
            Some(account) => Ok(account.credits_remaining),
        }
    }
}
