use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::AsyncCommands;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::account::Tier;

/// Admission budget for one tier: `limit` requests per rolling window.
#[derive(Debug, Clone, Copy)]
pub struct TierLimit {
    pub limit: u32,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    free: TierLimit,
    pro: TierLimit,
    enterprise: TierLimit,
}

impl TierLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            free: TierLimit {
                limit: config.free_tier_limit,
                window_seconds: config.free_tier_window_seconds,
            },
            pro: TierLimit {
                limit: config.pro_tier_limit,
                window_seconds: config.pro_tier_window_seconds,
            },
            enterprise: TierLimit {
                limit: config.enterprise_tier_limit,
                window_seconds: config.enterprise_tier_window_seconds,
            },
        }
    }

    pub fn for_tier(&self, tier: Tier) -> TierLimit {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Per-account sliding-window admission counter backed by Redis.
///
/// One `INCR` per check; the first increment in a window sets the expiry.
/// A counter-store outage fails open: admission is allowed and the degraded
/// mode is logged and counted.
pub struct RateLimiter {
    client: redis::Client,
    limits: TierLimits,
}

impl RateLimiter {
    pub fn new(redis_url: &str, limits: TierLimits) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, limits })
    }

    pub fn limit(&self, tier: Tier) -> u32 {
        self.limits.for_tier(tier).limit
    }

    /// Check and consume one admission slot. Never waits, never fails closed.
    pub async fn check(&self, account_id: Uuid, tier: Tier) -> RateLimitDecision {
        let limit = self.limits.for_tier(tier);

        match self.try_check(account_id, limit).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(
                    account_id = %account_id,
                    error = %err,
                    "Rate limit check failed, failing open"
                );
                metrics::counter!("rate_limiter_degraded_total").increment(1);
                RateLimitDecision {
                    allowed: true,
                    remaining: limit.limit,
                    reset_at: Utc::now() + ChronoDuration::seconds(limit.window_seconds as i64),
                }
            }
        }
    }

    async fn try_check(
        &self,
        account_id: Uuid,
        limit: TierLimit,
    ) -> Result<RateLimitDecision, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("generation:rate-limit:{account_id}");

        let count: i64 = conn.incr(&key, 1).await?;

        // First request in the window sets the expiry.
        if count == 1 {
            conn.expire::<_, ()>(&key, limit.window_seconds as i64)
                .await?;
        }

        let ttl: i64 = conn.ttl(&key).await?;
        let reset_seconds = if ttl > 0 {
            ttl
        } else {
            limit.window_seconds as i64
        };

        Ok(RateLimitDecision {
            allowed: count <= i64::from(limit.limit),
            remaining: (i64::from(limit.limit) - count).max(0) as u32,
            reset_at: Utc::now() + ChronoDuration::seconds(reset_seconds),
        })
    }

    /// Drop the counter for an account (admin/test hook).
    pub async fn reset(&self, account_id: Uuid) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("generation:rate-limit:{account_id}");
        conn.del::<_, ()>(&key).await?;
        Ok(())
    }
}
