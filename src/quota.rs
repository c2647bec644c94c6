//! Quota tracking: one probe of the GraphQL allowance per run.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;

use crate::github::GitHubApi;

/// Assumed allowance when the probe fails
const FALLBACK_REMAINING: u32 = 100;
const FALLBACK_TOTAL: u32 = 5000;

/// Remaining external call allowance, computed once per run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Budget {
    pub remaining: u32,
    pub total: u32,
    pub reset_at: DateTime<Utc>,
    /// True when the numbers are the fallback, not a real reading
    pub degraded: bool,
}

impl Budget {
    pub fn fallback(now: DateTime<Utc>) -> Self {
        Self {
            remaining: FALLBACK_REMAINING,
            total: FALLBACK_TOTAL,
            reset_at: now + Duration::hours(1),
            degraded: true,
        }
    }

    /// Calls the selector may plan for, after holding back `reserve`
    pub fn available(&self, reserve: u32) -> u32 {
        self.remaining.saturating_sub(reserve)
    }

    /// Seconds until the allowance resets (0 if already past)
    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now).num_seconds().max(0) as u64
    }
}

/// Probe the rate limit endpoint, falling back to a conservative default on any failure
pub async fn check_budget<A: GitHubApi>(api: &A) -> Budget {
    let now = Utc::now();
    match api.rate_limit().await {
        Ok(rate) => {
            let reset_at = Utc
                .timestamp_opt(rate.reset, 0)
                .single()
                .unwrap_or_else(|| now + Duration::hours(1));
            tracing::debug!(
                remaining = rate.remaining,
                total = rate.limit,
                %reset_at,
                "graphql budget"
            );
            Budget {
                remaining: rate.remaining,
                total: rate.limit,
                reset_at,
                degraded: false,
            }
        }
        Err(e) => {
            tracing::warn!(
                "rate limit probe failed, assuming {} remaining: {:#}",
                FALLBACK_REMAINING,
                e
            );
            Budget::fallback(now)
        }
    }
}
