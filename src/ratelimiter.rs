//! Per-plan sliding-window rate limiter (§4.4, §8 property 6).
//!
//! Grounded in `original_source/src/workshop/PGQueue.cxx`'s rate-limit probe
//! (statement 9, §6): rather than keep counters in memory, the check asks
//! PostgreSQL how many seconds remain before the `count`-th most recent run
//! inside `period` falls out of the window. This module just wraps that
//! query with the plan's configured limit and tracks which plans are
//! currently muted, the way the workshop queue's exclude-filter wants it
//! (§4.4 step 3's "rate limiter has temporarily muted" clause).

use std::collections::HashMap;
use std::time::Instant;

use crate::db::workshop;
use crate::db::QueueDb;
use crate::error::Result;
use crate::plan::RateLimit;

/// Tracks, per plan, the instant a rate-limited plan becomes eligible again.
#[derive(Debug, Default)]
pub struct RateLimiter {
    muted_until: HashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `plan_name` is currently muted.
    pub fn is_muted(&self, now: Instant, plan_name: &str) -> bool {
        self.muted_until.get(plan_name).is_some_and(|until| now < *until)
    }

    /// All currently-muted plan names, for the exclude filter (§4.4).
    pub fn muted_plans(&self, now: Instant) -> Vec<String> {
        self.muted_until
            .iter()
            .filter(|(_, until)| now < **until)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Probes the database for each configured rate limit on `plan_name` and
    /// mutes the plan for the longest wait any limit demands. Returns
    /// whether the plan is muted after the check.
    pub async fn check(
        &mut self,
        db: &QueueDb,
        now: Instant,
        plan_name: &str,
        limits: &[RateLimit],
    ) -> Result<bool> {
        let mut wait_seconds = 0i64;
        for limit in limits {
            if let Some(seconds) =
                workshop::check_rate_limit(db, plan_name, limit.period.as_secs() as i64, limit.count as i64).await?
            {
                wait_seconds = wait_seconds.max(seconds);
            }
        }

        if wait_seconds > 0 {
            self.muted_until.insert(
                plan_name.to_string(),
                now + std::time::Duration::from_secs(wait_seconds as u64),
            );
            Ok(true)
        } else {
            self.muted_until.remove(plan_name);
            Ok(false)
        }
    }

    /// Drops any mute whose deadline has passed, so the queue re-probes
    /// rather than treating a long-stale mute as permanent.
    pub fn expire(&mut self, now: Instant) {
        self.muted_until.retain(|_, until| now < *until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmuted_plan_is_not_muted() {
        let limiter = RateLimiter::new();
        assert!(!limiter.is_muted(Instant::now(), "build"));
    }

    #[test]
    fn expire_drops_past_deadlines() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        limiter.muted_until.insert("build".to_string(), now - std::time::Duration::from_secs(1));
        limiter.expire(now);
        assert!(!limiter.is_muted(now, "build"));
    }
}
