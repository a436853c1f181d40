pub mod engine;
pub mod gate;
pub mod projector;

pub use engine::QuotaEngine;
pub use gate::ExecutionGate;
pub use projector::{DisplayStatus, StatusProjector, StatusSeverity};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};

/// A per-period allowance, or the sentinel for subscribed accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaLimit {
    Limited(u32),
    Unlimited,
}

impl QuotaLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, QuotaLimit::Unlimited)
    }

    /// Whether a counter at `count` may take one more use.
    pub fn allows(&self, count: u32) -> bool {
        match self {
            QuotaLimit::Limited(limit) => count < *limit,
            QuotaLimit::Unlimited => true,
        }
    }

    /// Remaining uses, `None` for unlimited.
    pub fn remaining(&self, count: u32) -> Option<u32> {
        match self {
            QuotaLimit::Limited(limit) => Some(limit.saturating_sub(count)),
            QuotaLimit::Unlimited => None,
        }
    }
}

// Serialized as the number, or the string "unlimited" for the sentinel.
impl Serialize for QuotaLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            QuotaLimit::Limited(limit) => serializer.serialize_u32(*limit),
            QuotaLimit::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl std::fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaLimit::Limited(limit) => write!(f, "{limit}"),
            QuotaLimit::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// An account's standing, recomputed on every check. Never persisted as a
/// state label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStanding {
    /// Active subscription, regardless of a pending cancellation
    Unlimited,
    /// Not subscribed, under the free-tier limit
    Allowed,
    /// Not subscribed, at or over the free-tier limit
    Exhausted,
}

/// The outcome of one admission check. Derived, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub account_id: String,
    pub can_use: bool,
    pub current_count: u32,
    pub limit: QuotaLimit,
    pub is_subscribed: bool,
    pub period_end: Option<DateTime<Utc>>,
    pub days_left: i64,
    pub cancel_at_period_end: bool,
}

impl QuotaDecision {
    pub fn standing(&self) -> AccountStanding {
        if self.is_subscribed {
            AccountStanding::Unlimited
        } else if self.can_use {
            AccountStanding::Allowed
        } else {
            AccountStanding::Exhausted
        }
    }

    /// Remaining free-tier uses, `None` when the limit does not apply.
    pub fn remaining(&self) -> Option<u32> {
        self.limit.remaining(self.current_count)
    }
}

/// Result of gating one feature invocation.
#[derive(Debug)]
pub enum ExecutionOutcome<T> {
    /// The operation ran to completion; `decision` reflects the post-state.
    Admitted { result: T, decision: QuotaDecision },
    /// The operation was never invoked.
    Denied { decision: QuotaDecision },
}

impl<T> ExecutionOutcome<T> {
    pub fn is_admitted(&self) -> bool {
        matches!(self, ExecutionOutcome::Admitted { .. })
    }

    pub fn decision(&self) -> &QuotaDecision {
        match self {
            ExecutionOutcome::Admitted { decision, .. } | ExecutionOutcome::Denied { decision } => {
                decision
            }
        }
    }
}

/// Counters for quota engine behavior.
#[derive(Debug, Default)]
pub struct QuotaMetrics {
    pub admitted: AtomicU64,
    pub denied: AtomicU64,
    /// Admissions granted because the store was down and `fail_open` is set
    pub fail_open_admissions: AtomicU64,
    /// Increments that lost the race to the limit after the operation ran
    pub race_lost: AtomicU64,
    pub store_errors: AtomicU64,
    pub subscription_errors: AtomicU64,
    pub history_errors: AtomicU64,
    pub subscription_cache_hits: AtomicU64,
    pub subscription_cache_misses: AtomicU64,
}

impl QuotaMetrics {
    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail_open_admission(&self) {
        self.fail_open_admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_race_lost(&self) {
        self.race_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscription_error(&self) {
        self.subscription_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_history_error(&self) {
        self.history_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscription_cache_hit(&self) {
        self.subscription_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscription_cache_miss(&self) {
        self.subscription_cache_misses.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_limit_allows() {
        assert!(QuotaLimit::Limited(5).allows(4));
        assert!(!QuotaLimit::Limited(5).allows(5));
        assert!(!QuotaLimit::Limited(5).allows(6));
        assert!(QuotaLimit::Unlimited.allows(u32::MAX));
    }

    #[test]
    fn test_quota_limit_remaining() {
        assert_eq!(QuotaLimit::Limited(5).remaining(3), Some(2));
        assert_eq!(QuotaLimit::Limited(5).remaining(7), Some(0));
        assert_eq!(QuotaLimit::Unlimited.remaining(3), None);
    }

    #[test]
    fn test_quota_limit_serializes_sentinel() {
        let limited = serde_json::to_value(QuotaLimit::Limited(5)).unwrap();
        assert_eq!(limited, serde_json::json!(5));
        let unlimited = serde_json::to_value(QuotaLimit::Unlimited).unwrap();
        assert_eq!(unlimited, serde_json::json!("unlimited"));
    }

    #[test]
    fn test_standing_from_decision() {
        let mut decision = QuotaDecision {
            account_id: "acct_1".to_string(),
            can_use: true,
            current_count: 2,
            limit: QuotaLimit::Limited(5),
            is_subscribed: false,
            period_end: None,
            days_left: 10,
            cancel_at_period_end: false,
        };
        assert_eq!(decision.standing(), AccountStanding::Allowed);

        decision.can_use = false;
        decision.current_count = 5;
        assert_eq!(decision.standing(), AccountStanding::Exhausted);

        decision.is_subscribed = true;
        decision.can_use = true;
        decision.limit = QuotaLimit::Unlimited;
        assert_eq!(decision.standing(), AccountStanding::Unlimited);
    }
}
