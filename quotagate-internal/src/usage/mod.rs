pub mod memory;
pub mod redis_store;

pub use memory::{InMemoryHistorySink, InMemoryUsageStore};
pub use redis_store::{RedisHistorySink, RedisUsageStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::quota::QuotaLimit;

/// Per-account consumption counter with its period boundaries. One row per
/// account, created lazily on the first check.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub account_id: String,
    pub count: u32,
    pub period_start: DateTime<Utc>,
    /// Exclusive upper bound of the period
    pub period_end: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Zero-state record whose period starts now.
    pub fn fresh(account_id: &str, now: DateTime<Utc>, period: chrono::Duration) -> Self {
        Self {
            account_id: account_id.to_string(),
            count: 0,
            period_start: now,
            period_end: now + period,
            updated_at: now,
        }
    }

    /// A stale record must be rolled over before it can be trusted for a
    /// decision.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.period_end
    }
}

/// Append-only audit entry, one per consumed use. Never read by the
/// decision path and never mutated or deleted by this subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageHistoryEntry {
    pub account_id: String,
    pub feature_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of an atomic conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryIncrement {
    /// False when the counter was already at the limit
    pub ok: bool,
    /// The counter value after the operation (unchanged when `ok` is false)
    pub new_count: u32,
}

/// Durable home of the per-account counter. The record is mutated only
/// through `check_and_reset` and `try_increment`; both must execute as a
/// single atomic statement on the store side, never as caller-side
/// read-then-write.
#[async_trait]
pub trait UsageRecordStore: Send + Sync {
    /// Return the account's record, atomically creating the zero-state
    /// record if none exists. Concurrent first-time callers for the same
    /// account must observe a single record.
    async fn get_or_create(&self, account_id: &str) -> Result<UsageRecord, Error>;

    /// Atomic "read; if stale, reset-and-persist; return current". The
    /// reset is conditioned on the observed `period_end`, so exactly one
    /// rollover happens per boundary crossing no matter how many callers
    /// race across it.
    async fn check_and_reset(&self, account_id: &str) -> Result<UsageRecord, Error>;

    /// Atomic conditional increment: `count += 1` only while
    /// `count < limit`, or unconditionally for `QuotaLimit::Unlimited`.
    async fn try_increment(&self, account_id: &str, limit: QuotaLimit)
        -> Result<TryIncrement, Error>;
}

/// Append-only sink for usage history. Appends are commutative, so no
/// coordination with the counter is needed or wanted.
#[async_trait]
pub trait UsageHistorySink: Send + Sync {
    async fn append(&self, entry: UsageHistoryEntry) -> Result<(), Error>;
}
