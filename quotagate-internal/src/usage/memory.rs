use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Mutex;

use crate::error::Error;
use crate::quota::QuotaLimit;
use crate::usage::{TryIncrement, UsageHistoryEntry, UsageHistorySink, UsageRecord, UsageRecordStore};

/// In-process usage record store. The DashMap entry guard holds the shard
/// lock for the duration of each mutation, which gives the same
/// single-atomic-statement semantics the Redis scripts provide.
pub struct InMemoryUsageStore {
    records: DashMap<String, UsageRecord>,
    period: chrono::Duration,
}

impl InMemoryUsageStore {
    pub fn new(period: chrono::Duration) -> Self {
        Self {
            records: DashMap::new(),
            period,
        }
    }

    /// Seed a record directly, bypassing the lazy-creation path. Test-only:
    /// production records are born through `get_or_create`.
    #[cfg(test)]
    pub(crate) fn insert_record(&self, record: UsageRecord) {
        self.records.insert(record.account_id.clone(), record);
    }

    #[cfg(test)]
    pub(crate) fn get_record(&self, account_id: &str) -> Option<UsageRecord> {
        self.records.get(account_id).map(|r| r.clone())
    }
}

#[async_trait]
impl UsageRecordStore for InMemoryUsageStore {
    async fn get_or_create(&self, account_id: &str) -> Result<UsageRecord, Error> {
        let now = Utc::now();
        let record = self
            .records
            .entry(account_id.to_string())
            .or_insert_with(|| UsageRecord::fresh(account_id, now, self.period));
        Ok(record.clone())
    }

    async fn check_and_reset(&self, account_id: &str) -> Result<UsageRecord, Error> {
        let now = Utc::now();
        let mut record = self
            .records
            .entry(account_id.to_string())
            .or_insert_with(|| UsageRecord::fresh(account_id, now, self.period));
        if record.is_stale(now) {
            *record = UsageRecord::fresh(account_id, now, self.period);
        }
        Ok(record.clone())
    }

    async fn try_increment(
        &self,
        account_id: &str,
        limit: QuotaLimit,
    ) -> Result<TryIncrement, Error> {
        let now = Utc::now();
        let mut record = self
            .records
            .entry(account_id.to_string())
            .or_insert_with(|| UsageRecord::fresh(account_id, now, self.period));
        if limit.allows(record.count) {
            record.count += 1;
            record.updated_at = now;
            Ok(TryIncrement {
                ok: true,
                new_count: record.count,
            })
        } else {
            Ok(TryIncrement {
                ok: false,
                new_count: record.count,
            })
        }
    }
}

/// History sink that keeps entries in memory, in append order.
#[derive(Default)]
pub struct InMemoryHistorySink {
    entries: Mutex<Vec<UsageHistoryEntry>>,
}

impl InMemoryHistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<UsageHistoryEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl UsageHistorySink for InMemoryHistorySink {
    async fn append(&self, entry: UsageHistoryEntry) -> Result<(), Error> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
        Ok(())
    }
}
