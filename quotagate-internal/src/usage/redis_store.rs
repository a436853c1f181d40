use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{Error, ErrorDetails};
use crate::quota::QuotaLimit;
use crate::redis_client::RedisClient;
use crate::singleflight::SingleFlight;
use crate::usage::{TryIncrement, UsageHistoryEntry, UsageHistorySink, UsageRecord, UsageRecordStore};

const USAGE_KEY_PREFIX: &str = "usage:";
const HISTORY_KEY_PREFIX: &str = "usage_history:";

/// Limit sentinel passed to the increment script for unlimited accounts.
const UNLIMITED_ARG: i64 = -1;

/// Usage record store backed by a Redis hash per account. Every mutation is
/// a Lua script, so the staleness check, the rollover write, and the
/// conditional increment each run as one server-side atomic statement.
pub struct RedisUsageStore {
    redis: Arc<RedisClient>,
    period: chrono::Duration,
    op_timeout: Duration,
    get_or_create_script: Script,
    check_and_reset_script: Script,
    try_increment_script: Script,
    /// Dedupes concurrent first-time creation round trips per account
    creating: SingleFlight<UsageRecord>,
}

impl RedisUsageStore {
    pub fn new(redis: Arc<RedisClient>, period: chrono::Duration, op_timeout: Duration) -> Self {
        let get_or_create_script = Script::new(
            r"
            local now = tonumber(ARGV[1])
            local period = tonumber(ARGV[2])
            if redis.call('EXISTS', KEYS[1]) == 0 then
                redis.call('HSET', KEYS[1],
                    'count', 0,
                    'period_start', now,
                    'period_end', now + period,
                    'updated_at', now)
            end
            return redis.call('HMGET', KEYS[1], 'count', 'period_start', 'period_end', 'updated_at')
            ",
        );

        // The reset is conditioned on the period_end read in the same
        // script, so concurrent callers crossing a stale boundary produce
        // exactly one new period.
        let check_and_reset_script = Script::new(
            r"
            local now = tonumber(ARGV[1])
            local period = tonumber(ARGV[2])
            if redis.call('EXISTS', KEYS[1]) == 0 then
                redis.call('HSET', KEYS[1],
                    'count', 0,
                    'period_start', now,
                    'period_end', now + period,
                    'updated_at', now)
            else
                local period_end = tonumber(redis.call('HGET', KEYS[1], 'period_end'))
                if now >= period_end then
                    redis.call('HSET', KEYS[1],
                        'count', 0,
                        'period_start', now,
                        'period_end', now + period,
                        'updated_at', now)
                end
            end
            return redis.call('HMGET', KEYS[1], 'count', 'period_start', 'period_end', 'updated_at')
            ",
        );

        // limit < 0 means unlimited: increment unconditionally
        let try_increment_script = Script::new(
            r"
            local limit = tonumber(ARGV[1])
            local now = tonumber(ARGV[2])
            local period = tonumber(ARGV[3])
            if redis.call('EXISTS', KEYS[1]) == 0 then
                redis.call('HSET', KEYS[1],
                    'count', 0,
                    'period_start', now,
                    'period_end', now + period,
                    'updated_at', now)
            end
            local count = tonumber(redis.call('HGET', KEYS[1], 'count'))
            if limit < 0 or count < limit then
                local new_count = redis.call('HINCRBY', KEYS[1], 'count', 1)
                redis.call('HSET', KEYS[1], 'updated_at', now)
                return {1, new_count}
            end
            return {0, count}
            ",
        );

        Self {
            redis,
            period,
            op_timeout,
            get_or_create_script,
            check_and_reset_script,
            try_increment_script,
            creating: SingleFlight::new(),
        }
    }

    fn key(account_id: &str) -> String {
        format!("{USAGE_KEY_PREFIX}{account_id}")
    }

    async fn run_record_script(
        &self,
        script: &Script,
        account_id: &str,
    ) -> Result<UsageRecord, Error> {
        let mut conn = self.redis.connection();
        let key = Self::key(account_id);
        let now = Utc::now().timestamp();

        let values: Vec<String> = timeout(
            self.op_timeout,
            script
                .key(&key)
                .arg(now)
                .arg(self.period.num_seconds())
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| store_timeout(account_id))?
        .map_err(|e| store_error(account_id, &e))?;

        parse_record(account_id, &values)
    }
}

#[async_trait]
impl UsageRecordStore for RedisUsageStore {
    async fn get_or_create(&self, account_id: &str) -> Result<UsageRecord, Error> {
        self.creating
            .run(account_id, || {
                self.run_record_script(&self.get_or_create_script, account_id)
            })
            .await
    }

    async fn check_and_reset(&self, account_id: &str) -> Result<UsageRecord, Error> {
        self.run_record_script(&self.check_and_reset_script, account_id)
            .await
    }

    async fn try_increment(
        &self,
        account_id: &str,
        limit: QuotaLimit,
    ) -> Result<TryIncrement, Error> {
        let mut conn = self.redis.connection();
        let key = Self::key(account_id);
        let now = Utc::now().timestamp();
        let limit_arg = match limit {
            QuotaLimit::Limited(limit) => i64::from(limit),
            QuotaLimit::Unlimited => UNLIMITED_ARG,
        };

        let result: Vec<i64> = timeout(
            self.op_timeout,
            self.try_increment_script
                .key(&key)
                .arg(limit_arg)
                .arg(now)
                .arg(self.period.num_seconds())
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| store_timeout(account_id))?
        .map_err(|e| store_error(account_id, &e))?;

        match result.as_slice() {
            [ok, new_count] => Ok(TryIncrement {
                ok: *ok == 1,
                new_count: u32::try_from(*new_count).unwrap_or(0),
            }),
            _ => Err(Error::new_without_logging(ErrorDetails::InternalError {
                message: format!(
                    "unexpected increment script reply for {account_id}: {result:?}"
                ),
            })),
        }
    }
}

fn store_timeout(account_id: &str) -> Error {
    Error::new_without_logging(ErrorDetails::StoreUnavailable {
        message: format!("Redis timeout on usage record for {account_id}"),
    })
}

fn store_error(account_id: &str, e: &redis::RedisError) -> Error {
    Error::new_without_logging(ErrorDetails::StoreUnavailable {
        message: format!("Redis error on usage record for {account_id}: {e}"),
    })
}

fn parse_record(account_id: &str, values: &[String]) -> Result<UsageRecord, Error> {
    let [count, period_start, period_end, updated_at] = values else {
        return Err(Error::new_without_logging(ErrorDetails::InternalError {
            message: format!("unexpected usage record shape for {account_id}: {values:?}"),
        }));
    };
    Ok(UsageRecord {
        account_id: account_id.to_string(),
        count: parse_field(account_id, "count", count)?,
        period_start: parse_timestamp(account_id, "period_start", period_start)?,
        period_end: parse_timestamp(account_id, "period_end", period_end)?,
        updated_at: parse_timestamp(account_id, "updated_at", updated_at)?,
    })
}

fn parse_field<T: std::str::FromStr>(account_id: &str, field: &str, raw: &str) -> Result<T, Error> {
    raw.parse().map_err(|_| {
        Error::new_without_logging(ErrorDetails::Serialization {
            message: format!("invalid `{field}` value {raw:?} in usage record for {account_id}"),
        })
    })
}

fn parse_timestamp(account_id: &str, field: &str, raw: &str) -> Result<DateTime<Utc>, Error> {
    let secs: i64 = parse_field(account_id, field, raw)?;
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        Error::new_without_logging(ErrorDetails::Serialization {
            message: format!(
                "out-of-range `{field}` timestamp {secs} in usage record for {account_id}"
            ),
        })
    })
}

/// Append-only history in a Redis list per account: RPUSH of JSON entries,
/// never trimmed or rewritten by this subsystem.
pub struct RedisHistorySink {
    redis: Arc<RedisClient>,
    op_timeout: Duration,
}

impl RedisHistorySink {
    pub fn new(redis: Arc<RedisClient>, op_timeout: Duration) -> Self {
        Self { redis, op_timeout }
    }
}

#[async_trait]
impl UsageHistorySink for RedisHistorySink {
    async fn append(&self, entry: UsageHistoryEntry) -> Result<(), Error> {
        let mut conn = self.redis.connection();
        let key = format!("{HISTORY_KEY_PREFIX}{}", entry.account_id);
        let payload = serde_json::to_string(&entry).map_err(|e| {
            Error::new_without_logging(ErrorDetails::Serialization {
                message: format!("Failed to serialize usage history entry: {e}"),
            })
        })?;

        timeout(self.op_timeout, conn.rpush::<_, _, i64>(&key, payload))
            .await
            .map_err(|_| store_timeout(&entry.account_id))?
            .map_err(|e| store_error(&entry.account_id, &e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The scripts themselves only run against a live Redis (covered by the
    // e2e suite); these tests pin the reply-parsing layer.

    #[test]
    fn test_parse_record() {
        let values = vec![
            "3".to_string(),
            "1700000000".to_string(),
            "1702592000".to_string(),
            "1700001234".to_string(),
        ];
        let record = parse_record("acct_1", &values).unwrap();
        assert_eq!(record.count, 3);
        assert_eq!(record.period_start.timestamp(), 1_700_000_000);
        assert_eq!(record.period_end.timestamp(), 1_702_592_000);
        assert!(record.period_end > record.period_start);
    }

    #[test]
    fn test_parse_record_rejects_bad_shapes() {
        assert!(parse_record("acct_1", &["3".to_string()]).is_err());
        let values = vec![
            "not-a-number".to_string(),
            "1700000000".to_string(),
            "1702592000".to_string(),
            "1700001234".to_string(),
        ];
        assert!(parse_record("acct_1", &values).is_err());
    }
}
