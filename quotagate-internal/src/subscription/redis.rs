use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{Error, ErrorDetails};
use crate::redis_client::RedisClient;
use crate::subscription::{SubscriptionAdmin, SubscriptionOracle, SubscriptionView};

const SUBSCRIPTION_KEY_PREFIX: &str = "subscription:";

/// Subscription read model in Redis: one JSON document per account at
/// `subscription:{account_id}`, written by the billing webhook handler.
pub struct RedisSubscriptionStore {
    redis: Arc<RedisClient>,
    op_timeout: Duration,
    resume_script: Script,
}

impl RedisSubscriptionStore {
    pub fn new(redis: Arc<RedisClient>, op_timeout: Duration) -> Self {
        // Rewriting the flag inside Redis keeps resume a single atomic
        // statement; a read-modify-write from here could clobber a
        // concurrent webhook update.
        let resume_script = Script::new(
            r"
            local raw = redis.call('GET', KEYS[1])
            if not raw then
                return false
            end
            local doc = cjson.decode(raw)
            doc['cancel_at_period_end'] = false
            local encoded = cjson.encode(doc)
            redis.call('SET', KEYS[1], encoded)
            return encoded
            ",
        );
        Self {
            redis,
            op_timeout,
            resume_script,
        }
    }

    fn key(account_id: &str) -> String {
        format!("{SUBSCRIPTION_KEY_PREFIX}{account_id}")
    }
}

#[async_trait]
impl SubscriptionOracle for RedisSubscriptionStore {
    async fn get_view(&self, account_id: &str) -> Result<SubscriptionView, Error> {
        let mut conn = self.redis.connection();
        let key = Self::key(account_id);

        let raw = timeout(self.op_timeout, conn.get::<_, Option<String>>(&key))
            .await
            .map_err(|_| {
                Error::new_without_logging(ErrorDetails::SubscriptionLookupFailed {
                    message: format!("Redis timeout fetching subscription for {account_id}"),
                })
            })?
            .map_err(|e| {
                Error::new_without_logging(ErrorDetails::SubscriptionLookupFailed {
                    message: format!("Redis error fetching subscription for {account_id}: {e}"),
                })
            })?;

        match raw {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                // A corrupt document is as good as no answer; the engine
                // resolves this toward not-subscribed.
                Error::new_without_logging(ErrorDetails::SubscriptionLookupFailed {
                    message: format!("Failed to parse subscription record for {account_id}: {e}"),
                })
            }),
            None => Ok(SubscriptionView::none(account_id)),
        }
    }
}

#[async_trait]
impl SubscriptionAdmin for RedisSubscriptionStore {
    async fn resume(&self, account_id: &str) -> Result<SubscriptionView, Error> {
        let mut conn = self.redis.connection();
        let key = Self::key(account_id);

        let updated: Option<String> = timeout(
            self.op_timeout,
            self.resume_script.key(&key).invoke_async(&mut conn),
        )
        .await
        .map_err(|_| {
            Error::new(ErrorDetails::StoreUnavailable {
                message: format!("Redis timeout resuming subscription for {account_id}"),
            })
        })?
        .map_err(|e| {
            Error::new(ErrorDetails::StoreUnavailable {
                message: format!("Redis error resuming subscription for {account_id}: {e}"),
            })
        })?;

        let json = updated.ok_or_else(|| {
            Error::new(ErrorDetails::SubscriptionNotFound {
                account_id: account_id.to_string(),
            })
        })?;

        serde_json::from_str(&json).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!(
                    "Failed to parse subscription record for {account_id} after resume: {e}"
                ),
            })
        })
    }
}
