use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::QuotaConfig;
use crate::error::Error;
use crate::quota::{QuotaDecision, QuotaLimit, QuotaMetrics};
use crate::subscription::{SubscriptionOracle, SubscriptionView};
use crate::usage::{TryIncrement, UsageHistoryEntry, UsageHistorySink, UsageRecordStore};

/// Pure decision logic over the usage store and the subscription oracle.
/// Standing is recomputed on every check; nothing here persists a state
/// label.
pub struct QuotaEngine {
    store: Arc<dyn UsageRecordStore>,
    oracle: Arc<dyn SubscriptionOracle>,
    history: Arc<dyn UsageHistorySink>,
    config: QuotaConfig,
    metrics: Arc<QuotaMetrics>,
}

impl QuotaEngine {
    pub fn new(
        store: Arc<dyn UsageRecordStore>,
        oracle: Arc<dyn SubscriptionOracle>,
        history: Arc<dyn UsageHistorySink>,
        config: QuotaConfig,
        metrics: Arc<QuotaMetrics>,
    ) -> Self {
        Self {
            store,
            oracle,
            history,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<QuotaMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Compute the admission decision for one account, rolling the usage
    /// period over first if it is stale. This never returns an error:
    /// storage failure resolves to the configured fail-open/fail-closed
    /// decision, and subscription-lookup failure resolves to the
    /// not-subscribed path.
    pub async fn decide(&self, account_id: &str) -> QuotaDecision {
        let record = match self.store.check_and_reset(account_id).await {
            Ok(record) => record,
            Err(e) => {
                self.metrics.record_store_error();
                return self.storage_failure_decision(account_id, &e);
            }
        };

        let sub = match self.oracle.get_view(account_id).await {
            Ok(view) => view,
            Err(e) => {
                // Ambiguity never grants unlimited use
                self.metrics.record_subscription_error();
                warn!(
                    account_id,
                    error = %e,
                    "subscription lookup failed, treating account as not subscribed"
                );
                SubscriptionView::none(account_id)
            }
        };

        let now = Utc::now();
        if sub.is_active() {
            let period_end = sub.current_period_end.or(Some(record.period_end));
            return QuotaDecision {
                account_id: account_id.to_string(),
                can_use: true,
                current_count: record.count,
                limit: QuotaLimit::Unlimited,
                is_subscribed: true,
                period_end,
                days_left: days_until(now, period_end),
                cancel_at_period_end: sub.cancel_at_period_end,
            };
        }

        let limit = self.config.limit();
        let can_use = limit.allows(record.count);
        debug!(
            account_id,
            count = record.count,
            limit = %limit,
            can_use,
            "computed quota decision"
        );
        QuotaDecision {
            account_id: account_id.to_string(),
            can_use,
            current_count: record.count,
            limit,
            is_subscribed: false,
            period_end: Some(record.period_end),
            days_left: days_until(now, Some(record.period_end)),
            cancel_at_period_end: false,
        }
    }

    /// Consume one use: atomic conditional increment plus a best-effort
    /// history append. The two side effects are independent; a history
    /// failure never fails the increment and vice versa.
    pub async fn consume(&self, account_id: &str, feature_type: &str) -> Result<TryIncrement, Error> {
        let increment = self
            .store
            .try_increment(account_id, self.config.limit())
            .await;

        let entry = UsageHistoryEntry {
            account_id: account_id.to_string(),
            feature_type: feature_type.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.history.append(entry).await {
            self.metrics.record_history_error();
            warn!(
                account_id,
                feature_type,
                error = %e,
                "failed to append usage history entry"
            );
        }

        increment
    }

    /// The decision when the usage record store cannot be read. Fail-open
    /// favors service availability over strict enforcement and is logged
    /// loudly so abuse stays detectable out of band; fail-closed is the
    /// stricter stance for higher-stakes deployments.
    fn storage_failure_decision(&self, account_id: &str, error: &Error) -> QuotaDecision {
        if self.config.fail_open {
            self.metrics.record_fail_open_admission();
            warn!(
                account_id,
                error = %error,
                "usage record store unavailable, admitting without quota enforcement (fail-open)"
            );
            QuotaDecision {
                account_id: account_id.to_string(),
                can_use: true,
                current_count: 0,
                limit: QuotaLimit::Unlimited,
                is_subscribed: false,
                period_end: None,
                days_left: 0,
                cancel_at_period_end: false,
            }
        } else {
            warn!(
                account_id,
                error = %error,
                "usage record store unavailable, denying (fail-closed)"
            );
            QuotaDecision {
                account_id: account_id.to_string(),
                can_use: false,
                current_count: 0,
                limit: self.config.limit(),
                is_subscribed: false,
                period_end: None,
                days_left: 0,
                cancel_at_period_end: false,
            }
        }
    }
}

fn days_until(now: DateTime<Utc>, period_end: Option<DateTime<Utc>>) -> i64 {
    period_end
        .map(|end| (end - now).num_days().max(0))
        .unwrap_or(0)
}
