use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::quota::{ExecutionOutcome, QuotaEngine, QuotaMetrics};
use crate::usage::TryIncrement;

/// Orchestrates "check, run the protected operation, record consumption"
/// for one feature invocation. Generic over the operation's result and
/// error types; no lock is held while the operation runs.
pub struct ExecutionGate {
    engine: Arc<QuotaEngine>,
    metrics: Arc<QuotaMetrics>,
}

impl ExecutionGate {
    pub fn new(engine: Arc<QuotaEngine>) -> Self {
        let metrics = engine.metrics();
        Self { engine, metrics }
    }

    pub fn engine(&self) -> &Arc<QuotaEngine> {
        &self.engine
    }

    /// Admit or deny one invocation of a metered feature.
    ///
    /// Admission is optimistic with respect to wall-clock race windows: two
    /// callers can both be admitted at `count = limit - 1`, but the store's
    /// conditional increment lets only one of them take the last slot. The
    /// loser's result is still returned (the work already happened); the
    /// event is logged for reconciliation. Operations that fail or are
    /// cancelled consume nothing.
    pub async fn execute<T, E, F, Fut>(
        &self,
        account_id: &str,
        feature_type: &str,
        op: F,
    ) -> Result<ExecutionOutcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut decision = self.engine.decide(account_id).await;

        if !decision.can_use {
            self.metrics.record_denied();
            debug!(
                account_id,
                feature_type,
                count = decision.current_count,
                "denied metered feature invocation"
            );
            return Ok(ExecutionOutcome::Denied { decision });
        }

        // Operation failures surface unchanged, with no quota side effects.
        let result = op().await?;
        self.metrics.record_admitted();

        // Unlimited admissions (subscription, or fail-open) never touch the
        // counter, so a degraded subscription lookup cannot corrupt a paid
        // account's free-tier count.
        if decision.limit.is_unlimited() {
            return Ok(ExecutionOutcome::Admitted { result, decision });
        }

        match self.engine.consume(account_id, feature_type).await {
            Ok(TryIncrement {
                ok: true,
                new_count,
            }) => {
                decision.current_count = new_count;
                decision.can_use = decision.limit.allows(new_count);
            }
            Ok(TryIncrement {
                ok: false,
                new_count,
            }) => {
                // The counter was already at the limit: a concurrent caller
                // took the last slot after we were admitted. The work is
                // done and cannot be undone, so the result still goes back
                // to the caller.
                self.metrics.record_race_lost();
                warn!(
                    account_id,
                    feature_type,
                    count = new_count,
                    "operation completed but increment lost the race to the limit"
                );
                decision.current_count = new_count;
                decision.can_use = false;
            }
            Err(e) => {
                warn!(
                    account_id,
                    feature_type,
                    error = %e,
                    "operation completed but consumption could not be recorded"
                );
            }
        }

        Ok(ExecutionOutcome::Admitted { result, decision })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaConfig;
    use crate::quota::QuotaLimit;
    use crate::subscription::{InMemorySubscriptionStore, SubscriptionOracle};
    use crate::usage::{InMemoryHistorySink, InMemoryUsageStore, UsageHistorySink, UsageRecordStore};
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time::{sleep, Duration};

    struct Fixture {
        gate: ExecutionGate,
        store: Arc<InMemoryUsageStore>,
        subscriptions: Arc<InMemorySubscriptionStore>,
    }

    fn fixture() -> Fixture {
        let config = QuotaConfig::default();
        let store = Arc::new(InMemoryUsageStore::new(config.period()));
        let subscriptions = Arc::new(InMemorySubscriptionStore::new());
        let engine = Arc::new(QuotaEngine::new(
            Arc::clone(&store) as Arc<dyn UsageRecordStore>,
            Arc::clone(&subscriptions) as Arc<dyn SubscriptionOracle>,
            Arc::new(InMemoryHistorySink::new()) as Arc<dyn UsageHistorySink>,
            config,
            Arc::new(QuotaMetrics::default()),
        ));
        Fixture {
            gate: ExecutionGate::new(engine),
            store,
            subscriptions,
        }
    }

    async fn seed_count(store: &InMemoryUsageStore, account_id: &str, count: u32) {
        store.get_or_create(account_id).await.unwrap();
        for _ in 0..count {
            store
                .try_increment(account_id, QuotaLimit::Unlimited)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_sequential_executions_count_exactly() {
        let f = fixture();
        for expected in 1..=5u32 {
            let outcome = f
                .gate
                .execute("acct_1", "simulation", || async { Ok::<_, String>(expected) })
                .await
                .unwrap();
            match outcome {
                ExecutionOutcome::Admitted { result, decision } => {
                    assert_eq!(result, expected);
                    assert_eq!(decision.current_count, expected);
                }
                ExecutionOutcome::Denied { .. } => panic!("expected admission {expected}"),
            }
        }
        assert_eq!(f.store.get_record("acct_1").unwrap().count, 5);
    }

    #[tokio::test]
    async fn test_fifth_use_exhausts_the_allowance() {
        let f = fixture();
        seed_count(&f.store, "acct_1", 4).await;

        let outcome = f
            .gate
            .execute("acct_1", "simulation", || async { Ok::<_, String>("done") })
            .await
            .unwrap();
        let ExecutionOutcome::Admitted { decision, .. } = outcome else {
            panic!("expected admission at count 4");
        };
        assert_eq!(decision.current_count, 5);
        assert!(!decision.can_use);

        // The next check denies without running the operation
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);
        let outcome = f
            .gate
            .execute("acct_1", "simulation", move || async move {
                ran_flag.store(true, Ordering::SeqCst);
                Ok::<_, String>("should not run")
            })
            .await
            .unwrap();
        assert!(!outcome.is_admitted());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_operations_do_not_consume_quota() {
        let f = fixture();
        let result = f
            .gate
            .execute("acct_1", "simulation", || async {
                Err::<(), _>("simulation blew up".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err(), "simulation blew up");
        assert_eq!(f.store.get_record("acct_1").unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_subscribed_accounts_never_touch_the_counter() {
        let f = fixture();
        f.subscriptions.set_active("acct_1", None);
        seed_count(&f.store, "acct_1", 2).await;

        for _ in 0..10 {
            let outcome = f
                .gate
                .execute("acct_1", "simulation", || async { Ok::<_, String>(()) })
                .await
                .unwrap();
            assert!(outcome.is_admitted());
        }
        assert_eq!(f.store.get_record("acct_1").unwrap().count, 2);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_concurrent_race_at_the_last_slot_never_overshoots() {
        let f = fixture();
        seed_count(&f.store, "acct_1", 4).await;

        let gate = Arc::new(f.gate);
        let completions = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            let completions = Arc::clone(&completions);
            handles.push(tokio::spawn(async move {
                gate.execute("acct_1", "simulation", move || async move {
                    // Keep both operations in flight across each other's
                    // admission checks
                    sleep(Duration::from_millis(50)).await;
                    completions.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                })
                .await
                .unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_admitted() {
                admitted += 1;
            }
        }

        // Both were admitted and both completed, but the counter stops at
        // the limit: one increment won, the other lost the race.
        assert_eq!(admitted, 2);
        assert_eq!(completions.load(Ordering::SeqCst), 2);
        assert_eq!(f.store.get_record("acct_1").unwrap().count, 5);
        assert_eq!(
            gate.engine().metrics().race_lost.load(Ordering::Relaxed),
            1
        );
        assert!(logs_contain("lost the race"));
    }

    #[tokio::test]
    async fn test_post_state_reflects_the_increment() {
        let f = fixture();
        let outcome = f
            .gate
            .execute("acct_1", "simulation", || async { Ok::<_, String>(()) })
            .await
            .unwrap();
        let ExecutionOutcome::Admitted { decision, .. } = outcome else {
            panic!("expected admission");
        };
        assert_eq!(decision.current_count, 1);
        assert_eq!(decision.remaining(), Some(4));
    }

    #[tokio::test]
    async fn test_rollover_restores_the_allowance() {
        let f = fixture();
        let start = Utc::now() - chrono::Duration::days(31);
        f.store.insert_record(crate::usage::UsageRecord {
            account_id: "acct_1".to_string(),
            count: 5,
            period_start: start,
            period_end: start + chrono::Duration::days(30),
            updated_at: start,
        });

        let outcome = f
            .gate
            .execute("acct_1", "simulation", || async { Ok::<_, String>(()) })
            .await
            .unwrap();
        let ExecutionOutcome::Admitted { decision, .. } = outcome else {
            panic!("expected admission after rollover");
        };
        assert_eq!(decision.current_count, 1);
    }
}
