use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::error::Error;
use crate::quota::{DisplayStatus, QuotaDecision, QuotaEngine, StatusProjector};
use crate::subscription::{CachedSubscriptionOracle, SubscriptionAdmin, SubscriptionView};

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QuotaEngine>,
    pub projector: StatusProjector,
    pub subscriptions: Arc<dyn SubscriptionAdmin>,
    /// Held so a resume write can drop the account's cached view
    pub oracle_cache: Option<Arc<CachedSubscriptionOracle>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/quota/{account_id}", get(quota_status))
        .route(
            "/v1/subscription/{account_id}/resume",
            post(resume_subscription),
        )
        .with_state(state)
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Serialize)]
pub struct QuotaStatusResponse {
    pub decision: QuotaDecision,
    pub display: DisplayStatus,
}

/// Read-side projection of an account's quota standing. Not authoritative:
/// the gate recomputes the decision when the feature actually runs.
pub async fn quota_status(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Json<QuotaStatusResponse> {
    let decision = state.engine.decide(&account_id).await;
    let display = state.projector.project(&decision);
    Json(QuotaStatusResponse { decision, display })
}

/// Idempotently clear a pending cancellation.
pub async fn resume_subscription(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<SubscriptionView>, Error> {
    let view = state.subscriptions.resume(&account_id).await?;
    if let Some(cache) = &state.oracle_cache {
        cache.invalidate(&account_id).await;
    }
    info!(account_id, "cleared pending subscription cancellation");
    Ok(Json(view))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaConfig;
    use crate::quota::{QuotaLimit, QuotaMetrics};
    use crate::subscription::{InMemorySubscriptionStore, SubscriptionOracle, SubscriptionStatus};
    use crate::usage::{InMemoryHistorySink, InMemoryUsageStore, UsageHistorySink, UsageRecordStore};
    use chrono::Utc;

    fn state_with(subscriptions: Arc<InMemorySubscriptionStore>) -> AppState {
        let config = QuotaConfig::default();
        let store = Arc::new(InMemoryUsageStore::new(config.period()));
        let projector = StatusProjector::new(config.warning_threshold);
        let engine = Arc::new(QuotaEngine::new(
            store as Arc<dyn UsageRecordStore>,
            Arc::clone(&subscriptions) as Arc<dyn SubscriptionOracle>,
            Arc::new(InMemoryHistorySink::new()) as Arc<dyn UsageHistorySink>,
            config,
            Arc::new(QuotaMetrics::default()),
        ));
        AppState {
            engine,
            projector,
            subscriptions,
            oracle_cache: None,
        }
    }

    #[tokio::test]
    async fn test_quota_status_for_a_fresh_account() {
        let state = state_with(Arc::new(InMemorySubscriptionStore::new()));
        let Json(response) = quota_status(State(state), Path("acct_1".to_string())).await;
        assert!(response.decision.can_use);
        assert_eq!(response.decision.limit, QuotaLimit::Limited(5));
        assert_eq!(response.display.remaining, Some(5));
    }

    #[tokio::test]
    async fn test_resume_clears_the_flag_and_returns_the_view() {
        let subscriptions = Arc::new(InMemorySubscriptionStore::new());
        subscriptions.set_active("acct_1", Some(Utc::now() + chrono::Duration::days(7)));
        subscriptions.set_cancel_at_period_end("acct_1", true);

        let state = state_with(Arc::clone(&subscriptions));
        let Json(view) = resume_subscription(State(state), Path("acct_1".to_string()))
            .await
            .unwrap();
        assert!(!view.cancel_at_period_end);
        assert_eq!(view.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_resume_for_an_unknown_account_is_404() {
        let state = state_with(Arc::new(InMemorySubscriptionStore::new()));
        let err = resume_subscription(State(state), Path("acct_missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }
}
