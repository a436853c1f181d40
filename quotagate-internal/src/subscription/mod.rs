pub mod cache;
pub mod memory;
pub mod redis;

pub use cache::CachedSubscriptionOracle;
pub use memory::InMemorySubscriptionStore;
pub use redis::RedisSubscriptionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Paid-plan status as the billing system reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Active,
}

/// Read model of an account's subscription. Owned by the external billing
/// system; this subsystem reads it and exposes exactly one write, `resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionView {
    pub account_id: String,
    pub status: SubscriptionStatus,
    /// Set when the account is paid but scheduled to lapse. Does not demote
    /// the account before `current_period_end` passes; the billing system
    /// owns that transition.
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub current_period_end: Option<DateTime<Utc>>,
}

impl SubscriptionView {
    /// The view for an account with no subscription record.
    pub fn none(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            status: SubscriptionStatus::None,
            cancel_at_period_end: false,
            current_period_end: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

/// Read-only, side-effect-free view of subscription state. May be cached
/// for a few seconds but is never the source of truth for billing.
#[async_trait]
pub trait SubscriptionOracle: Send + Sync {
    /// A missing record resolves to `SubscriptionView::none`, not an error;
    /// errors mean the lookup itself failed and the engine must fall back
    /// to the not-subscribed path.
    async fn get_view(&self, account_id: &str) -> Result<SubscriptionView, Error>;
}

/// The one subscription write this subsystem exposes to the surrounding
/// application.
#[async_trait]
pub trait SubscriptionAdmin: Send + Sync {
    /// Idempotently clear `cancel_at_period_end`, leaving `status` and
    /// `current_period_end` untouched. Errors with `SubscriptionNotFound`
    /// when the account has no subscription record.
    async fn resume(&self, account_id: &str) -> Result<SubscriptionView, Error>;
}
