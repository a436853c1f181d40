use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{Error, ErrorDetails};
use crate::subscription::{
    SubscriptionAdmin, SubscriptionOracle, SubscriptionStatus, SubscriptionView,
};

/// In-process subscription store. Serves tests and single-process
/// deployments; writes other than `resume` model what the billing webhook
/// handler would do.
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    views: DashMap<String, SubscriptionView>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace an account's subscription record, as the billing
    /// webhook would.
    pub fn set_view(&self, view: SubscriptionView) {
        self.views.insert(view.account_id.clone(), view);
    }

    pub fn set_active(&self, account_id: &str, current_period_end: Option<DateTime<Utc>>) {
        self.set_view(SubscriptionView {
            account_id: account_id.to_string(),
            status: SubscriptionStatus::Active,
            cancel_at_period_end: false,
            current_period_end,
        });
    }

    pub fn set_status(&self, account_id: &str, status: SubscriptionStatus) {
        if let Some(mut view) = self.views.get_mut(account_id) {
            view.status = status;
        }
    }

    pub fn set_cancel_at_period_end(&self, account_id: &str, cancel: bool) {
        if let Some(mut view) = self.views.get_mut(account_id) {
            view.cancel_at_period_end = cancel;
        }
    }
}

#[async_trait]
impl SubscriptionOracle for InMemorySubscriptionStore {
    async fn get_view(&self, account_id: &str) -> Result<SubscriptionView, Error> {
        Ok(self
            .views
            .get(account_id)
            .map(|view| view.clone())
            .unwrap_or_else(|| SubscriptionView::none(account_id)))
    }
}

#[async_trait]
impl SubscriptionAdmin for InMemorySubscriptionStore {
    async fn resume(&self, account_id: &str) -> Result<SubscriptionView, Error> {
        let mut view = self.views.get_mut(account_id).ok_or_else(|| {
            Error::new(ErrorDetails::SubscriptionNotFound {
                account_id: account_id.to_string(),
            })
        })?;
        view.cancel_at_period_end = false;
        Ok(view.clone())
    }
}
