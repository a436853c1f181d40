use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::quota::QuotaDecision;

/// Display band for the remaining-quota UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSeverity {
    Ok,
    Warning,
    Exhausted,
}

/// Display-oriented summary of an account's quota standing. A read-side
/// view only; the decision it was derived from is the authority.
#[derive(Debug, Clone, Serialize)]
pub struct DisplayStatus {
    pub message: String,
    pub severity: StatusSeverity,
    /// Remaining free-tier uses; absent for unlimited accounts
    pub remaining: Option<u32>,
    /// When the free-tier allowance resets; absent for unlimited accounts
    pub resets_on: Option<DateTime<Utc>>,
}

/// Pure projection from decisions to display state. Safe to recompute on
/// every render.
#[derive(Debug, Clone, Copy)]
pub struct StatusProjector {
    warning_threshold: u32,
}

impl StatusProjector {
    pub fn new(warning_threshold: u32) -> Self {
        Self { warning_threshold }
    }

    pub fn project(&self, decision: &QuotaDecision) -> DisplayStatus {
        if decision.is_subscribed {
            let message = if decision.cancel_at_period_end {
                match decision.period_end {
                    Some(end) => format!(
                        "Your subscription is active until {}",
                        end.format("%B %-d, %Y")
                    ),
                    None => "Your subscription is active until the end of the billing period"
                        .to_string(),
                }
            } else {
                "Unlimited use with your subscription".to_string()
            };
            return DisplayStatus {
                message,
                severity: StatusSeverity::Ok,
                remaining: None,
                resets_on: None,
            };
        }

        // Unlimited without a subscription means the store was unreachable
        // and the engine admitted fail-open; there is no meaningful count
        // to show.
        let Some(remaining) = decision.remaining() else {
            return DisplayStatus {
                message: "Usage tracking is temporarily unavailable".to_string(),
                severity: StatusSeverity::Ok,
                remaining: None,
                resets_on: None,
            };
        };

        if remaining == 0 {
            let message = match decision.period_end {
                Some(end) => format!(
                    "You've used all your free runs. Your allowance resets on {}",
                    end.format("%B %-d, %Y")
                ),
                None => "You've used all your free runs for this period".to_string(),
            };
            return DisplayStatus {
                message,
                severity: StatusSeverity::Exhausted,
                remaining: Some(0),
                resets_on: decision.period_end,
            };
        }

        let severity = if remaining <= self.warning_threshold {
            StatusSeverity::Warning
        } else {
            StatusSeverity::Ok
        };
        DisplayStatus {
            message: format!(
                "{remaining} of {} free runs left this period",
                decision.limit
            ),
            severity,
            remaining: Some(remaining),
            resets_on: decision.period_end,
        }
    }
}
