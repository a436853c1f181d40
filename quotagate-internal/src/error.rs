use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::fmt::Display;

/// Crate-wide error type.
///
/// Errors are logged once, at construction, with a severity chosen per
/// variant. Call sites that intentionally skip logging (e.g. when the error
/// is about to be absorbed into a fail-open decision that logs its own
/// warning) can use [`Error::new_without_logging`].
// We box `ErrorDetails` per the `clippy::result_large_err` lint
#[derive(Debug, Clone, PartialEq)]
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    /// The usage record store could not be read or written. Whether this
    /// admits or denies is the engine's call (`fail_open`), not ours.
    StoreUnavailable {
        message: String,
    },
    /// The subscription read model could not be fetched or parsed. Always
    /// resolved toward "not subscribed" by the engine.
    SubscriptionLookupFailed {
        message: String,
    },
    SubscriptionNotFound {
        account_id: String,
    },
    Serialization {
        message: String,
    },
    InternalError {
        message: String,
    },
}

impl ErrorDetails {
    /// HTTP status code for responses that surface this error.
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::SubscriptionLookupFailed { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::SubscriptionNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Log the error at an appropriate level.
    fn log(&self) {
        match self {
            ErrorDetails::Config { .. } | ErrorDetails::InternalError { .. } => {
                tracing::error!("{self}");
            }
            ErrorDetails::StoreUnavailable { .. }
            | ErrorDetails::SubscriptionLookupFailed { .. }
            | ErrorDetails::Serialization { .. } => {
                tracing::warn!("{self}");
            }
            ErrorDetails::SubscriptionNotFound { .. } => {
                tracing::debug!("{self}");
            }
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Config { message } => {
                write!(f, "Config error: {message}")
            }
            ErrorDetails::StoreUnavailable { message } => {
                write!(f, "Usage record store unavailable: {message}")
            }
            ErrorDetails::SubscriptionLookupFailed { message } => {
                write!(f, "Subscription lookup failed: {message}")
            }
            ErrorDetails::SubscriptionNotFound { account_id } => {
                write!(f, "No subscription record for account {account_id}")
            }
            ErrorDetails::Serialization { message } => {
                write!(f, "Serialization error: {message}")
            }
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = json!({"error": self.to_string()});
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = Error::new_without_logging(ErrorDetails::StoreUnavailable {
            message: "connection refused".to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err = Error::new_without_logging(ErrorDetails::SubscriptionNotFound {
            account_id: "acct_1".to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::new_without_logging(ErrorDetails::SubscriptionLookupFailed {
            message: "timeout".to_string(),
        });
        assert!(err.to_string().contains("timeout"));
    }
}
