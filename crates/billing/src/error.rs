//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Coarse classification handed to callers (webhook handlers, controllers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    InvalidState,
    DependencyUnavailable,
    ProviderError,
}

#[derive(Debug, Clone, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Transport failure, provider 5xx/429, or an exhausted retry budget
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// The provider gave a definitive answer (declined card, invalid request)
    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BillingError::InvalidState(_) => ErrorKind::InvalidState,
            BillingError::ProviderError(_) => ErrorKind::ProviderError,
            // A local store outage is just another unavailable dependency to callers
            BillingError::DependencyUnavailable(_)
            | BillingError::Database(_)
            | BillingError::Config(_) => ErrorKind::DependencyUnavailable,
        }
    }

    /// Whether repeating the same provider call could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::DependencyUnavailable(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            stripe::StripeError::Stripe(request_error) => {
                let message = request_error
                    .message
                    .clone()
                    .unwrap_or_else(|| request_error.to_string());
                if request_error.http_status == 429 || request_error.http_status >= 500 {
                    BillingError::DependencyUnavailable(format!(
                        "Stripe returned {}: {}",
                        request_error.http_status, message
                    ))
                } else {
                    BillingError::ProviderError(message)
                }
            }
            other => BillingError::DependencyUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            BillingError::NotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            BillingError::InvalidState("x".into()).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            BillingError::Database("pool timed out".into()).kind(),
            ErrorKind::DependencyUnavailable
        );
        assert_eq!(
            BillingError::ProviderError("card_declined".into()).kind(),
            ErrorKind::ProviderError
        );
    }

    #[test]
    fn test_only_dependency_errors_are_transient() {
        assert!(BillingError::DependencyUnavailable("timeout".into()).is_transient());
        assert!(!BillingError::ProviderError("declined".into()).is_transient());
        assert!(!BillingError::Database("gone".into()).is_transient());
    }
}
