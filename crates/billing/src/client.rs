//! Stripe client and billing configuration

use std::time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::retry::{Backoff, RetryPolicy};

/// Credentials for the Stripe account. Lives inside the gateway, never in process globals.
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        if secret_key.trim().is_empty() {
            return Err(BillingError::Config(
                "STRIPE_SECRET_KEY is empty".to_string(),
            ));
        }

        Ok(Self { secret_key })
    }
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[redacted]")
            .finish()
    }
}

/// Thin wrapper around the async-stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    /// Client that sends the given Idempotency-Key on every request
    pub fn idempotent(&self, key: &str) -> stripe::Client {
        self.inner
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key.to_string()))
    }
}

/// Tunables for the lifecycle engine
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Polling budget while waiting for a new subscription's invoice to carry a payment intent
    pub confirmation_retry: RetryPolicy,
    /// Retry budget for individual transient provider failures
    pub provider_retry: RetryPolicy,
    /// Used when the provider omits a period end
    pub fallback_period: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            confirmation_retry: RetryPolicy::new(5, Backoff::Fixed(Duration::from_secs(2))),
            provider_retry: RetryPolicy::new(
                3,
                Backoff::Exponential {
                    base: Duration::from_millis(200),
                    max: Duration::from_secs(5),
                },
            ),
            fallback_period: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let confirmation_attempts = env_parse("BILLING_CONFIRMATION_MAX_ATTEMPTS", 5usize)?;
        let confirmation_delay_ms = env_parse("BILLING_CONFIRMATION_RETRY_DELAY_MS", 2_000u64)?;
        let provider_attempts = env_parse("BILLING_PROVIDER_MAX_ATTEMPTS", 3usize)?;
        let provider_base_ms = env_parse("BILLING_PROVIDER_RETRY_BASE_MS", 200u64)?;
        let fallback_days = env_parse("BILLING_FALLBACK_PERIOD_DAYS", 30u64)?;

        if confirmation_attempts == 0 || provider_attempts == 0 {
            return Err(BillingError::Config(
                "retry attempt budgets must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            confirmation_retry: RetryPolicy::new(
                confirmation_attempts,
                Backoff::Fixed(Duration::from_millis(confirmation_delay_ms)),
            ),
            provider_retry: RetryPolicy::new(
                provider_attempts,
                Backoff::Exponential {
                    base: Duration::from_millis(provider_base_ms),
                    max: Duration::from_secs(5),
                },
            ),
            fallback_period: Duration::from_secs(fallback_days * 24 * 60 * 60),
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}
