//! Provider gateway
//!
//! The lifecycle engine talks to the billing provider only through
//! [`ProviderGateway`]. Amounts cross this boundary as decimals in major
//! units; adapters convert to whatever the provider speaks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{PaymentIntentStatus, SubscriptionStatus};
use crate::retry::{RetryOutcome, RetryPolicy};

/// Provider-side subscription status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSubscriptionStatus {
    Active,
    Trialing,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Unpaid,
    Canceled,
    Paused,
    Other(String),
}

impl ProviderSubscriptionStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => ProviderSubscriptionStatus::Active,
            "trialing" => ProviderSubscriptionStatus::Trialing,
            "incomplete" => ProviderSubscriptionStatus::Incomplete,
            "incomplete_expired" => ProviderSubscriptionStatus::IncompleteExpired,
            "past_due" => ProviderSubscriptionStatus::PastDue,
            "unpaid" => ProviderSubscriptionStatus::Unpaid,
            "canceled" => ProviderSubscriptionStatus::Canceled,
            "paused" => ProviderSubscriptionStatus::Paused,
            other => ProviderSubscriptionStatus::Other(other.to_string()),
        }
    }

    /// Local status implied by the provider's view of the subscription
    pub fn to_local(&self, cancel_at_period_end: bool) -> SubscriptionStatus {
        match self {
            ProviderSubscriptionStatus::Active | ProviderSubscriptionStatus::Trialing => {
                if cancel_at_period_end {
                    SubscriptionStatus::CanceledAtPeriodEnd
                } else {
                    SubscriptionStatus::Active
                }
            }
            ProviderSubscriptionStatus::Canceled | ProviderSubscriptionStatus::IncompleteExpired => {
                SubscriptionStatus::Canceled
            }
            ProviderSubscriptionStatus::Incomplete
            | ProviderSubscriptionStatus::PastDue
            | ProviderSubscriptionStatus::Unpaid
            | ProviderSubscriptionStatus::Paused
            | ProviderSubscriptionStatus::Other(_) => SubscriptionStatus::Incomplete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_ref: String,
    pub status: ProviderSubscriptionStatus,
    pub price_ref: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub latest_invoice_ref: Option<String>,
    /// Payment intent ref carried on the subscription object itself
    /// (metadata or pending intent), used when the invoice never shows one
    pub embedded_payment_intent_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
    Other(String),
}

impl InvoiceStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "draft" => InvoiceStatus::Draft,
            "open" => InvoiceStatus::Open,
            "paid" => InvoiceStatus::Paid,
            "uncollectible" => InvoiceStatus::Uncollectible,
            "void" => InvoiceStatus::Void,
            other => InvoiceStatus::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInvoice {
    pub id: String,
    pub status: InvoiceStatus,
    pub payment_intent_ref: Option<String>,
    pub amount_due: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPaymentIntent {
    pub id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentIntentStatus,
    pub client_secret: Option<String>,
    pub payment_method_ref: Option<String>,
    pub customer_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRefund {
    pub id: String,
    pub amount: Decimal,
    pub status: String,
}

/// How the provider should bill a price change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProrationBehavior {
    /// Invoice the prorated difference immediately
    AlwaysInvoice,
    /// Add proration items to the next invoice
    CreateProrations,
    None,
}

#[derive(Debug, Clone)]
pub struct EnsureCustomerRequest {
    pub account_id: Uuid,
    pub existing_customer_ref: Option<String>,
    pub payment_method_ref: Option<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub customer_ref: String,
    pub price_ref: String,
    pub payment_method_ref: Option<String>,
    pub metadata: HashMap<String, String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSubscriptionRequest {
    pub price_ref: Option<String>,
    pub proration: Option<ProrationBehavior>,
    /// Leave the new invoice open for client-side confirmation instead of failing the update
    pub defer_payment: bool,
    pub cancel_at_period_end: Option<bool>,
    pub metadata: HashMap<String, String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CancelSubscriptionRequest {
    pub prorate: bool,
    pub invoice_now: bool,
}

#[derive(Debug, Clone)]
pub struct CreatePaymentIntentRequest {
    pub amount: Decimal,
    pub currency: String,
    pub customer_ref: String,
    pub payment_method_ref: Option<String>,
    pub metadata: HashMap<String, String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub payment_intent_ref: String,
    pub amount: Decimal,
    pub reason: String,
    pub idempotency_key: String,
}

/// Operations against the external billing provider
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Return the existing customer or create one; returns the customer ref
    async fn ensure_customer(&self, request: &EnsureCustomerRequest) -> BillingResult<String>;

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription>;

    async fn update_subscription(
        &self,
        subscription_ref: &str,
        request: &UpdateSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription>;

    async fn cancel_subscription(
        &self,
        subscription_ref: &str,
        request: &CancelSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription>;

    async fn retrieve_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<ProviderSubscription>;

    async fn create_payment_intent(
        &self,
        request: &CreatePaymentIntentRequest,
    ) -> BillingResult<ProviderPaymentIntent>;

    async fn retrieve_payment_intent(
        &self,
        payment_intent_ref: &str,
    ) -> BillingResult<ProviderPaymentIntent>;

    async fn retrieve_invoice(&self, invoice_ref: &str) -> BillingResult<ProviderInvoice>;

    async fn pay_invoice(
        &self,
        invoice_ref: &str,
        payment_method_ref: Option<&str>,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice>;

    async fn mark_invoice_paid_out_of_band(
        &self,
        invoice_ref: &str,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice>;

    async fn finalize_invoice(
        &self,
        invoice_ref: &str,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice>;

    async fn refund(&self, request: &RefundRequest) -> BillingResult<ProviderRefund>;
}

/// Retries transient failures of the wrapped gateway
pub struct RetryingGateway {
    inner: Arc<dyn ProviderGateway>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryingGateway {
    pub fn new(inner: Arc<dyn ProviderGateway>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            inner,
            policy,
            cancel,
        }
    }

    async fn call<T, A, Fut>(&self, operation: &'static str, action: A) -> BillingResult<T>
    where
        A: FnMut() -> Fut + Send,
        Fut: Future<Output = BillingResult<T>> + Send,
        T: Send,
    {
        match self
            .policy
            .run(&self.cancel, action, BillingError::is_transient)
            .await
        {
            RetryOutcome::Succeeded(value) => Ok(value),
            RetryOutcome::Exhausted(e) => {
                tracing::error!(
                    operation = operation,
                    attempts = self.policy.max_attempts,
                    error = %e,
                    "Provider call failed after exhausting retries"
                );
                Err(BillingError::DependencyUnavailable(format!(
                    "{} failed after {} attempts: {}",
                    operation, self.policy.max_attempts, e
                )))
            }
            RetryOutcome::Aborted(e) => Err(e),
            RetryOutcome::Cancelled => Err(BillingError::DependencyUnavailable(format!(
                "{} cancelled before completion",
                operation
            ))),
        }
    }
}

#[async_trait]
impl ProviderGateway for RetryingGateway {
    async fn ensure_customer(&self, request: &EnsureCustomerRequest) -> BillingResult<String> {
        self.call("ensure_customer", || self.inner.ensure_customer(request))
            .await
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription> {
        self.call("create_subscription", || {
            self.inner.create_subscription(request)
        })
        .await
    }

    async fn update_subscription(
        &self,
        subscription_ref: &str,
        request: &UpdateSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription> {
        self.call("update_subscription", || {
            self.inner.update_subscription(subscription_ref, request)
        })
        .await
    }

    async fn cancel_subscription(
        &self,
        subscription_ref: &str,
        request: &CancelSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription> {
        self.call("cancel_subscription", || {
            self.inner.cancel_subscription(subscription_ref, request)
        })
        .await
    }

    async fn retrieve_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<ProviderSubscription> {
        self.call("retrieve_subscription", || {
            self.inner.retrieve_subscription(subscription_ref)
        })
        .await
    }

    async fn create_payment_intent(
        &self,
        request: &CreatePaymentIntentRequest,
    ) -> BillingResult<ProviderPaymentIntent> {
        self.call("create_payment_intent", || {
            self.inner.create_payment_intent(request)
        })
        .await
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_ref: &str,
    ) -> BillingResult<ProviderPaymentIntent> {
        self.call("retrieve_payment_intent", || {
            self.inner.retrieve_payment_intent(payment_intent_ref)
        })
        .await
    }

    async fn retrieve_invoice(&self, invoice_ref: &str) -> BillingResult<ProviderInvoice> {
        self.call("retrieve_invoice", || self.inner.retrieve_invoice(invoice_ref))
            .await
    }

    async fn pay_invoice(
        &self,
        invoice_ref: &str,
        payment_method_ref: Option<&str>,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice> {
        self.call("pay_invoice", || {
            self.inner
                .pay_invoice(invoice_ref, payment_method_ref, idempotency_key)
        })
        .await
    }

    async fn mark_invoice_paid_out_of_band(
        &self,
        invoice_ref: &str,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice> {
        self.call("mark_invoice_paid_out_of_band", || {
            self.inner
                .mark_invoice_paid_out_of_band(invoice_ref, idempotency_key)
        })
        .await
    }

    async fn finalize_invoice(
        &self,
        invoice_ref: &str,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice> {
        self.call("finalize_invoice", || {
            self.inner.finalize_invoice(invoice_ref, idempotency_key)
        })
        .await
    }

    async fn refund(&self, request: &RefundRequest) -> BillingResult<ProviderRefund> {
        self.call("refund", || self.inner.refund(request)).await
    }
}
