//! Payment intent resolution for freshly created or updated subscriptions
//!
//! With deferred payment the provider attaches a payment intent to the
//! subscription's latest invoice asynchronously. We poll the invoice a fixed
//! number of times, then fall back to the intent ref embedded on the
//! subscription object itself.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ProviderGateway, ProviderPaymentIntent, ProviderSubscription};
use crate::retry::{RetryOutcome, RetryPolicy};

pub struct PaymentConfirmationResolver {
    gateway: Arc<dyn ProviderGateway>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl PaymentConfirmationResolver {
    pub fn new(gateway: Arc<dyn ProviderGateway>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            gateway,
            policy,
            cancel,
        }
    }

    pub async fn resolve(
        &self,
        subscription: &ProviderSubscription,
    ) -> BillingResult<ProviderPaymentIntent> {
        if let Some(invoice_ref) = subscription.latest_invoice_ref.as_deref() {
            match self
                .policy
                .run(&self.cancel, || self.from_invoice(invoice_ref), |_| true)
                .await
            {
                RetryOutcome::Succeeded(intent) => return Ok(intent),
                RetryOutcome::Exhausted(e) | RetryOutcome::Aborted(e) => {
                    tracing::warn!(
                        subscription_ref = %subscription.id,
                        invoice_ref = %invoice_ref,
                        attempts = self.policy.max_attempts,
                        error = %e,
                        "Invoice never exposed a payment intent, trying subscription fallback"
                    );
                }
                RetryOutcome::Cancelled => {
                    tracing::info!(
                        subscription_ref = %subscription.id,
                        "Payment intent lookup cancelled, trying subscription fallback"
                    );
                }
            }
        }

        match subscription.embedded_payment_intent_ref.as_deref() {
            Some(payment_intent_ref) => {
                tracing::info!(
                    subscription_ref = %subscription.id,
                    payment_intent_ref = %payment_intent_ref,
                    "Resolved payment intent from subscription fallback"
                );
                self.gateway.retrieve_payment_intent(payment_intent_ref).await
            }
            None => Err(BillingError::DependencyUnavailable(
                "subscription creation did not complete properly".to_string(),
            )),
        }
    }

    async fn from_invoice(&self, invoice_ref: &str) -> BillingResult<ProviderPaymentIntent> {
        let invoice = self.gateway.retrieve_invoice(invoice_ref).await?;
        match invoice.payment_intent_ref {
            Some(payment_intent_ref) => self.gateway.retrieve_payment_intent(&payment_intent_ref).await,
            None => Err(BillingError::DependencyUnavailable(format!(
                "invoice {} has no payment intent yet",
                invoice_ref
            ))),
        }
    }
}
