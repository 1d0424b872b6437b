//! Payment confirmation
//!
//! Called once the client has authenticated a payment intent (or by the
//! reconciliation sweep). A succeeded intent activates the subscription and
//! then nudges the provider's invoice into a paid state; everything after
//! activation is best-effort.

use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventType};
use crate::gateway::InvoiceStatus;
use crate::models::{PaymentIntentRecord, PaymentIntentStatus, SubscriptionRecord, SubscriptionStatus};
use crate::store::LocalChanges;
use crate::subscriptions::SubscriptionLifecycleEngine;

impl SubscriptionLifecycleEngine {
    /// Apply the provider's verdict on a payment intent to the subscription
    pub async fn confirm_payment(
        &self,
        subscription_ref: &str,
        payment_intent_ref: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let mut record = self.find_by_ref(subscription_ref).await?;
        self.validator
            .not_free_placeholder(&record, "confirm payment for")?;
        let mut mirror = self
            .store
            .find_payment_intent(payment_intent_ref)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Payment intent {} not found", payment_intent_ref))
            })?;
        if mirror.account_id != record.account_id
            || mirror.metadata.provider_subscription_ref != subscription_ref
        {
            return Err(BillingError::NotFound(format!(
                "Payment intent {} not found for subscription {}",
                payment_intent_ref, subscription_ref
            )));
        }

        // Only records still waiting on a payment can be settled by one
        match record.status {
            SubscriptionStatus::PendingPayment | SubscriptionStatus::Incomplete => {}
            SubscriptionStatus::Canceled => {
                return Err(BillingError::InvalidState(format!(
                    "Cannot confirm payment for canceled subscription {}",
                    subscription_ref
                )));
            }
            _ => {
                tracing::debug!(
                    subscription_ref = %subscription_ref,
                    payment_intent_ref = %payment_intent_ref,
                    status = %record.status,
                    "Subscription not awaiting payment, confirmation ignored"
                );
                return Ok(record);
            }
        }

        let intent = self.gateway.retrieve_payment_intent(payment_intent_ref).await?;
        mirror.set_status(intent.status.clone());
        if intent.payment_method_ref.is_some() {
            mirror.payment_method_ref = intent.payment_method_ref;
        }

        let now = OffsetDateTime::now_utc();
        let event_type = match &intent.status {
            PaymentIntentStatus::Succeeded => {
                record.set_status(SubscriptionStatus::Active);
                record.last_payment_date = Some(now);
                record.pending_plan_change = false;
                if record.next_billing_date.is_none() {
                    record.next_billing_date = Some(self.period_end_or_fallback(None, now));
                }
                BillingEventType::PaymentConfirmed
            }
            PaymentIntentStatus::Processing | PaymentIntentStatus::RequiresAction => {
                record.set_status(SubscriptionStatus::Incomplete);
                BillingEventType::PaymentPending
            }
            other => {
                tracing::warn!(
                    account_id = %record.account_id,
                    subscription_ref = %subscription_ref,
                    payment_intent_ref = %payment_intent_ref,
                    status = %other,
                    "Payment failed"
                );
                record.set_status(SubscriptionStatus::Incomplete);
                BillingEventType::PaymentFailed
            }
        };
        record.touch(now);

        self.store
            .commit(LocalChanges::record(record.clone()).with_payment_intent(mirror.clone()))
            .await?;

        tracing::info!(
            account_id = %record.account_id,
            subscription_ref = %subscription_ref,
            payment_intent_ref = %payment_intent_ref,
            payment_status = %mirror.status,
            status = %record.status,
            "Processed payment confirmation"
        );

        if event_type == BillingEventType::PaymentConfirmed {
            self.remediate_invoice(&mut record, &mirror).await;
        }

        self.emit(
            BillingEventBuilder::new(record.account_id, event_type)
                .subscription_ref(subscription_ref)
                .data(serde_json::json!({
                    "payment_intent_ref": payment_intent_ref,
                    "payment_status": mirror.status.as_str(),
                    "amount": mirror.amount.to_string(),
                }))
                .build(),
        )
        .await;

        Ok(record)
    }

    /// Bring the provider invoice in line with a payment that already
    /// succeeded. Every step logs and moves on when it fails; the activation
    /// is already committed.
    async fn remediate_invoice(&self, record: &mut SubscriptionRecord, payment: &PaymentIntentRecord) {
        let subscription_ref = record.subscription_ref().to_string();
        let payment_intent_ref = payment.provider_payment_intent_ref.as_str();
        let now = OffsetDateTime::now_utc();

        let provider_sub = match self.gateway.retrieve_subscription(&subscription_ref).await {
            Ok(sub) => sub,
            Err(e) => {
                tracing::warn!(
                    subscription_ref = %subscription_ref,
                    error = %e,
                    "Could not refresh subscription after payment"
                );
                return;
            }
        };
        record.next_billing_date =
            Some(self.period_end_or_fallback(provider_sub.current_period_end, now));
        record.cancel_at_period_end = provider_sub.cancel_at_period_end;

        if let Some(invoice_ref) = provider_sub.latest_invoice_ref.as_deref() {
            self.settle_invoice(invoice_ref, payment).await;
        }

        record.touch(now);
        if let Err(e) = self.store.commit(LocalChanges::record(record.clone())).await {
            tracing::warn!(
                subscription_ref = %subscription_ref,
                payment_intent_ref = %payment_intent_ref,
                error = %e,
                "Failed to persist refreshed billing dates"
            );
        }
    }

    /// Draft -> finalize -> pay, falling back to marking it paid out of band.
    /// Keys derive from the payment intent so a repeated confirmation never
    /// double-applies a step.
    async fn settle_invoice(&self, invoice_ref: &str, payment: &PaymentIntentRecord) {
        let payment_intent_ref = payment.provider_payment_intent_ref.as_str();

        let invoice = match self.gateway.retrieve_invoice(invoice_ref).await {
            Ok(invoice) => invoice,
            Err(e) => {
                tracing::warn!(invoice_ref = %invoice_ref, error = %e, "Could not retrieve invoice");
                return;
            }
        };

        let mut status = invoice.status;
        if status == InvoiceStatus::Draft {
            match self
                .gateway
                .finalize_invoice(invoice_ref, &format!("finalize-{}", payment_intent_ref))
                .await
            {
                Ok(finalized) => {
                    tracing::info!(invoice_ref = %invoice_ref, "Finalized draft invoice");
                    status = match finalized.status {
                        InvoiceStatus::Draft => InvoiceStatus::Open,
                        other => other,
                    };
                }
                Err(e) => {
                    tracing::warn!(invoice_ref = %invoice_ref, error = %e, "Failed to finalize invoice");
                    return;
                }
            }
        }

        if status != InvoiceStatus::Open {
            tracing::debug!(invoice_ref = %invoice_ref, status = ?status, "Invoice needs no remediation");
            return;
        }

        match self
            .gateway
            .pay_invoice(
                invoice_ref,
                payment.payment_method_ref.as_deref(),
                &format!("pay-{}", payment_intent_ref),
            )
            .await
        {
            Ok(_) => {
                tracing::info!(invoice_ref = %invoice_ref, "Paid open invoice");
            }
            Err(e) => {
                tracing::warn!(
                    invoice_ref = %invoice_ref,
                    error = %e,
                    "Failed to pay invoice, marking paid out of band"
                );
                match self
                    .gateway
                    .mark_invoice_paid_out_of_band(
                        invoice_ref,
                        &format!("paid-out-of-band-{}", payment_intent_ref),
                    )
                    .await
                {
                    Ok(_) => {
                        tracing::info!(invoice_ref = %invoice_ref, "Marked invoice paid out of band")
                    }
                    Err(e) => tracing::warn!(
                        invoice_ref = %invoice_ref,
                        error = %e,
                        "Failed to mark invoice paid out of band"
                    ),
                }
            }
        }
    }
}
