//! Refunds for immediate cancellations
//!
//! The refund covers the unused share of the current period, measured in
//! seconds between the record's creation and its next billing date.

use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::gateway::{ProviderGateway, RefundRequest};
use crate::models::{PaymentIntentRecord, SubscriptionRecord};

/// Result of a refund operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundResult {
    pub provider_refund_ref: String,
    /// Payment intent the refund was issued against
    pub payment_intent_ref: String,
    pub amount: Decimal,
    pub currency: String,
}

pub struct RefundService {
    gateway: Arc<dyn ProviderGateway>,
}

impl RefundService {
    pub fn new(gateway: Arc<dyn ProviderGateway>) -> Self {
        Self { gateway }
    }

    /// Prorated refund for the unused part of the period
    ///
    /// Zero when there is no next billing date, the period is over, or the
    /// period has no length. Always rounds down to whole minor units to avoid
    /// over-refunding.
    pub fn calculate_prorated_amount(
        total: Decimal,
        created_at: OffsetDateTime,
        next_billing_date: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Decimal {
        let Some(next_billing) = next_billing_date else {
            return Decimal::ZERO;
        };
        if now >= next_billing {
            return Decimal::ZERO;
        }

        let total_secs = (next_billing - created_at).whole_seconds();
        if total_secs <= 0 {
            return Decimal::ZERO;
        }
        let remaining_secs = (next_billing - now).whole_seconds().min(total_secs);

        let prorated = total * Decimal::from(remaining_secs) / Decimal::from(total_secs);
        prorated
            .round_dp_with_strategy(2, RoundingStrategy::ToZero)
            .max(Decimal::ZERO)
    }

    /// Compute and issue the refund for an immediately canceled subscription.
    /// Returns `None` when the computed amount is zero.
    pub async fn refund_unused_period(
        &self,
        record: &SubscriptionRecord,
        last_payment: &PaymentIntentRecord,
        now: OffsetDateTime,
    ) -> BillingResult<Option<RefundResult>> {
        let amount = Self::calculate_prorated_amount(
            last_payment.amount,
            record.created_at,
            record.next_billing_date,
            now,
        );

        if amount.is_zero() {
            tracing::info!(
                account_id = %record.account_id,
                subscription_ref = %record.subscription_ref(),
                "No refund due for canceled subscription"
            );
            return Ok(None);
        }

        let refund = self
            .gateway
            .refund(&RefundRequest {
                payment_intent_ref: last_payment.provider_payment_intent_ref.clone(),
                amount,
                reason: "requested_by_customer".to_string(),
                idempotency_key: format!("refund-{}", last_payment.provider_payment_intent_ref),
            })
            .await?;

        tracing::info!(
            account_id = %record.account_id,
            subscription_ref = %record.subscription_ref(),
            refund_id = %refund.id,
            amount = %amount,
            "Issued refund"
        );

        Ok(Some(RefundResult {
            provider_refund_ref: refund.id,
            payment_intent_ref: last_payment.provider_payment_intent_ref.clone(),
            amount,
            currency: last_payment.currency.clone(),
        }))
    }
}
