//! Local persistence of subscription records

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{PaymentIntentRecord, SubscriptionRecord};

/// Everything one lifecycle operation writes locally. Stores apply it
/// all-or-nothing.
#[derive(Debug, Clone)]
pub struct LocalChanges {
    pub subscription: SubscriptionRecord,
    /// Delete the account's existing row before inserting (free -> paid)
    pub replace_existing: bool,
    pub payment_intent: Option<PaymentIntentRecord>,
}

impl LocalChanges {
    pub fn record(subscription: SubscriptionRecord) -> Self {
        Self {
            subscription,
            replace_existing: false,
            payment_intent: None,
        }
    }

    pub fn replacing(mut self) -> Self {
        self.replace_existing = true;
        self
    }

    pub fn with_payment_intent(mut self, payment_intent: PaymentIntentRecord) -> Self {
        self.payment_intent = Some(payment_intent);
        self
    }
}

/// Subscription records (one per account) and the payment-intent mirror
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_account(&self, account_id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    /// Look up by provider subscription ref, or by a free placeholder ref
    async fn find_by_provider_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Upsert the record keyed by account id, plus the optional payment intent, in one transaction
    async fn commit(&self, changes: LocalChanges) -> BillingResult<()>;

    /// Returns whether a row was removed
    async fn delete_by_account(&self, account_id: Uuid) -> BillingResult<bool>;

    /// Records in pending_payment/incomplete not touched since `updated_before`, oldest first
    async fn list_awaiting_settlement(
        &self,
        updated_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionRecord>>;

    async fn find_payment_intent(
        &self,
        payment_intent_ref: &str,
    ) -> BillingResult<Option<PaymentIntentRecord>>;

    /// Most recently created mirror for a provider subscription
    async fn latest_payment_intent(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<PaymentIntentRecord>>;
}
