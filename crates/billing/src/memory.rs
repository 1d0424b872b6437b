//! In-memory adapters
//!
//! Used by tests and by embedders that keep billing state in process.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::{AuditSink, BillingEvent};
use crate::models::{PaymentIntentRecord, SubscriptionRecord};
use crate::plans::{PaymentMethod, PaymentMethodStore, Plan, PlanStore};
use crate::store::{LocalChanges, SubscriptionStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct SubscriptionTables {
    records: HashMap<Uuid, SubscriptionRecord>,
    payment_intents: Vec<PaymentIntentRecord>,
}

#[derive(Default)]
pub struct InMemorySubscriptionStore {
    tables: Mutex<SubscriptionTables>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        lock(&self.tables).records.len()
    }

    pub fn payment_intents(&self) -> Vec<PaymentIntentRecord> {
        lock(&self.tables).payment_intents.clone()
    }

    /// Write a record directly, bypassing the engine
    pub fn insert(&self, record: SubscriptionRecord) {
        lock(&self.tables).records.insert(record.account_id, record);
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn find_by_account(&self, account_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(lock(&self.tables).records.get(&account_id).cloned())
    }

    async fn find_by_provider_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(lock(&self.tables)
            .records
            .values()
            .find(|r| r.subscription_ref() == subscription_ref)
            .cloned())
    }

    async fn commit(&self, changes: LocalChanges) -> BillingResult<()> {
        let mut tables = lock(&self.tables);
        let account_id = changes.subscription.account_id;

        if changes.replace_existing {
            tables.records.remove(&account_id);
        }
        tables.records.insert(account_id, changes.subscription);

        if let Some(intent) = changes.payment_intent {
            match tables
                .payment_intents
                .iter_mut()
                .find(|p| p.provider_payment_intent_ref == intent.provider_payment_intent_ref)
            {
                Some(existing) => *existing = intent,
                None => tables.payment_intents.push(intent),
            }
        }
        Ok(())
    }

    async fn delete_by_account(&self, account_id: Uuid) -> BillingResult<bool> {
        Ok(lock(&self.tables).records.remove(&account_id).is_some())
    }

    async fn list_awaiting_settlement(
        &self,
        updated_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let tables = lock(&self.tables);
        let mut stale: Vec<_> = tables
            .records
            .values()
            .filter(|r| r.status.is_awaiting_settlement() && r.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(usize::try_from(limit.max(0)).unwrap_or(0));
        Ok(stale)
    }

    async fn find_payment_intent(
        &self,
        payment_intent_ref: &str,
    ) -> BillingResult<Option<PaymentIntentRecord>> {
        Ok(lock(&self.tables)
            .payment_intents
            .iter()
            .find(|p| p.provider_payment_intent_ref == payment_intent_ref)
            .cloned())
    }

    async fn latest_payment_intent(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<PaymentIntentRecord>> {
        Ok(lock(&self.tables)
            .payment_intents
            .iter()
            .filter(|p| p.metadata.provider_subscription_ref == subscription_ref)
            .max_by_key(|p| p.created_at)
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemoryPlanStore {
    plans: Mutex<HashMap<String, Plan>>,
}

impl InMemoryPlanStore {
    pub fn new(plans: impl IntoIterator<Item = Plan>) -> Self {
        Self {
            plans: Mutex::new(plans.into_iter().map(|p| (p.id.clone(), p)).collect()),
        }
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn by_id(&self, plan_id: &str) -> BillingResult<Option<Plan>> {
        Ok(lock(&self.plans).get(plan_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryPaymentMethodStore {
    methods: Mutex<Vec<PaymentMethod>>,
}

impl InMemoryPaymentMethodStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, method: PaymentMethod) {
        lock(&self.methods).push(method);
    }
}

#[async_trait]
impl PaymentMethodStore for InMemoryPaymentMethodStore {
    async fn list_for_account(&self, account_id: Uuid) -> BillingResult<Vec<PaymentMethod>> {
        Ok(lock(&self.methods)
            .iter()
            .filter(|m| m.account_id == account_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<BillingEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BillingEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: BillingEvent) -> BillingResult<()> {
        lock(&self.events).push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubscriptionStatus;

    #[tokio::test]
    async fn test_commit_upserts_by_account() {
        let store = InMemorySubscriptionStore::new();
        let account_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::new_free(account_id, OffsetDateTime::now_utc());

        store.commit(LocalChanges::record(record.clone())).await.unwrap();
        record.plan_id = "pro".to_string();
        store.commit(LocalChanges::record(record.clone())).await.unwrap();

        assert_eq!(store.record_count(), 1);
        let found = store.find_by_account(account_id).await.unwrap().unwrap();
        assert_eq!(found.plan_id, "pro");
    }

    #[tokio::test]
    async fn test_find_by_placeholder_ref() {
        let store = InMemorySubscriptionStore::new();
        let record = SubscriptionRecord::new_free(Uuid::new_v4(), OffsetDateTime::now_utc());
        let placeholder = record.subscription_ref().to_string();
        store.insert(record);

        assert!(store.find_by_provider_ref(&placeholder).await.unwrap().is_some());
        assert!(store.find_by_provider_ref("sub_unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_by_account() {
        let store = InMemorySubscriptionStore::new();
        let account_id = Uuid::new_v4();
        store.insert(SubscriptionRecord::new_free(account_id, OffsetDateTime::now_utc()));

        assert!(store.delete_by_account(account_id).await.unwrap());
        assert!(!store.delete_by_account(account_id).await.unwrap());
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn test_awaiting_settlement_filters_and_orders() {
        let store = InMemorySubscriptionStore::new();
        let now = OffsetDateTime::now_utc();

        let mut older = SubscriptionRecord::new_free(Uuid::new_v4(), now);
        older.set_status(SubscriptionStatus::PendingPayment);
        older.updated_at = now - time::Duration::hours(2);

        let mut newer = SubscriptionRecord::new_free(Uuid::new_v4(), now);
        newer.set_status(SubscriptionStatus::Incomplete);
        newer.updated_at = now - time::Duration::hours(1);

        let mut fresh = SubscriptionRecord::new_free(Uuid::new_v4(), now);
        fresh.set_status(SubscriptionStatus::PendingPayment);

        let mut settled = SubscriptionRecord::new_free(Uuid::new_v4(), now);
        settled.set_status(SubscriptionStatus::Active);
        settled.updated_at = now - time::Duration::hours(3);

        for r in [older.clone(), newer.clone(), fresh, settled] {
            store.insert(r);
        }

        let stale = store
            .list_awaiting_settlement(now - time::Duration::minutes(15), 10)
            .await
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|r| r.account_id).collect();
        assert_eq!(ids, vec![older.account_id, newer.account_id]);

        let capped = store
            .list_awaiting_settlement(now - time::Duration::minutes(15), 1)
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn test_payment_methods_scoped_to_account() {
        let store = InMemoryPaymentMethodStore::new();
        let owner = Uuid::new_v4();
        store.add(PaymentMethod {
            id: "pm_local_1".to_string(),
            account_id: owner,
            provider_payment_method_ref: "pm_1".to_string(),
        });

        assert_eq!(store.list_for_account(owner).await.unwrap().len(), 1);
        assert!(store.list_for_account(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
