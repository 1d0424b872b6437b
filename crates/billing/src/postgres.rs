//! Postgres adapters for the store, catalog and audit traits

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{AuditSink, BillingEvent};
use crate::models::{
    PaymentIntentMetadata, PaymentIntentRecord, PaymentIntentStatus, ProviderRefs,
    SubscriptionKind, SubscriptionRecord, SubscriptionStatus,
};
use crate::plans::{BillingInterval, PaymentMethod, PaymentMethodStore, Plan, PlanStore};
use crate::store::{LocalChanges, SubscriptionStore};

/// Embedded schema migrations
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const SUBSCRIPTION_COLUMNS: &str = r#"
    account_id, plan_id, is_free, subscription_ref, customer_ref, status, active,
    cancel_at_period_end, subscription_start_date, next_billing_date,
    subscription_end_date, last_payment_date, pending_plan_change, created_at, updated_at
"#;

const PAYMENT_INTENT_COLUMNS: &str = r#"
    provider_payment_intent_ref, account_id, amount, currency, status, payment_method_ref,
    client_secret, provider_customer_ref, requires_action, plan_id, provider_subscription_ref,
    created_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    account_id: Uuid,
    plan_id: String,
    is_free: bool,
    subscription_ref: String,
    customer_ref: Option<String>,
    status: String,
    active: bool,
    cancel_at_period_end: bool,
    subscription_start_date: OffsetDateTime,
    next_billing_date: Option<OffsetDateTime>,
    subscription_end_date: Option<OffsetDateTime>,
    last_payment_date: Option<OffsetDateTime>,
    pending_plan_change: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        let status = SubscriptionStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Database(format!(
                "Unknown subscription status '{}' for account {}",
                row.status, row.account_id
            ))
        })?;

        let kind = if row.is_free {
            SubscriptionKind::Free {
                placeholder_ref: row.subscription_ref,
            }
        } else {
            SubscriptionKind::Provisioned(ProviderRefs {
                subscription_ref: row.subscription_ref,
                customer_ref: row.customer_ref.unwrap_or_default(),
            })
        };

        Ok(SubscriptionRecord {
            account_id: row.account_id,
            plan_id: row.plan_id,
            kind,
            status,
            active: row.active,
            cancel_at_period_end: row.cancel_at_period_end,
            subscription_start_date: row.subscription_start_date,
            next_billing_date: row.next_billing_date,
            subscription_end_date: row.subscription_end_date,
            last_payment_date: row.last_payment_date,
            pending_plan_change: row.pending_plan_change,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentIntentRow {
    provider_payment_intent_ref: String,
    account_id: Uuid,
    amount: Decimal,
    currency: String,
    status: String,
    payment_method_ref: Option<String>,
    client_secret: Option<String>,
    provider_customer_ref: String,
    requires_action: bool,
    plan_id: String,
    provider_subscription_ref: String,
    created_at: OffsetDateTime,
}

impl From<PaymentIntentRow> for PaymentIntentRecord {
    fn from(row: PaymentIntentRow) -> Self {
        PaymentIntentRecord {
            account_id: row.account_id,
            provider_payment_intent_ref: row.provider_payment_intent_ref,
            amount: row.amount,
            currency: row.currency,
            status: PaymentIntentStatus::parse(&row.status),
            payment_method_ref: row.payment_method_ref,
            client_secret: row.client_secret,
            provider_customer_ref: row.provider_customer_ref,
            requires_action: row.requires_action,
            metadata: PaymentIntentMetadata {
                plan_id: row.plan_id,
                provider_subscription_ref: row.provider_subscription_ref,
            },
            created_at: row.created_at,
        }
    }
}

/// Subscription records and payment-intent mirror in Postgres
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn select_by(column: &str) -> String {
        format!(
            "SELECT {} FROM subscriptions WHERE {} = $1",
            SUBSCRIPTION_COLUMNS, column
        )
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_by_account(&self, account_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = Self::select_by("account_id");
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn find_by_provider_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = Self::select_by("subscription_ref");
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(subscription_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn commit(&self, changes: LocalChanges) -> BillingResult<()> {
        let record = &changes.subscription;
        let mut tx = self.pool.begin().await?;

        if changes.replace_existing {
            sqlx::query("DELETE FROM subscriptions WHERE account_id = $1")
                .bind(record.account_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                account_id, plan_id, is_free, subscription_ref, customer_ref, status, active,
                cancel_at_period_end, subscription_start_date, next_billing_date,
                subscription_end_date, last_payment_date, pending_plan_change, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (account_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                is_free = EXCLUDED.is_free,
                subscription_ref = EXCLUDED.subscription_ref,
                customer_ref = EXCLUDED.customer_ref,
                status = EXCLUDED.status,
                active = EXCLUDED.active,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                subscription_start_date = EXCLUDED.subscription_start_date,
                next_billing_date = EXCLUDED.next_billing_date,
                subscription_end_date = EXCLUDED.subscription_end_date,
                last_payment_date = EXCLUDED.last_payment_date,
                pending_plan_change = EXCLUDED.pending_plan_change,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.account_id)
        .bind(&record.plan_id)
        .bind(record.kind.is_free())
        .bind(record.subscription_ref())
        .bind(record.kind.customer_ref())
        .bind(record.status.as_str())
        .bind(record.active)
        .bind(record.cancel_at_period_end)
        .bind(record.subscription_start_date)
        .bind(record.next_billing_date)
        .bind(record.subscription_end_date)
        .bind(record.last_payment_date)
        .bind(record.pending_plan_change)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        if let Some(intent) = &changes.payment_intent {
            sqlx::query(
                r#"
                INSERT INTO payment_intents (
                    provider_payment_intent_ref, account_id, amount, currency, status,
                    payment_method_ref, client_secret, provider_customer_ref, requires_action,
                    plan_id, provider_subscription_ref, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (provider_payment_intent_ref) DO UPDATE SET
                    status = EXCLUDED.status,
                    payment_method_ref = EXCLUDED.payment_method_ref,
                    client_secret = EXCLUDED.client_secret,
                    requires_action = EXCLUDED.requires_action
                "#,
            )
            .bind(&intent.provider_payment_intent_ref)
            .bind(intent.account_id)
            .bind(intent.amount)
            .bind(&intent.currency)
            .bind(intent.status.as_str())
            .bind(&intent.payment_method_ref)
            .bind(&intent.client_secret)
            .bind(&intent.provider_customer_ref)
            .bind(intent.requires_action)
            .bind(&intent.metadata.plan_id)
            .bind(&intent.metadata.provider_subscription_ref)
            .bind(intent.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            account_id = %record.account_id,
            status = %record.status,
            replaced = changes.replace_existing,
            "Committed subscription record"
        );
        Ok(())
    }

    async fn delete_by_account(&self, account_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE account_id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_awaiting_settlement(
        &self,
        updated_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE status IN ('pending_payment', 'incomplete')
              AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(updated_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(SubscriptionRecord::try_from).collect()
    }

    async fn find_payment_intent(
        &self,
        payment_intent_ref: &str,
    ) -> BillingResult<Option<PaymentIntentRecord>> {
        let sql = format!(
            "SELECT {} FROM payment_intents WHERE provider_payment_intent_ref = $1",
            PAYMENT_INTENT_COLUMNS
        );
        let row: Option<PaymentIntentRow> = sqlx::query_as(&sql)
            .bind(payment_intent_ref)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PaymentIntentRecord::from))
    }

    async fn latest_payment_intent(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<PaymentIntentRecord>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM payment_intents
            WHERE provider_subscription_ref = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            PAYMENT_INTENT_COLUMNS
        );
        let row: Option<PaymentIntentRow> = sqlx::query_as(&sql)
            .bind(subscription_ref)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PaymentIntentRecord::from))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: String,
    name: String,
    amount: Decimal,
    currency: String,
    billing_interval: String,
    provider_price_ref: String,
}

/// Plan catalog and saved payment methods
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanStore for PgCatalog {
    async fn by_id(&self, plan_id: &str) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, amount, currency, billing_interval, provider_price_ref
            FROM plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let interval = BillingInterval::parse(&row.billing_interval).ok_or_else(|| {
                BillingError::Database(format!(
                    "Unknown billing interval '{}' for plan {}",
                    row.billing_interval, row.id
                ))
            })?;
            Ok(Plan {
                id: row.id,
                name: row.name,
                amount: row.amount,
                currency: row.currency,
                interval,
                provider_price_ref: row.provider_price_ref,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl PaymentMethodStore for PgCatalog {
    async fn list_for_account(&self, account_id: Uuid) -> BillingResult<Vec<PaymentMethod>> {
        let rows: Vec<(String, Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, account_id, provider_payment_method_ref
            FROM payment_methods
            WHERE account_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, account_id, provider_payment_method_ref)| PaymentMethod {
                id,
                account_id,
                provider_payment_method_ref,
            })
            .collect())
    }
}

/// Writes lifecycle events to `subscription_events`
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_events (id, account_id, event_type, subscription_ref, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.account_id)
        .bind(event.event_type.as_str())
        .bind(&event.subscription_ref)
        .bind(&event.data)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(is_free: bool, status: &str) -> SubscriptionRow {
        let now = OffsetDateTime::now_utc();
        SubscriptionRow {
            account_id: Uuid::new_v4(),
            plan_id: "pro".to_string(),
            is_free,
            subscription_ref: if is_free { "free_abc" } else { "sub_123" }.to_string(),
            customer_ref: (!is_free).then(|| "cus_123".to_string()),
            status: status.to_string(),
            active: status == "active",
            cancel_at_period_end: false,
            subscription_start_date: now,
            next_billing_date: None,
            subscription_end_date: None,
            last_payment_date: None,
            pending_plan_change: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_row_maps_kind() {
        let free = SubscriptionRecord::try_from(row(true, "free")).unwrap();
        assert!(free.kind.is_free());
        assert_eq!(free.subscription_ref(), "free_abc");

        let paid = SubscriptionRecord::try_from(row(false, "active")).unwrap();
        assert_eq!(paid.kind.customer_ref(), Some("cus_123"));
        assert_eq!(paid.status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_unknown_status_is_database_error() {
        let err = SubscriptionRecord::try_from(row(false, "trialing")).unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));
    }
}
