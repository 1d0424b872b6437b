//! Subscription change events
//!
//! Every completed transition emits one event to an [`AuditSink`]. Delivery is
//! fire-and-forget: a failing sink is logged and never fails the transition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    FreeSubscriptionCreated,
    UpgradeRequested,
    PaymentConfirmed,
    PaymentPending,
    PaymentFailed,
    SubscriptionDowngraded,
    SubscriptionCanceled,
    CancellationScheduled,
    SubscriptionReactivated,
    SubscriptionSynced,
    RefundIssued,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::FreeSubscriptionCreated => "free_subscription_created",
            BillingEventType::UpgradeRequested => "upgrade_requested",
            BillingEventType::PaymentConfirmed => "payment_confirmed",
            BillingEventType::PaymentPending => "payment_pending",
            BillingEventType::PaymentFailed => "payment_failed",
            BillingEventType::SubscriptionDowngraded => "subscription_downgraded",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::CancellationScheduled => "cancellation_scheduled",
            BillingEventType::SubscriptionReactivated => "subscription_reactivated",
            BillingEventType::SubscriptionSynced => "subscription_synced",
            BillingEventType::RefundIssued => "refund_issued",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub account_id: Uuid,
    pub event_type: BillingEventType,
    pub subscription_ref: Option<String>,
    pub data: serde_json::Value,
    pub created_at: OffsetDateTime,
}

pub struct BillingEventBuilder {
    account_id: Uuid,
    event_type: BillingEventType,
    subscription_ref: Option<String>,
    data: serde_json::Value,
}

impl BillingEventBuilder {
    pub fn new(account_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            account_id,
            event_type,
            subscription_ref: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn subscription_ref(mut self, subscription_ref: impl Into<String>) -> Self {
        self.subscription_ref = Some(subscription_ref.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn build(self) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            event_type: self.event_type,
            subscription_ref: self.subscription_ref,
            data: self.data,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Append-only history sink
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: BillingEvent) -> BillingResult<()>;
}
