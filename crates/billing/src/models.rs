//! Subscription records and the local payment-intent mirror

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Prefix carried by the placeholder reference of a free subscription
pub const FREE_PLACEHOLDER_PREFIX: &str = "free_";

/// Plan id used for the non-paid tier
pub const FREE_PLAN_ID: &str = "free";

/// Local subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Free,
    PendingPayment,
    Incomplete,
    Active,
    CanceledAtPeriodEnd,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Free => "free",
            SubscriptionStatus::PendingPayment => "pending_payment",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::CanceledAtPeriodEnd => "canceled_at_period_end",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(SubscriptionStatus::Free),
            "pending_payment" => Some(SubscriptionStatus::PendingPayment),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "active" => Some(SubscriptionStatus::Active),
            "canceled_at_period_end" => Some(SubscriptionStatus::CanceledAtPeriodEnd),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// Statuses waiting on the provider to settle a payment
    pub fn is_awaiting_settlement(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::PendingPayment | SubscriptionStatus::Incomplete
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider-side identifiers of a paid subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRefs {
    pub subscription_ref: String,
    pub customer_ref: String,
}

/// Whether a record is backed by a provider subscription at all
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionKind {
    /// No provider resources. The placeholder ref lets callers address the
    /// record by "subscription ref" like any other.
    Free { placeholder_ref: String },
    Provisioned(ProviderRefs),
}

impl SubscriptionKind {
    pub fn free_for(account_id: Uuid) -> Self {
        SubscriptionKind::Free {
            placeholder_ref: format!("{}{}", FREE_PLACEHOLDER_PREFIX, account_id.simple()),
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, SubscriptionKind::Free { .. })
    }

    /// The ref callers use to address this subscription
    pub fn subscription_ref(&self) -> &str {
        match self {
            SubscriptionKind::Free { placeholder_ref } => placeholder_ref,
            SubscriptionKind::Provisioned(refs) => &refs.subscription_ref,
        }
    }

    pub fn customer_ref(&self) -> Option<&str> {
        match self {
            SubscriptionKind::Free { .. } => None,
            SubscriptionKind::Provisioned(refs) => Some(&refs.customer_ref),
        }
    }
}

/// The persisted subscription for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub account_id: Uuid,
    pub plan_id: String,
    pub kind: SubscriptionKind,
    pub status: SubscriptionStatus,
    pub active: bool,
    pub cancel_at_period_end: bool,
    pub subscription_start_date: OffsetDateTime,
    pub next_billing_date: Option<OffsetDateTime>,
    pub subscription_end_date: Option<OffsetDateTime>,
    pub last_payment_date: Option<OffsetDateTime>,
    pub pending_plan_change: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    pub fn new_free(account_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            account_id,
            plan_id: FREE_PLAN_ID.to_string(),
            kind: SubscriptionKind::free_for(account_id),
            status: SubscriptionStatus::Free,
            active: false,
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

    /// Set status and keep `active` in lockstep with it
    pub fn set_status(&mut self, status: SubscriptionStatus) {
        self.status = status;
        self.active = status == SubscriptionStatus::Active;
    }

    /// Whether the account currently gets paid-tier access. Differs from
    /// `active` for subscriptions that run until period end.
    pub fn has_access(&self) -> bool {
        match self.status {
            SubscriptionStatus::Active => true,
            SubscriptionStatus::CanceledAtPeriodEnd => self
                .subscription_end_date
                .map(|end| end > OffsetDateTime::now_utc())
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn subscription_ref(&self) -> &str {
        self.kind.subscription_ref()
    }

    pub fn touch(&mut self, now: OffsetDateTime) {
        self.updated_at = now;
    }
}

/// Provider payment-intent status as mirrored locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentIntentStatus {
    Succeeded,
    Processing,
    RequiresAction,
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresCapture,
    Canceled,
    Other(String),
}

impl PaymentIntentStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "succeeded" => PaymentIntentStatus::Succeeded,
            "processing" => PaymentIntentStatus::Processing,
            "requires_action" => PaymentIntentStatus::RequiresAction,
            "requires_payment_method" => PaymentIntentStatus::RequiresPaymentMethod,
            "requires_confirmation" => PaymentIntentStatus::RequiresConfirmation,
            "requires_capture" => PaymentIntentStatus::RequiresCapture,
            "canceled" => PaymentIntentStatus::Canceled,
            other => PaymentIntentStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PaymentIntentStatus::Succeeded => "succeeded",
            PaymentIntentStatus::Processing => "processing",
            PaymentIntentStatus::RequiresAction => "requires_action",
            PaymentIntentStatus::RequiresPaymentMethod => "requires_payment_method",
            PaymentIntentStatus::RequiresConfirmation => "requires_confirmation",
            PaymentIntentStatus::RequiresCapture => "requires_capture",
            PaymentIntentStatus::Canceled => "canceled",
            PaymentIntentStatus::Other(s) => s,
        }
    }
}

impl std::fmt::Display for PaymentIntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentMetadata {
    pub plan_id: String,
    pub provider_subscription_ref: String,
}

/// Local mirror of one payment confirmation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntentRecord {
    pub account_id: Uuid,
    pub provider_payment_intent_ref: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentIntentStatus,
    pub payment_method_ref: Option<String>,
    pub client_secret: Option<String>,
    pub provider_customer_ref: String,
    pub requires_action: bool,
    pub metadata: PaymentIntentMetadata,
    pub created_at: OffsetDateTime,
}

impl PaymentIntentRecord {
    pub fn set_status(&mut self, status: PaymentIntentStatus) {
        self.requires_action = status == PaymentIntentStatus::RequiresAction;
        self.status = status;
    }
}
