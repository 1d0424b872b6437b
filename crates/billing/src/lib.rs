// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Folio Billing
//!
//! Subscription lifecycle on top of Stripe: a free tier that never touches
//! the provider, paid upgrades confirmed through payment intents, downgrades,
//! cancellation with prorated refunds, and reconciliation of records that
//! got stuck waiting on the provider.
//!
//! ## Layout
//!
//! - **Engine**: [`SubscriptionLifecycleEngine`] drives every transition
//! - **Gateway**: [`ProviderGateway`] abstracts the provider; [`StripeGateway`] is the real one
//! - **Stores**: [`SubscriptionStore`], [`PlanStore`], [`PaymentMethodStore`], [`AuditSink`]
//!   with Postgres and in-memory implementations
//! - **Checks**: [`InvariantChecker`] validates records after transitions and sweeps

pub mod client;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod memory;
pub mod models;
pub mod payments;
pub mod plans;
pub mod postgres;
pub mod proration;
pub mod refund;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod stripe_gateway;
pub mod subscriptions;
pub mod validation;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;


use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

// Client / config
pub use client::{BillingConfig, StripeClient, StripeConfig};

// Errors
pub use error::{BillingError, BillingResult, ErrorKind};

// Events
pub use events::{AuditSink, BillingEvent, BillingEventBuilder, BillingEventType};

// Gateway
pub use gateway::{
    InvoiceStatus, ProviderGateway, ProviderInvoice, ProviderPaymentIntent, ProviderSubscription,
    ProviderSubscriptionStatus, RetryingGateway,
};
pub use stripe_gateway::StripeGateway;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{
    PaymentIntentRecord, PaymentIntentStatus, ProviderRefs, SubscriptionKind, SubscriptionRecord,
    SubscriptionStatus,
};
pub use plans::{BillingInterval, PaymentMethod, PaymentMethodStore, Plan, PlanStore};

// Proration / refunds
pub use proration::{ProrationCalculation, ProrationCalculator, ProrationType};
pub use refund::{RefundResult, RefundService};

// Retry
pub use retry::{Backoff, RetryPolicy};

// Storage
pub use memory::{
    InMemoryAuditSink, InMemoryPaymentMethodStore, InMemoryPlanStore, InMemorySubscriptionStore,
};
pub use postgres::{PgAuditSink, PgCatalog, PgSubscriptionStore, MIGRATOR};
pub use store::{LocalChanges, SubscriptionStore};

// Subscriptions
pub use subscriptions::{
    CancellationResult, EngineDeps, ReconcileFailure, ReconcileReport,
    SubscriptionLifecycleEngine, UpgradeOutcome, UpgradeRequest,
};

/// Main billing service that combines the engine with its checks
pub struct BillingService {
    pub subscriptions: Arc<SubscriptionLifecycleEngine>,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables, backed by
    /// Stripe and Postgres
    pub fn from_env(pool: PgPool, cancel: CancellationToken) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let config = BillingConfig::from_env()?;
        Ok(Self::with_config(stripe, pool, config, cancel))
    }

    /// Create a new billing service with explicit config
    pub fn with_config(
        stripe: StripeClient,
        pool: PgPool,
        config: BillingConfig,
        cancel: CancellationToken,
    ) -> Self {
        let catalog = Arc::new(PgCatalog::new(pool.clone()));
        let deps = EngineDeps {
            gateway: Arc::new(StripeGateway::new(stripe)),
            store: Arc::new(PgSubscriptionStore::new(pool.clone())),
            plans: catalog.clone(),
            payment_methods: catalog,
            audit: Arc::new(PgAuditSink::new(pool)),
        };
        Self::new(deps, config, cancel)
    }

    /// Assemble from arbitrary collaborators
    pub fn new(deps: EngineDeps, config: BillingConfig, cancel: CancellationToken) -> Self {
        Self {
            subscriptions: Arc::new(SubscriptionLifecycleEngine::new(deps, config, cancel)),
            invariants: InvariantChecker::new(),
        }
    }
}
