//! Subscription lifecycle
//!
//! [`SubscriptionLifecycleEngine`] owns every transition of an account's
//! subscription record: free provisioning, upgrade, downgrade, cancel,
//! reactivate and reconciliation. Payment confirmation lives in
//! `payments.rs`.
//!
//! Provider calls happen before local writes. When a provider call fails the
//! operation aborts and whatever was already persisted stays as is; a later
//! `sync_from_provider` brings the record back in line.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{AuditSink, BillingEvent, BillingEventBuilder, BillingEventType};
use crate::gateway::{
    CancelSubscriptionRequest, CreateSubscriptionRequest, EnsureCustomerRequest,
    ProrationBehavior, ProviderGateway, ProviderSubscription, RetryingGateway,
    UpdateSubscriptionRequest,
};
use crate::models::{
    PaymentIntentMetadata, PaymentIntentRecord, ProviderRefs, SubscriptionKind,
    SubscriptionRecord, SubscriptionStatus,
};
use crate::plans::{BillingInterval, PaymentMethodStore, Plan, PlanStore};
use crate::proration::{ProrationCalculation, ProrationCalculator};
use crate::refund::{RefundResult, RefundService};
use crate::resolver::PaymentConfirmationResolver;
use crate::store::{LocalChanges, SubscriptionStore};
use crate::validation::SubscriptionValidator;

/// Parameters for an upgrade
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub account_id: Uuid,
    pub plan_id: String,
    /// Local payment method id or provider ref; optional
    pub payment_method_id: Option<String>,
    /// Where the client should land after authenticating the payment
    pub return_url: Option<String>,
}

/// Result of an upgrade: the pending record plus what the client needs to
/// confirm the payment
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeOutcome {
    pub record: SubscriptionRecord,
    pub payment_intent_ref: String,
    pub client_secret: Option<String>,
    pub requires_action: bool,
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationResult {
    pub record: SubscriptionRecord,
    /// Set only for immediate cancellations with a non-zero refund
    pub refund: Option<RefundResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileFailure {
    pub account_id: Uuid,
    pub subscription_ref: String,
    pub error: String,
}

/// Outcome of one reconciliation sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub reconciled: Vec<SubscriptionRecord>,
    pub failed: Vec<ReconcileFailure>,
}

/// Storage and provider collaborators for the engine
#[derive(Clone)]
pub struct EngineDeps {
    pub gateway: Arc<dyn ProviderGateway>,
    pub store: Arc<dyn SubscriptionStore>,
    pub plans: Arc<dyn PlanStore>,
    pub payment_methods: Arc<dyn PaymentMethodStore>,
    pub audit: Arc<dyn AuditSink>,
}

pub struct SubscriptionLifecycleEngine {
    pub(crate) gateway: Arc<dyn ProviderGateway>,
    pub(crate) store: Arc<dyn SubscriptionStore>,
    pub(crate) plans: Arc<dyn PlanStore>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) validator: SubscriptionValidator,
    pub(crate) calculator: ProrationCalculator,
    pub(crate) resolver: PaymentConfirmationResolver,
    pub(crate) refunds: RefundService,
    pub(crate) config: BillingConfig,
}

impl SubscriptionLifecycleEngine {
    /// Wraps the gateway in the configured provider retry policy. Cancelling
    /// `cancel` ends in-flight retry waits early.
    ///
    /// The resolver polls the bare gateway: its own budget is the only one,
    /// so each invoice lookup is exactly one attempt.
    pub fn new(deps: EngineDeps, config: BillingConfig, cancel: CancellationToken) -> Self {
        let resolver = PaymentConfirmationResolver::new(
            deps.gateway.clone(),
            config.confirmation_retry,
            cancel.clone(),
        );
        let gateway: Arc<dyn ProviderGateway> = Arc::new(RetryingGateway::new(
            deps.gateway,
            config.provider_retry,
            cancel,
        ));

        Self {
            validator: SubscriptionValidator::new(deps.payment_methods),
            calculator: ProrationCalculator::new(),
            refunds: RefundService::new(gateway.clone()),
            resolver,
            gateway,
            store: deps.store,
            plans: deps.plans,
            audit: deps.audit,
            config,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get_subscription(&self, account_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let record = self.store.find_by_account(account_id).await?;
        self.validator
            .exists(record, &format!("account {}", account_id))
    }

    /// What switching to `plan_id` would cost right now, without touching the provider
    pub async fn preview_plan_change(
        &self,
        account_id: Uuid,
        plan_id: &str,
    ) -> BillingResult<ProrationCalculation> {
        let record = self.get_subscription(account_id).await?;
        let plan_id = self.validator.plan_id(plan_id)?;
        let new_plan = self
            .validator
            .plan_exists(self.plans.by_id(plan_id).await?, plan_id)?;
        let current_plan = self.current_plan(&record).await?;

        let now = OffsetDateTime::now_utc();
        let days_remaining = record
            .next_billing_date
            .map(|next| (next - now).whole_days().max(0))
            .and_then(|days| u32::try_from(days).ok())
            .unwrap_or(0);

        Ok(self.calculator.compute_for_plans(
            &current_plan.id,
            &new_plan.id,
            current_plan.amount,
            new_plan.amount,
            days_remaining,
            current_plan.interval.days(),
        ))
    }

    // =========================================================================
    // Free tier
    // =========================================================================

    /// Provision (or re-provision) the free tier. No provider call.
    pub async fn create_free_subscription(
        &self,
        account_id: Uuid,
    ) -> BillingResult<SubscriptionRecord> {
        if let Some(existing) = self.store.find_by_account(account_id).await? {
            if !existing.kind.is_free() && !existing.status.is_terminal() {
                return Err(BillingError::InvalidState(format!(
                    "Account {} already has a paid subscription ({}); cancel it first",
                    account_id,
                    existing.subscription_ref()
                )));
            }
        }

        let now = OffsetDateTime::now_utc();
        let record = SubscriptionRecord::new_free(account_id, now);
        self.store
            .commit(LocalChanges::record(record.clone()).replacing())
            .await?;

        tracing::info!(
            account_id = %account_id,
            subscription_ref = %record.subscription_ref(),
            "Created free subscription"
        );
        self.emit(
            BillingEventBuilder::new(account_id, BillingEventType::FreeSubscriptionCreated)
                .subscription_ref(record.subscription_ref())
                .build(),
        )
        .await;

        Ok(record)
    }

    // =========================================================================
    // Upgrade
    // =========================================================================

    /// Move to a more expensive plan. The record ends in `pending_payment`
    /// until the returned payment intent is confirmed.
    pub async fn upgrade(&self, request: UpgradeRequest) -> BillingResult<UpgradeOutcome> {
        let account_id = request.account_id;
        let plan_id = self.validator.plan_id(&request.plan_id)?;
        let record = self.get_subscription(account_id).await?;
        let new_plan = self
            .validator
            .plan_exists(self.plans.by_id(plan_id).await?, plan_id)?;
        let current_plan = self.current_plan(&record).await?;
        self.validator.is_upgrade(&current_plan, &new_plan)?;
        let payment_method = self
            .validator
            .payment_method_belongs_to_account(
                request.payment_method_id.as_deref().unwrap_or(""),
                account_id,
            )
            .await?;
        let payment_method_ref = payment_method.map(|m| m.provider_payment_method_ref);

        tracing::info!(
            account_id = %account_id,
            from_plan = %current_plan.id,
            to_plan = %new_plan.id,
            free = record.kind.is_free(),
            "Starting upgrade"
        );

        let mut metadata = HashMap::new();
        metadata.insert("account_id".to_string(), account_id.to_string());
        metadata.insert("plan_id".to_string(), new_plan.id.clone());
        if let Some(url) = &request.return_url {
            metadata.insert("return_url".to_string(), url.clone());
        }

        let now = OffsetDateTime::now_utc();
        let (provider_sub, customer_ref) = match &record.kind {
            SubscriptionKind::Free { .. } => {
                let customer_ref = self
                    .gateway
                    .ensure_customer(&EnsureCustomerRequest {
                        account_id,
                        existing_customer_ref: None,
                        payment_method_ref: payment_method_ref.clone(),
                        idempotency_key: format!("customer-{}", account_id),
                    })
                    .await?;
                let provider_sub = self
                    .gateway
                    .create_subscription(&CreateSubscriptionRequest {
                        customer_ref: customer_ref.clone(),
                        price_ref: new_plan.provider_price_ref.clone(),
                        payment_method_ref: payment_method_ref.clone(),
                        metadata,
                        idempotency_key: format!(
                            "subscription-{}-{}-{}",
                            account_id,
                            new_plan.id,
                            record.created_at.unix_timestamp()
                        ),
                    })
                    .await?;
                (provider_sub, customer_ref)
            }
            SubscriptionKind::Provisioned(refs) => {
                self.validator.not_pending_cancel(&record, "upgrade")?;
                let provider_sub = self
                    .gateway
                    .update_subscription(
                        &refs.subscription_ref,
                        &UpdateSubscriptionRequest {
                            price_ref: Some(new_plan.provider_price_ref.clone()),
                            proration: Some(ProrationBehavior::AlwaysInvoice),
                            defer_payment: true,
                            metadata,
                            ..Default::default()
                        },
                    )
                    .await?;
                (provider_sub, refs.customer_ref.clone())
            }
        };

        let intent = self.resolver.resolve(&provider_sub).await?;

        let mut payment_intent = PaymentIntentRecord {
            account_id,
            provider_payment_intent_ref: intent.id.clone(),
            amount: intent.amount,
            currency: intent.currency.clone(),
            status: intent.status.clone(),
            payment_method_ref: intent.payment_method_ref.clone().or(payment_method_ref),
            client_secret: intent.client_secret.clone(),
            provider_customer_ref: customer_ref.clone(),
            requires_action: false,
            metadata: PaymentIntentMetadata {
                plan_id: new_plan.id.clone(),
                provider_subscription_ref: provider_sub.id.clone(),
            },
            created_at: now,
        };
        payment_intent.set_status(intent.status);

        let base = if record.kind.is_free() {
            let mut paid = SubscriptionRecord::new_free(account_id, now);
            paid.plan_id = new_plan.id.clone();
            paid.kind = SubscriptionKind::Provisioned(ProviderRefs {
                subscription_ref: provider_sub.id.clone(),
                customer_ref,
            });
            paid.set_status(SubscriptionStatus::PendingPayment);
            paid.last_payment_date = Some(now);
            LocalChanges::record(paid).replacing()
        } else {
            let mut updated = record.clone();
            updated.plan_id = new_plan.id.clone();
            updated.set_status(SubscriptionStatus::PendingPayment);
            updated.last_payment_date = Some(now);
            updated.pending_plan_change = true;
            updated.next_billing_date =
                Some(self.period_end_or_fallback(provider_sub.current_period_end, now));
            updated.touch(now);
            LocalChanges::record(updated)
        };
        let changes = base.with_payment_intent(payment_intent.clone());

        let updated = changes.subscription.clone();
        self.store.commit(changes).await?;

        tracing::info!(
            account_id = %account_id,
            subscription_ref = %provider_sub.id,
            payment_intent_ref = %payment_intent.provider_payment_intent_ref,
            plan_id = %new_plan.id,
            "Upgrade pending payment confirmation"
        );
        self.emit(
            BillingEventBuilder::new(account_id, BillingEventType::UpgradeRequested)
                .subscription_ref(&provider_sub.id)
                .data(serde_json::json!({
                    "from_plan": current_plan.id,
                    "to_plan": new_plan.id,
                    "payment_intent_ref": payment_intent.provider_payment_intent_ref,
                    "amount": payment_intent.amount.to_string(),
                }))
                .build(),
        )
        .await;

        Ok(UpgradeOutcome {
            record: updated,
            payment_intent_ref: payment_intent.provider_payment_intent_ref,
            client_secret: payment_intent.client_secret,
            requires_action: payment_intent.requires_action,
            return_url: request.return_url,
        })
    }

    // =========================================================================
    // Downgrade
    // =========================================================================

    /// Move to a cheaper plan. The provider credits the difference on the next
    /// invoice, so there is no payment step.
    pub async fn downgrade(
        &self,
        account_id: Uuid,
        plan_id: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let mut record = self.get_subscription(account_id).await?;
        self.validator.not_free_placeholder(&record, "downgrade")?;
        let plan_id = self.validator.plan_id(plan_id)?;
        let new_plan = self
            .validator
            .plan_exists(self.plans.by_id(plan_id).await?, plan_id)?;
        let current_plan = self.current_plan(&record).await?;
        self.validator.is_downgrade(&current_plan, &new_plan)?;
        self.validator.not_pending_cancel(&record, "downgrade")?;

        let subscription_ref = record.subscription_ref().to_string();
        let provider_sub = self
            .gateway
            .update_subscription(
                &subscription_ref,
                &UpdateSubscriptionRequest {
                    price_ref: Some(new_plan.provider_price_ref.clone()),
                    proration: Some(ProrationBehavior::CreateProrations),
                    ..Default::default()
                },
            )
            .await?;

        let now = OffsetDateTime::now_utc();
        record.plan_id = new_plan.id.clone();
        record.set_status(
            provider_sub
                .status
                .to_local(provider_sub.cancel_at_period_end),
        );
        record.pending_plan_change = false;
        record.next_billing_date =
            Some(self.period_end_or_fallback(provider_sub.current_period_end, now));
        record.touch(now);
        self.store.commit(LocalChanges::record(record.clone())).await?;

        tracing::info!(
            account_id = %account_id,
            subscription_ref = %subscription_ref,
            from_plan = %current_plan.id,
            to_plan = %new_plan.id,
            status = %record.status,
            "Downgraded subscription"
        );
        self.emit(
            BillingEventBuilder::new(account_id, BillingEventType::SubscriptionDowngraded)
                .subscription_ref(&subscription_ref)
                .data(serde_json::json!({
                    "from_plan": current_plan.id,
                    "to_plan": new_plan.id,
                }))
                .build(),
        )
        .await;

        Ok(record)
    }

    // =========================================================================
    // Cancel / reactivate
    // =========================================================================

    /// Cancel now (with a prorated refund) or at the end of the current period
    pub async fn cancel(
        &self,
        account_id: Uuid,
        immediate: bool,
    ) -> BillingResult<CancellationResult> {
        let mut record = self.get_subscription(account_id).await?;
        self.validator.not_free_placeholder(&record, "cancel")?;
        self.validator.is_active(&record, "cancel")?;

        let subscription_ref = record.subscription_ref().to_string();
        let now = OffsetDateTime::now_utc();

        if !immediate {
            let provider_sub = self
                .gateway
                .update_subscription(
                    &subscription_ref,
                    &UpdateSubscriptionRequest {
                        cancel_at_period_end: Some(true),
                        ..Default::default()
                    },
                )
                .await?;

            record.cancel_at_period_end = true;
            record.set_status(SubscriptionStatus::CanceledAtPeriodEnd);
            record.subscription_end_date =
                Some(self.period_end_or_fallback(provider_sub.current_period_end, now));
            record.touch(now);
            self.store.commit(LocalChanges::record(record.clone())).await?;

            tracing::info!(
                account_id = %account_id,
                subscription_ref = %subscription_ref,
                ends_at = ?record.subscription_end_date,
                "Subscription set to cancel at period end"
            );
            self.emit(
                BillingEventBuilder::new(account_id, BillingEventType::CancellationScheduled)
                    .subscription_ref(&subscription_ref)
                    .build(),
            )
            .await;

            return Ok(CancellationResult {
                record,
                refund: None,
            });
        }

        self.gateway
            .cancel_subscription(
                &subscription_ref,
                &CancelSubscriptionRequest {
                    prorate: true,
                    invoice_now: false,
                },
            )
            .await?;

        // The refund is measured against the period as it stood before cancellation
        let refund_basis = record.clone();
        record.set_status(SubscriptionStatus::Canceled);
        record.cancel_at_period_end = false;
        record.subscription_end_date = Some(now);
        record.next_billing_date = None;
        record.pending_plan_change = false;
        record.touch(now);
        self.store.commit(LocalChanges::record(record.clone())).await?;

        tracing::info!(
            account_id = %account_id,
            subscription_ref = %subscription_ref,
            "Canceled subscription immediately"
        );
        self.emit(
            BillingEventBuilder::new(account_id, BillingEventType::SubscriptionCanceled)
                .subscription_ref(&subscription_ref)
                .build(),
        )
        .await;

        let refund = match self.store.latest_payment_intent(&subscription_ref).await? {
            Some(last_payment) => {
                self.refunds
                    .refund_unused_period(&refund_basis, &last_payment, now)
                    .await?
            }
            None => {
                tracing::info!(
                    account_id = %account_id,
                    subscription_ref = %subscription_ref,
                    "No recorded payment, skipping refund"
                );
                None
            }
        };

        if let Some(refund) = &refund {
            self.emit(
                BillingEventBuilder::new(account_id, BillingEventType::RefundIssued)
                    .subscription_ref(&subscription_ref)
                    .data(serde_json::json!({
                        "refund_ref": refund.provider_refund_ref,
                        "amount": refund.amount.to_string(),
                        "currency": refund.currency,
                    }))
                    .build(),
            )
            .await;
        }

        Ok(CancellationResult { record, refund })
    }

    /// Undo a pending cancellation
    pub async fn reactivate(&self, subscription_ref: &str) -> BillingResult<SubscriptionRecord> {
        let mut record = self.find_by_ref(subscription_ref).await?;
        self.validator.not_free_placeholder(&record, "reactivate")?;
        self.validator.can_reactivate(&record)?;

        let provider_sub = self
            .gateway
            .update_subscription(
                subscription_ref,
                &UpdateSubscriptionRequest {
                    cancel_at_period_end: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        let now = OffsetDateTime::now_utc();
        record.cancel_at_period_end = false;
        record.subscription_end_date = None;
        record.set_status(provider_sub.status.to_local(false));
        record.next_billing_date =
            Some(self.period_end_or_fallback(provider_sub.current_period_end, now));
        record.touch(now);
        self.store.commit(LocalChanges::record(record.clone())).await?;

        tracing::info!(
            account_id = %record.account_id,
            subscription_ref = %subscription_ref,
            status = %record.status,
            "Reactivated subscription"
        );
        self.emit(
            BillingEventBuilder::new(record.account_id, BillingEventType::SubscriptionReactivated)
                .subscription_ref(subscription_ref)
                .build(),
        )
        .await;

        Ok(record)
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Overwrite local status, flags and dates with the provider's view
    pub async fn sync_from_provider(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let mut record = self.find_by_ref(subscription_ref).await?;
        self.validator.not_free_placeholder(&record, "sync")?;

        let provider_sub = self.gateway.retrieve_subscription(subscription_ref).await?;
        let now = OffsetDateTime::now_utc();
        let previous = record.status;
        self.apply_provider_state(&mut record, &provider_sub, now);
        self.store.commit(LocalChanges::record(record.clone())).await?;

        tracing::info!(
            account_id = %record.account_id,
            subscription_ref = %subscription_ref,
            previous_status = %previous,
            status = %record.status,
            "Synced subscription from provider"
        );
        self.emit(
            BillingEventBuilder::new(record.account_id, BillingEventType::SubscriptionSynced)
                .subscription_ref(subscription_ref)
                .data(serde_json::json!({
                    "previous_status": previous.as_str(),
                    "status": record.status.as_str(),
                }))
                .build(),
        )
        .await;

        Ok(record)
    }

    /// Settle records stuck waiting on the provider. Records with a mirrored
    /// payment intent go through payment confirmation; the rest are synced.
    pub async fn reconcile_awaiting_settlement(
        &self,
        stale_after: Duration,
        limit: i64,
    ) -> BillingResult<ReconcileReport> {
        let cutoff = OffsetDateTime::now_utc() - stale_after;
        let stale = self.store.list_awaiting_settlement(cutoff, limit).await?;
        let mut report = ReconcileReport {
            examined: stale.len(),
            ..Default::default()
        };

        for record in stale {
            let subscription_ref = record.subscription_ref().to_string();
            let result = match self.store.latest_payment_intent(&subscription_ref).await {
                Ok(Some(intent)) => {
                    self.confirm_payment(&subscription_ref, &intent.provider_payment_intent_ref)
                        .await
                }
                Ok(None) => self.sync_from_provider(&subscription_ref).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(updated) => report.reconciled.push(updated),
                Err(e) => {
                    tracing::warn!(
                        account_id = %record.account_id,
                        subscription_ref = %subscription_ref,
                        error = %e,
                        "Failed to reconcile subscription"
                    );
                    report.failed.push(ReconcileFailure {
                        account_id: record.account_id,
                        subscription_ref,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            reconciled = report.reconciled.len(),
            failed = report.failed.len(),
            "Reconciliation sweep finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    pub(crate) async fn find_by_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let record = self.store.find_by_provider_ref(subscription_ref).await?;
        self.validator
            .exists(record, &format!("subscription {}", subscription_ref))
    }

    /// Plan the record is on. A free record whose plan is missing from the
    /// catalog is treated as a zero-priced monthly plan.
    async fn current_plan(&self, record: &SubscriptionRecord) -> BillingResult<Plan> {
        match self.plans.by_id(&record.plan_id).await? {
            Some(plan) => Ok(plan),
            None if record.kind.is_free() => Ok(Plan {
                id: record.plan_id.clone(),
                name: "Free".to_string(),
                amount: Decimal::ZERO,
                currency: String::new(),
                interval: BillingInterval::Month,
                provider_price_ref: String::new(),
            }),
            None => Err(BillingError::NotFound(format!(
                "Current plan {} not found",
                record.plan_id
            ))),
        }
    }

    pub(crate) fn period_end_or_fallback(
        &self,
        period_end: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> OffsetDateTime {
        period_end.unwrap_or(now + self.config.fallback_period)
    }

    pub(crate) fn apply_provider_state(
        &self,
        record: &mut SubscriptionRecord,
        provider_sub: &ProviderSubscription,
        now: OffsetDateTime,
    ) {
        let status = provider_sub
            .status
            .to_local(provider_sub.cancel_at_period_end);
        record.set_status(status);
        record.cancel_at_period_end = provider_sub.cancel_at_period_end;

        match status {
            SubscriptionStatus::Canceled => {
                record.cancel_at_period_end = false;
                record.next_billing_date = None;
                record.subscription_end_date = record.subscription_end_date.or(Some(now));
            }
            SubscriptionStatus::CanceledAtPeriodEnd => {
                let end = self.period_end_or_fallback(provider_sub.current_period_end, now);
                record.next_billing_date = Some(end);
                record.subscription_end_date = Some(end);
            }
            _ => {
                record.next_billing_date =
                    Some(self.period_end_or_fallback(provider_sub.current_period_end, now));
                record.subscription_end_date = None;
            }
        }
        if status == SubscriptionStatus::Active {
            record.pending_plan_change = false;
        }
        record.touch(now);
    }

    /// Fire-and-forget audit delivery
    pub(crate) async fn emit(&self, event: BillingEvent) {
        let event_type = event.event_type;
        if let Err(e) = self.audit.record(event).await {
            tracing::warn!(event_type = %event_type, error = %e, "Failed to record billing event");
        }
    }
}
