//! Test doubles for the provider gateway
//!
//! `MockGateway` keeps a tiny in-process model of the provider: customers,
//! subscriptions, invoices and payment intents. Tests script it to reproduce
//! the slow or partial responses the engine has to cope with.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    CancelSubscriptionRequest, CreatePaymentIntentRequest, CreateSubscriptionRequest,
    EnsureCustomerRequest, InvoiceStatus, ProrationBehavior, ProviderGateway, ProviderInvoice,
    ProviderPaymentIntent, ProviderRefund, ProviderSubscription, ProviderSubscriptionStatus,
    RefundRequest, UpdateSubscriptionRequest,
};
use crate::models::PaymentIntentStatus;

#[derive(Default)]
struct MockState {
    counter: u64,
    customers: Vec<String>,
    subscriptions: HashMap<String, ProviderSubscription>,
    invoices: HashMap<String, ProviderInvoice>,
    intents: HashMap<String, ProviderPaymentIntent>,
    prices: HashMap<String, Decimal>,
    refunds: Vec<RefundRequest>,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<BillingError>>,
    /// Invoice lookups per invoice before its payment intent becomes visible
    invoice_intent_delay: usize,
    invoice_lookups: HashMap<String, usize>,
    embed_payment_intent: bool,
    omit_period_end: bool,
    idempotency_keys: Vec<String>,
}

pub struct MockGateway {
    state: Mutex<MockState>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                embed_payment_intent: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the amount billed for a price ref
    pub fn set_price(&self, price_ref: &str, amount: Decimal) {
        self.lock().prices.insert(price_ref.to_string(), amount);
    }

    /// Make the next `times` calls to `operation` fail with `error`
    pub fn fail_next(&self, operation: &str, times: usize, error: BillingError) {
        let mut state = self.lock();
        let queue = state.failures.entry(operation.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Number of invoice lookups that return no payment intent ref; `usize::MAX` = never
    pub fn set_invoice_intent_delay(&self, lookups: usize) {
        self.lock().invoice_intent_delay = lookups;
    }

    pub fn set_embed_payment_intent(&self, embed: bool) {
        self.lock().embed_payment_intent = embed;
    }

    pub fn set_omit_period_end(&self, omit: bool) {
        self.lock().omit_period_end = omit;
    }

    pub fn set_payment_intent_status(&self, payment_intent_ref: &str, status: PaymentIntentStatus) {
        if let Some(intent) = self.lock().intents.get_mut(payment_intent_ref) {
            intent.status = status;
        }
    }

    pub fn set_invoice_status(&self, invoice_ref: &str, status: InvoiceStatus) {
        if let Some(invoice) = self.lock().invoices.get_mut(invoice_ref) {
            invoice.status = status;
        }
    }

    pub fn set_subscription_status(&self, subscription_ref: &str, status: ProviderSubscriptionStatus) {
        if let Some(sub) = self.lock().subscriptions.get_mut(subscription_ref) {
            sub.status = status;
        }
    }

    /// Seed a live, fully paid provider subscription
    pub fn seed_active_subscription(&self, customer_ref: &str, price_ref: &str) -> ProviderSubscription {
        let mut state = self.lock();
        state.customers.push(customer_ref.to_string());
        let n = next_id(&mut state);
        let invoice_id = format!("in_mock_{}", n);
        let amount = state.prices.get(price_ref).copied().unwrap_or(Decimal::ZERO);
        state.invoices.insert(
            invoice_id.clone(),
            ProviderInvoice {
                id: invoice_id.clone(),
                status: InvoiceStatus::Paid,
                payment_intent_ref: None,
                amount_due: amount,
                currency: "usd".to_string(),
            },
        );
        let sub = ProviderSubscription {
            id: format!("sub_mock_{}", n),
            customer_ref: customer_ref.to_string(),
            status: ProviderSubscriptionStatus::Active,
            price_ref: Some(price_ref.to_string()),
            current_period_end: period_end(&state),
            cancel_at_period_end: false,
            latest_invoice_ref: Some(invoice_id),
            embedded_payment_intent_ref: None,
        };
        state.subscriptions.insert(sub.id.clone(), sub.clone());
        sub
    }

    pub fn subscription(&self, subscription_ref: &str) -> Option<ProviderSubscription> {
        self.lock().subscriptions.get(subscription_ref).cloned()
    }

    pub fn invoice(&self, invoice_ref: &str) -> Option<ProviderInvoice> {
        self.lock().invoices.get(invoice_ref).cloned()
    }

    pub fn refunds(&self) -> Vec<RefundRequest> {
        self.lock().refunds.clone()
    }

    pub fn customers(&self) -> Vec<String> {
        self.lock().customers.clone()
    }

    pub fn idempotency_keys(&self) -> Vec<String> {
        self.lock().idempotency_keys.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.as_str() == operation).count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Record the call and pop a scripted failure if one is queued
    fn enter(&self, operation: &str) -> BillingResult<std::sync::MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls.push(operation.to_string());
        if let Some(err) = state
            .failures
            .get_mut(operation)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        Ok(state)
    }
}

fn next_id(state: &mut MockState) -> u64 {
    state.counter += 1;
    state.counter
}

fn period_end(state: &MockState) -> Option<OffsetDateTime> {
    if state.omit_period_end {
        None
    } else {
        Some(OffsetDateTime::now_utc() + time::Duration::days(30))
    }
}

/// Open invoice plus an unconfirmed payment intent for `amount`
fn open_invoice(state: &mut MockState, customer_ref: &str, amount: Decimal) -> (String, String) {
    let n = next_id(state);
    let invoice_id = format!("in_mock_{}", n);
    let intent_id = format!("pi_mock_{}", n);
    state.intents.insert(
        intent_id.clone(),
        ProviderPaymentIntent {
            id: intent_id.clone(),
            amount,
            currency: "usd".to_string(),
            status: PaymentIntentStatus::RequiresPaymentMethod,
            client_secret: Some(format!("{}_secret", intent_id)),
            payment_method_ref: None,
            customer_ref: Some(customer_ref.to_string()),
        },
    );
    state.invoices.insert(
        invoice_id.clone(),
        ProviderInvoice {
            id: invoice_id.clone(),
            status: InvoiceStatus::Open,
            payment_intent_ref: Some(intent_id.clone()),
            amount_due: amount,
            currency: "usd".to_string(),
        },
    );
    (invoice_id, intent_id)
}

fn missing(kind: &str, id: &str) -> BillingError {
    BillingError::ProviderError(format!("No such {}: '{}'", kind, id))
}

#[async_trait]
impl ProviderGateway for MockGateway {
    async fn ensure_customer(&self, request: &EnsureCustomerRequest) -> BillingResult<String> {
        let mut state = self.enter("ensure_customer")?;
        state.idempotency_keys.push(request.idempotency_key.clone());
        if let Some(existing) = &request.existing_customer_ref {
            if state.customers.contains(existing) {
                return Ok(existing.clone());
            }
        }
        let id = format!("cus_mock_{}", next_id(&mut state));
        state.customers.push(id.clone());
        Ok(id)
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.enter("create_subscription")?;
        state.idempotency_keys.push(request.idempotency_key.clone());
        let amount = state
            .prices
            .get(&request.price_ref)
            .copied()
            .ok_or_else(|| missing("price", &request.price_ref))?;
        let (invoice_id, intent_id) = open_invoice(&mut state, &request.customer_ref, amount);
        let sub = ProviderSubscription {
            id: format!("sub_mock_{}", next_id(&mut state)),
            customer_ref: request.customer_ref.clone(),
            status: ProviderSubscriptionStatus::Incomplete,
            price_ref: Some(request.price_ref.clone()),
            current_period_end: period_end(&state),
            cancel_at_period_end: false,
            latest_invoice_ref: Some(invoice_id),
            embedded_payment_intent_ref: state.embed_payment_intent.then_some(intent_id),
        };
        state.subscriptions.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    async fn update_subscription(
        &self,
        subscription_ref: &str,
        request: &UpdateSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.enter("update_subscription")?;
        let mut sub = state
            .subscriptions
            .get(subscription_ref)
            .cloned()
            .ok_or_else(|| missing("subscription", subscription_ref))?;

        if let Some(price_ref) = &request.price_ref {
            let amount = state
                .prices
                .get(price_ref)
                .copied()
                .ok_or_else(|| missing("price", price_ref))?;
            sub.price_ref = Some(price_ref.clone());
            if request.proration == Some(ProrationBehavior::AlwaysInvoice) {
                let (invoice_id, intent_id) = open_invoice(&mut state, &sub.customer_ref, amount);
                sub.latest_invoice_ref = Some(invoice_id);
                sub.embedded_payment_intent_ref = state.embed_payment_intent.then_some(intent_id);
            }
        }
        if let Some(cancel) = request.cancel_at_period_end {
            sub.cancel_at_period_end = cancel;
        }
        sub.current_period_end = sub.current_period_end.or_else(|| period_end(&state));
        if state.omit_period_end {
            sub.current_period_end = None;
        }
        state.subscriptions.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    async fn cancel_subscription(
        &self,
        subscription_ref: &str,
        _request: &CancelSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.enter("cancel_subscription")?;
        let sub = state
            .subscriptions
            .get_mut(subscription_ref)
            .ok_or_else(|| missing("subscription", subscription_ref))?;
        sub.status = ProviderSubscriptionStatus::Canceled;
        sub.cancel_at_period_end = false;
        Ok(sub.clone())
    }

    async fn retrieve_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<ProviderSubscription> {
        let state = self.enter("retrieve_subscription")?;
        state
            .subscriptions
            .get(subscription_ref)
            .cloned()
            .ok_or_else(|| missing("subscription", subscription_ref))
    }

    async fn create_payment_intent(
        &self,
        request: &CreatePaymentIntentRequest,
    ) -> BillingResult<ProviderPaymentIntent> {
        let mut state = self.enter("create_payment_intent")?;
        state.idempotency_keys.push(request.idempotency_key.clone());
        let id = format!("pi_mock_{}", next_id(&mut state));
        let intent = ProviderPaymentIntent {
            id: id.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            status: PaymentIntentStatus::RequiresConfirmation,
            client_secret: Some(format!("{}_secret", id)),
            payment_method_ref: request.payment_method_ref.clone(),
            customer_ref: Some(request.customer_ref.clone()),
        };
        state.intents.insert(id, intent.clone());
        Ok(intent)
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_ref: &str,
    ) -> BillingResult<ProviderPaymentIntent> {
        let state = self.enter("retrieve_payment_intent")?;
        state
            .intents
            .get(payment_intent_ref)
            .cloned()
            .ok_or_else(|| missing("payment_intent", payment_intent_ref))
    }

    async fn retrieve_invoice(&self, invoice_ref: &str) -> BillingResult<ProviderInvoice> {
        let mut state = self.enter("retrieve_invoice")?;
        let delay = state.invoice_intent_delay;
        let lookups = {
            let counter = state.invoice_lookups.entry(invoice_ref.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let mut invoice = state
            .invoices
            .get(invoice_ref)
            .cloned()
            .ok_or_else(|| missing("invoice", invoice_ref))?;
        if lookups <= delay {
            invoice.payment_intent_ref = None;
        }
        Ok(invoice)
    }

    async fn pay_invoice(
        &self,
        invoice_ref: &str,
        _payment_method_ref: Option<&str>,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice> {
        let mut state = self.enter("pay_invoice")?;
        state.idempotency_keys.push(idempotency_key.to_string());
        let invoice = state
            .invoices
            .get_mut(invoice_ref)
            .ok_or_else(|| missing("invoice", invoice_ref))?;
        invoice.status = InvoiceStatus::Paid;
        Ok(invoice.clone())
    }

    async fn mark_invoice_paid_out_of_band(
        &self,
        invoice_ref: &str,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice> {
        let mut state = self.enter("mark_invoice_paid_out_of_band")?;
        state.idempotency_keys.push(idempotency_key.to_string());
        let invoice = state
            .invoices
            .get_mut(invoice_ref)
            .ok_or_else(|| missing("invoice", invoice_ref))?;
        invoice.status = InvoiceStatus::Paid;
        Ok(invoice.clone())
    }

    async fn finalize_invoice(
        &self,
        invoice_ref: &str,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice> {
        let mut state = self.enter("finalize_invoice")?;
        state.idempotency_keys.push(idempotency_key.to_string());
        let invoice = state
            .invoices
            .get_mut(invoice_ref)
            .ok_or_else(|| missing("invoice", invoice_ref))?;
        if invoice.status == InvoiceStatus::Draft {
            invoice.status = InvoiceStatus::Open;
        }
        Ok(invoice.clone())
    }

    async fn refund(&self, request: &RefundRequest) -> BillingResult<ProviderRefund> {
        let mut state = self.enter("refund")?;
        state.refunds.push(request.clone());
        Ok(ProviderRefund {
            id: format!("re_mock_{}", next_id(&mut state)),
            amount: request.amount,
            status: "succeeded".to_string(),
        })
    }
}
