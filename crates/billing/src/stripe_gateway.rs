//! Stripe implementation of [`ProviderGateway`]
//!
//! Amounts are converted between decimal major units and Stripe's integer
//! minor units assuming two-decimal currencies. Mutating calls that carry an
//! idempotency key go through an idempotent client.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use stripe::{
    CancelSubscription, CreateCustomer, CreatePaymentIntent, CreateRefund, CreateSubscription,
    CreateSubscriptionItems, Customer, CustomerId, Expandable, Invoice, InvoiceId, PaymentIntent,
    PaymentIntentId, PaymentMethodId, Refund, RefundReasonFilter, Subscription, SubscriptionId,
    SubscriptionPaymentBehavior, UpdateSubscription,
    UpdateSubscriptionItems,
};
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    CancelSubscriptionRequest, CreatePaymentIntentRequest, CreateSubscriptionRequest,
    EnsureCustomerRequest, InvoiceStatus, ProrationBehavior, ProviderGateway, ProviderInvoice,
    ProviderPaymentIntent, ProviderRefund, ProviderSubscription, ProviderSubscriptionStatus,
    RefundRequest, UpdateSubscriptionRequest,
};
use crate::models::PaymentIntentStatus;

/// Expansion that lets one round trip carry the first invoice's payment intent
const EXPAND_PAYMENT_INTENT: &[&str] = &["latest_invoice.payment_intent"];

/// Metadata key some integrations use to pin a payment intent on the subscription
const PAYMENT_INTENT_METADATA_KEY: &str = "payment_intent_id";

/// Form for `/invoices/{id}/pay`; async-stripe's `Invoice::pay` takes no parameters
#[derive(Clone, Debug, Default, serde::Serialize)]
struct PayInvoiceForm {
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    paid_out_of_band: Option<bool>,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
struct FinalizeInvoiceForm {
    auto_advance: bool,
}

pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeClient::from_env()?))
    }

    async fn first_item_id(&self, subscription_id: &SubscriptionId) -> BillingResult<String> {
        let current = Subscription::retrieve(self.stripe.inner(), subscription_id, &[]).await?;
        current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::ProviderError(format!(
                    "Subscription {} has no items",
                    subscription_id
                ))
            })
    }

    async fn post_invoice_action(
        &self,
        invoice_ref: &str,
        action: &str,
        idempotency_key: &str,
        form: impl serde::Serialize + Send,
    ) -> BillingResult<ProviderInvoice> {
        let invoice_id = parse_id::<InvoiceId>(invoice_ref, "invoice")?;
        let client = self.stripe.idempotent(idempotency_key);
        let invoice: Invoice = client
            .post_form(&format!("/invoices/{}/{}", invoice_id, action), form)
            .await?;
        invoice_from_stripe(&invoice)
    }
}

#[async_trait]
impl ProviderGateway for StripeGateway {
    async fn ensure_customer(&self, request: &EnsureCustomerRequest) -> BillingResult<String> {
        if let Some(existing) = &request.existing_customer_ref {
            let customer_id = parse_id::<CustomerId>(existing, "customer")?;
            let customer = Customer::retrieve(self.stripe.inner(), &customer_id, &[]).await?;
            if !customer.deleted {
                tracing::debug!(
                    account_id = %request.account_id,
                    customer_id = %customer.id,
                    "Reusing existing Stripe customer"
                );
                return Ok(customer.id.to_string());
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("account_id".to_string(), request.account_id.to_string());

        let params = CreateCustomer {
            metadata: Some(metadata),
            payment_method: request
                .payment_method_ref
                .as_deref()
                .map(|pm| parse_id::<PaymentMethodId>(pm, "payment method"))
                .transpose()?,
            ..Default::default()
        };

        let client = self.stripe.idempotent(&request.idempotency_key);
        let customer = Customer::create(&client, params).await?;

        tracing::info!(
            account_id = %request.account_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );
        Ok(customer.id.to_string())
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription> {
        let customer_id = parse_id::<CustomerId>(&request.customer_ref, "customer")?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(request.price_ref.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(request.metadata.clone());
        params.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
        params.default_payment_method = request.payment_method_ref.as_deref();
        params.expand = EXPAND_PAYMENT_INTENT;

        let client = self.stripe.idempotent(&request.idempotency_key);
        let subscription = Subscription::create(&client, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            price_ref = %request.price_ref,
            "Created Stripe subscription with deferred payment"
        );
        Ok(subscription_from_stripe(&subscription))
    }

    async fn update_subscription(
        &self,
        subscription_ref: &str,
        request: &UpdateSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription> {
        let subscription_id = parse_id::<SubscriptionId>(subscription_ref, "subscription")?;

        let items = match &request.price_ref {
            Some(price_ref) => Some(vec![UpdateSubscriptionItems {
                id: Some(self.first_item_id(&subscription_id).await?),
                price: Some(price_ref.clone()),
                ..Default::default()
            }]),
            None => None,
        };

        let params = UpdateSubscription {
            items,
            proration_behavior: request.proration.map(|p| match p {
                ProrationBehavior::AlwaysInvoice => SubscriptionProrationBehavior::AlwaysInvoice,
                ProrationBehavior::CreateProrations => {
                    SubscriptionProrationBehavior::CreateProrations
                }
                ProrationBehavior::None => SubscriptionProrationBehavior::None,
            }),
            payment_behavior: request
                .defer_payment
                .then_some(SubscriptionPaymentBehavior::DefaultIncomplete),
            cancel_at_period_end: request.cancel_at_period_end,
            metadata: (!request.metadata.is_empty()).then(|| request.metadata.clone()),
            expand: EXPAND_PAYMENT_INTENT,
            ..Default::default()
        };

        let subscription = match &request.idempotency_key {
            Some(key) => {
                let client = self.stripe.idempotent(key);
                Subscription::update(&client, &subscription_id, params).await?
            }
            None => Subscription::update(self.stripe.inner(), &subscription_id, params).await?,
        };

        tracing::info!(
            subscription_id = %subscription.id,
            price_ref = ?request.price_ref,
            cancel_at_period_end = ?request.cancel_at_period_end,
            "Updated Stripe subscription"
        );
        Ok(subscription_from_stripe(&subscription))
    }

    async fn cancel_subscription(
        &self,
        subscription_ref: &str,
        request: &CancelSubscriptionRequest,
    ) -> BillingResult<ProviderSubscription> {
        let subscription_id = parse_id::<SubscriptionId>(subscription_ref, "subscription")?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: Some(request.invoice_now),
            prorate: Some(request.prorate),
        };

        let subscription = Subscription::cancel(self.stripe.inner(), &subscription_id, params).await?;

        tracing::info!(subscription_id = %subscription.id, "Cancelled Stripe subscription");
        Ok(subscription_from_stripe(&subscription))
    }

    async fn retrieve_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<ProviderSubscription> {
        let subscription_id = parse_id::<SubscriptionId>(subscription_ref, "subscription")?;
        let subscription =
            Subscription::retrieve(self.stripe.inner(), &subscription_id, EXPAND_PAYMENT_INTENT)
                .await?;
        Ok(subscription_from_stripe(&subscription))
    }

    async fn create_payment_intent(
        &self,
        request: &CreatePaymentIntentRequest,
    ) -> BillingResult<ProviderPaymentIntent> {
        let mut params =
            CreatePaymentIntent::new(to_minor_units(request.amount)?, parse_currency(&request.currency)?);
        params.customer = Some(parse_id::<CustomerId>(&request.customer_ref, "customer")?);
        params.payment_method = request
            .payment_method_ref
            .as_deref()
            .map(|pm| parse_id::<PaymentMethodId>(pm, "payment method"))
            .transpose()?;
        params.metadata = Some(request.metadata.clone());

        let client = self.stripe.idempotent(&request.idempotency_key);
        let intent = PaymentIntent::create(&client, params).await?;
        Ok(payment_intent_from_stripe(&intent))
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_ref: &str,
    ) -> BillingResult<ProviderPaymentIntent> {
        let intent_id = parse_id::<PaymentIntentId>(payment_intent_ref, "payment intent")?;
        let intent = PaymentIntent::retrieve(self.stripe.inner(), &intent_id, &[]).await?;
        Ok(payment_intent_from_stripe(&intent))
    }

    async fn retrieve_invoice(&self, invoice_ref: &str) -> BillingResult<ProviderInvoice> {
        let invoice_id = parse_id::<InvoiceId>(invoice_ref, "invoice")?;
        let invoice = Invoice::retrieve(self.stripe.inner(), &invoice_id, &[]).await?;
        invoice_from_stripe(&invoice)
    }

    async fn pay_invoice(
        &self,
        invoice_ref: &str,
        payment_method_ref: Option<&str>,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice> {
        self.post_invoice_action(
            invoice_ref,
            "pay",
            idempotency_key,
            PayInvoiceForm {
                payment_method: payment_method_ref.map(str::to_string),
                paid_out_of_band: None,
            },
        )
        .await
    }

    async fn mark_invoice_paid_out_of_band(
        &self,
        invoice_ref: &str,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice> {
        self.post_invoice_action(
            invoice_ref,
            "pay",
            idempotency_key,
            PayInvoiceForm {
                payment_method: None,
                paid_out_of_band: Some(true),
            },
        )
        .await
    }

    async fn finalize_invoice(
        &self,
        invoice_ref: &str,
        idempotency_key: &str,
    ) -> BillingResult<ProviderInvoice> {
        self.post_invoice_action(
            invoice_ref,
            "finalize",
            idempotency_key,
            FinalizeInvoiceForm {
                auto_advance: false,
            },
        )
        .await
    }

    async fn refund(&self, request: &RefundRequest) -> BillingResult<ProviderRefund> {
        let mut params = CreateRefund::new();
        params.payment_intent = Some(parse_id::<PaymentIntentId>(
            &request.payment_intent_ref,
            "payment intent",
        )?);
        params.amount = Some(to_minor_units(request.amount)?);
        params.reason = Some(RefundReasonFilter::RequestedByCustomer);

        let mut metadata = HashMap::new();
        metadata.insert("reason".to_string(), request.reason.clone());
        params.metadata = Some(metadata);

        let client = self.stripe.idempotent(&request.idempotency_key);
        let refund = Refund::create(&client, params).await?;

        Ok(ProviderRefund {
            id: refund.id.to_string(),
            amount: from_minor_units(refund.amount),
            status: refund
                .status
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_default(),
        })
    }
}

// =============================================================================
// Conversions
// =============================================================================

fn parse_id<T: std::str::FromStr>(raw: &str, kind: &str) -> BillingResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| BillingError::InvalidArgument(format!("Invalid {} ID '{}': {}", kind, raw, e)))
}

fn parse_currency(code: &str) -> BillingResult<stripe::Currency> {
    serde_json::from_value(serde_json::Value::String(code.to_lowercase()))
        .map_err(|_| BillingError::InvalidArgument(format!("Unsupported currency '{}'", code)))
}

/// Major units to integer minor units, truncating sub-cent fractions
pub(crate) fn to_minor_units(amount: Decimal) -> BillingResult<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::ToZero)
        .to_i64()
        .ok_or_else(|| BillingError::InvalidArgument(format!("Amount {} out of range", amount)))
}

pub(crate) fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

fn timestamp(ts: i64) -> Option<OffsetDateTime> {
    if ts <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

fn subscription_from_stripe(subscription: &Subscription) -> ProviderSubscription {
    let customer_ref = match &subscription.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    };

    let (latest_invoice_ref, expanded_intent_ref) = match &subscription.latest_invoice {
        Some(Expandable::Id(id)) => (Some(id.to_string()), None),
        Some(Expandable::Object(invoice)) => (
            Some(invoice.id.to_string()),
            invoice.payment_intent.as_ref().map(|pi| match pi {
                Expandable::Id(id) => id.to_string(),
                Expandable::Object(intent) => intent.id.to_string(),
            }),
        ),
        None => (None, None),
    };

    let embedded_payment_intent_ref = expanded_intent_ref.or_else(|| {
        subscription
            .metadata
            .get(PAYMENT_INTENT_METADATA_KEY)
            .cloned()
    });

    ProviderSubscription {
        id: subscription.id.to_string(),
        customer_ref,
        status: ProviderSubscriptionStatus::parse(&subscription.status.to_string()),
        price_ref: subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string()),
        current_period_end: timestamp(subscription.current_period_end),
        cancel_at_period_end: subscription.cancel_at_period_end,
        latest_invoice_ref,
        embedded_payment_intent_ref,
    }
}

fn invoice_from_stripe(invoice: &Invoice) -> BillingResult<ProviderInvoice> {
    Ok(ProviderInvoice {
        id: invoice.id.to_string(),
        status: invoice
            .status
            .as_ref()
            .map(|s| InvoiceStatus::parse(&s.to_string()))
            .unwrap_or(InvoiceStatus::Draft),
        payment_intent_ref: invoice.payment_intent.as_ref().map(|pi| match pi {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(intent) => intent.id.to_string(),
        }),
        amount_due: from_minor_units(invoice.amount_due.unwrap_or(0)),
        currency: invoice
            .currency
            .map(|c| c.to_string())
            .unwrap_or_default(),
    })
}

fn payment_intent_from_stripe(intent: &PaymentIntent) -> ProviderPaymentIntent {
    ProviderPaymentIntent {
        id: intent.id.to_string(),
        amount: from_minor_units(intent.amount),
        currency: intent.currency.to_string(),
        status: PaymentIntentStatus::parse(&intent.status.to_string()),
        client_secret: intent.client_secret.clone(),
        payment_method_ref: intent.payment_method.as_ref().map(|pm| match pm {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(method) => method.id.to_string(),
        }),
        customer_ref: intent.customer.as_ref().map(|c| match c {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(customer) => customer.id.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_minor_unit_conversion() {
        assert_eq!(to_minor_units(dec!(29.99)).unwrap(), 2999);
        assert_eq!(to_minor_units(dec!(10)).unwrap(), 1000);
        // Sub-cent fractions never round up into an extra cent
        assert_eq!(to_minor_units(dec!(6.669)).unwrap(), 666);
        assert_eq!(from_minor_units(2999), dec!(29.99));
    }

    #[test]
    fn test_timestamp_zero_is_missing() {
        assert!(timestamp(0).is_none());
        assert!(timestamp(1_700_000_000).is_some());
    }

    #[test]
    fn test_parse_id_rejects_wrong_prefix() {
        assert!(parse_id::<CustomerId>("cus_123", "customer").is_ok());
        let err = parse_id::<CustomerId>("sub_123", "customer").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_parse_currency() {
        assert_eq!(parse_currency("USD").unwrap(), stripe::Currency::USD);
        assert!(parse_currency("not-a-currency").is_err());
    }

    #[test]
    fn test_pay_form_omits_unset_fields() {
        let form = serde_json::to_value(PayInvoiceForm {
            payment_method: None,
            paid_out_of_band: Some(true),
        })
        .unwrap();
        assert_eq!(form, serde_json::json!({ "paid_out_of_band": true }));
    }
}
