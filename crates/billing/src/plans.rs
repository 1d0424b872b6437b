//! Plan catalog and payment-method lookups
//!
//! Both are owned elsewhere; this crate only reads them.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BillingResult;

/// Billing interval of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    /// Day count used for proration
    pub fn days(&self) -> u32 {
        match self {
            BillingInterval::Day => 1,
            BillingInterval::Week => 7,
            BillingInterval::Month => 30,
            BillingInterval::Year => 365,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Day => "day",
            BillingInterval::Week => "week",
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "day" => Some(BillingInterval::Day),
            "week" => Some(BillingInterval::Week),
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            _ => None,
        }
    }
}

/// A priced offering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub amount: Decimal,
    pub currency: String,
    pub interval: BillingInterval,
    /// Provider price id; empty for the free plan
    pub provider_price_ref: String,
}

/// A stored payment method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    pub account_id: Uuid,
    pub provider_payment_method_ref: String,
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn by_id(&self, plan_id: &str) -> BillingResult<Option<Plan>>;
}

#[async_trait]
pub trait PaymentMethodStore: Send + Sync {
    async fn list_for_account(&self, account_id: Uuid) -> BillingResult<Vec<PaymentMethod>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_days() {
        assert_eq!(BillingInterval::Day.days(), 1);
        assert_eq!(BillingInterval::Week.days(), 7);
        assert_eq!(BillingInterval::Month.days(), 30);
        assert_eq!(BillingInterval::Year.days(), 365);
    }
}
