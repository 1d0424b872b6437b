//! Guards checked before every lifecycle transition
//!
//! Each guard either passes or returns the error the caller should see. None
//! of them touch the provider, so a failing guard never leaves partial state.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{SubscriptionRecord, SubscriptionStatus};
use crate::plans::{PaymentMethod, PaymentMethodStore, Plan};

/// Longest plan id accepted from callers
const MAX_PLAN_ID_LEN: usize = 64;

pub struct SubscriptionValidator {
    payment_methods: Arc<dyn PaymentMethodStore>,
}

impl SubscriptionValidator {
    pub fn new(payment_methods: Arc<dyn PaymentMethodStore>) -> Self {
        Self { payment_methods }
    }

    pub fn exists(
        &self,
        record: Option<SubscriptionRecord>,
        lookup: &str,
    ) -> BillingResult<SubscriptionRecord> {
        record.ok_or_else(|| BillingError::NotFound(format!("No subscription found for {}", lookup)))
    }

    pub fn plan_exists(&self, plan: Option<Plan>, plan_id: &str) -> BillingResult<Plan> {
        plan.ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))
    }

    /// Reject malformed plan ids before they reach the catalog
    pub fn plan_id<'a>(&self, raw: &'a str) -> BillingResult<&'a str> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(BillingError::InvalidArgument(
                "plan id must not be empty".to_string(),
            ));
        }
        if trimmed.len() != raw.len() || raw.len() > MAX_PLAN_ID_LEN {
            return Err(BillingError::InvalidArgument(format!(
                "malformed plan id '{}'",
                raw
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(BillingError::InvalidArgument(format!(
                "malformed plan id '{}'",
                raw
            )));
        }
        Ok(raw)
    }

    pub fn not_free_placeholder(
        &self,
        record: &SubscriptionRecord,
        operation: &str,
    ) -> BillingResult<()> {
        if record.kind.is_free() {
            return Err(BillingError::InvalidState(format!(
                "Cannot {} a free subscription",
                operation
            )));
        }
        Ok(())
    }

    pub fn is_active(&self, record: &SubscriptionRecord, operation: &str) -> BillingResult<()> {
        if !record.active {
            return Err(BillingError::InvalidState(format!(
                "Cannot {} an inactive subscription (status {})",
                operation, record.status
            )));
        }
        Ok(())
    }

    pub fn not_pending_cancel(
        &self,
        record: &SubscriptionRecord,
        operation: &str,
    ) -> BillingResult<()> {
        if record.cancel_at_period_end {
            return Err(BillingError::InvalidState(format!(
                "Cannot {} a subscription that is set to cancel at period end",
                operation
            )));
        }
        Ok(())
    }

    /// Reactivation only makes sense for a subscription that is winding down
    pub fn can_reactivate(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        if record.active && !record.cancel_at_period_end {
            return Err(BillingError::InvalidState(
                "Subscription is already active and not set to cancel".to_string(),
            ));
        }
        if record.status == SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidState(
                "Subscription has been canceled and cannot be reactivated".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_upgrade(&self, current: &Plan, new: &Plan) -> BillingResult<()> {
        if new.amount <= current.amount {
            return Err(BillingError::InvalidArgument(format!(
                "Plan {} ({}) is not an upgrade from {} ({})",
                new.id, new.amount, current.id, current.amount
            )));
        }
        Ok(())
    }

    pub fn is_downgrade(&self, current: &Plan, new: &Plan) -> BillingResult<()> {
        if new.amount >= current.amount {
            return Err(BillingError::InvalidArgument(format!(
                "Plan {} ({}) is not a downgrade from {} ({})",
                new.id, new.amount, current.id, current.amount
            )));
        }
        Ok(())
    }

    /// Returns the matched method, or `None` for an empty id. Callers may pass
    /// either the local id or the provider ref.
    pub async fn payment_method_belongs_to_account(
        &self,
        payment_method_id: &str,
        account_id: Uuid,
    ) -> BillingResult<Option<PaymentMethod>> {
        if payment_method_id.is_empty() {
            return Ok(None);
        }
        let methods = self.payment_methods.list_for_account(account_id).await?;
        methods
            .into_iter()
            .find(|m| m.id == payment_method_id || m.provider_payment_method_ref == payment_method_id)
            .map(Some)
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "Payment method {} not found for account {}",
                    payment_method_id, account_id
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::InMemoryPaymentMethodStore;
    use crate::models::{ProviderRefs, SubscriptionKind};
    use crate::plans::BillingInterval;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn plan(id: &str, amount: Decimal) -> Plan {
        Plan {
            id: id.to_string(),
            name: id.to_string(),
            amount,
            currency: "usd".to_string(),
            interval: BillingInterval::Month,
            provider_price_ref: format!("price_{}", id),
        }
    }

    fn validator() -> (SubscriptionValidator, Arc<InMemoryPaymentMethodStore>) {
        let methods = Arc::new(InMemoryPaymentMethodStore::new());
        (SubscriptionValidator::new(methods.clone()), methods)
    }

    fn paid_record() -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new_free(Uuid::new_v4(), OffsetDateTime::now_utc());
        record.kind = SubscriptionKind::Provisioned(ProviderRefs {
            subscription_ref: "sub_1".to_string(),
            customer_ref: "cus_1".to_string(),
        });
        record.plan_id = "pro".to_string();
        record.set_status(SubscriptionStatus::Active);
        record
    }

    // =========================================================================
    // Direction guards
    // =========================================================================

    #[test]
    fn test_upgrade_accepts_only_strictly_higher_amounts() {
        let (v, _) = validator();
        let pairs = [
            (dec!(10), dec!(20), true),
            (dec!(20), dec!(10), false),
            (dec!(10), dec!(10), false),
            (dec!(0), dec!(0.01), true),
        ];
        for (current, new, accepted) in pairs {
            let result = v.is_upgrade(&plan("a", current), &plan("b", new));
            assert_eq!(result.is_ok(), accepted, "{} -> {}", current, new);
            if let Err(e) = result {
                assert_eq!(e.kind(), ErrorKind::InvalidArgument);
            }
        }
    }

    #[test]
    fn test_downgrade_accepts_only_strictly_lower_amounts() {
        let (v, _) = validator();
        let pairs = [
            (dec!(20), dec!(10), true),
            (dec!(10), dec!(20), false),
            (dec!(15), dec!(15), false),
        ];
        for (current, new, accepted) in pairs {
            let result = v.is_downgrade(&plan("a", current), &plan("b", new));
            assert_eq!(result.is_ok(), accepted, "{} -> {}", current, new);
        }
    }

    // =========================================================================
    // State guards
    // =========================================================================

    #[test]
    fn test_free_placeholder_is_invalid_state() {
        let (v, _) = validator();
        let record = SubscriptionRecord::new_free(Uuid::new_v4(), OffsetDateTime::now_utc());
        let err = v.not_free_placeholder(&record, "cancel").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(v.not_free_placeholder(&paid_record(), "cancel").is_ok());
    }

    #[test]
    fn test_is_active_and_pending_cancel() {
        let (v, _) = validator();
        let mut record = paid_record();
        assert!(v.is_active(&record, "cancel").is_ok());
        assert!(v.not_pending_cancel(&record, "downgrade").is_ok());

        record.cancel_at_period_end = true;
        record.set_status(SubscriptionStatus::CanceledAtPeriodEnd);
        assert_eq!(
            v.is_active(&record, "cancel").unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            v.not_pending_cancel(&record, "downgrade").unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_reactivate_guard() {
        let (v, _) = validator();
        let mut record = paid_record();
        let err = v.can_reactivate(&record).unwrap_err();
        assert!(err.to_string().contains("already active and not set to cancel"));

        record.cancel_at_period_end = true;
        assert!(v.can_reactivate(&record).is_ok());

        record.cancel_at_period_end = false;
        record.set_status(SubscriptionStatus::Canceled);
        assert_eq!(
            v.can_reactivate(&record).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_exists_and_plan_exists_are_not_found() {
        let (v, _) = validator();
        assert_eq!(
            v.exists(None, "account 1").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            v.plan_exists(None, "gold").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_plan_id_format() {
        let (v, _) = validator();
        assert_eq!(v.plan_id("pro_monthly").unwrap(), "pro_monthly");
        for bad in ["", "   ", " pro", "pro plan", "pro;drop"] {
            assert_eq!(
                v.plan_id(bad).unwrap_err().kind(),
                ErrorKind::InvalidArgument,
                "{:?}",
                bad
            );
        }
        assert!(v.plan_id(&"x".repeat(65)).is_err());
    }

    // =========================================================================
    // Payment method ownership
    // =========================================================================

    #[tokio::test]
    async fn test_payment_method_ownership() {
        let (v, methods) = validator();
        let owner = Uuid::new_v4();
        methods.add(PaymentMethod {
            id: "pm_local".to_string(),
            account_id: owner,
            provider_payment_method_ref: "pm_card_visa".to_string(),
        });

        assert!(v
            .payment_method_belongs_to_account("", owner)
            .await
            .unwrap()
            .is_none());
        let by_provider_ref = v
            .payment_method_belongs_to_account("pm_card_visa", owner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_provider_ref.id, "pm_local");
        let by_local_id = v
            .payment_method_belongs_to_account("pm_local", owner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_local_id.provider_payment_method_ref, "pm_card_visa");

        let err = v
            .payment_method_belongs_to_account("pm_card_visa", Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
