//! Proration for mid-cycle plan changes

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationType {
    Charge,
    Credit,
}

/// Credit or charge for switching plans with `days_remaining` left in the cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProrationCalculation {
    pub from_plan_id: String,
    pub to_plan_id: String,
    pub days_remaining: u32,
    pub current_amount: Decimal,
    pub new_amount: Decimal,
    pub unused_ratio: Decimal,
    /// Negative means the customer is credited
    pub proration_amount: Decimal,
    pub next_billing_amount: Decimal,
    pub total_impact: Decimal,
    pub savings: Decimal,
    #[serde(rename = "type")]
    pub proration_type: ProrationType,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProrationCalculator;

impl ProrationCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Pure computation; callers guarantee `interval_days > 0`
    pub fn compute(
        &self,
        current_amount: Decimal,
        new_amount: Decimal,
        days_remaining: u32,
        interval_days: u32,
    ) -> ProrationCalculation {
        let unused_ratio = (Decimal::from(days_remaining) / Decimal::from(interval_days.max(1)))
            .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero);
        let credit_for_unused = money(current_amount * unused_ratio);

        let (proration_amount, proration_type) = if new_amount > current_amount {
            (Decimal::ZERO - credit_for_unused, ProrationType::Credit)
        } else {
            (credit_for_unused, ProrationType::Charge)
        };

        let next_billing_amount = money(new_amount);

        ProrationCalculation {
            from_plan_id: String::new(),
            to_plan_id: String::new(),
            days_remaining,
            current_amount,
            new_amount,
            unused_ratio,
            proration_amount,
            next_billing_amount,
            total_impact: proration_amount + next_billing_amount,
            savings: (Decimal::ZERO - proration_amount).max(Decimal::ZERO),
            proration_type,
        }
    }

    pub fn compute_for_plans(
        &self,
        from_plan_id: &str,
        to_plan_id: &str,
        current_amount: Decimal,
        new_amount: Decimal,
        days_remaining: u32,
        interval_days: u32,
    ) -> ProrationCalculation {
        ProrationCalculation {
            from_plan_id: from_plan_id.to_string(),
            to_plan_id: to_plan_id.to_string(),
            ..self.compute(current_amount, new_amount, days_remaining, interval_days)
        }
    }
}

/// Two decimals, half-up
fn money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_upgrade_half_cycle_is_credit() {
        let calc = ProrationCalculator::new().compute(dec!(100), dec!(150), 15, 30);

        assert_eq!(calc.unused_ratio, dec!(0.5));
        assert_eq!(calc.proration_amount, dec!(-50));
        assert_eq!(calc.proration_type, ProrationType::Credit);
        assert_eq!(calc.savings, dec!(50));
        assert_eq!(calc.next_billing_amount, dec!(150));
        assert_eq!(calc.total_impact, dec!(100));
    }

    #[test]
    fn test_downgrade_half_cycle_is_charge() {
        let calc = ProrationCalculator::new().compute(dec!(100), dec!(50), 15, 30);

        assert_eq!(calc.proration_amount, dec!(50));
        assert_eq!(calc.proration_type, ProrationType::Charge);
        assert_eq!(calc.savings, Decimal::ZERO);
        assert_eq!(calc.total_impact, dec!(100));
    }

    #[test]
    fn test_equal_amounts_charge_unused_time() {
        let calc = ProrationCalculator::new().compute(dec!(20), dec!(20), 10, 30);
        assert_eq!(calc.proration_type, ProrationType::Charge);
        // 10/30 = 0.3333 after 4-decimal rounding
        assert_eq!(calc.unused_ratio, dec!(0.3333));
        assert_eq!(calc.proration_amount, dec!(6.67));
    }

    #[test]
    fn test_ratio_rounds_half_up_at_four_decimals() {
        // 1/7 = 0.142857... -> 0.1429
        let calc = ProrationCalculator::new().compute(dec!(70), dec!(140), 1, 7);
        assert_eq!(calc.unused_ratio, dec!(0.1429));
        assert_eq!(calc.proration_amount, dec!(-10.00));
    }

    #[test]
    fn test_no_days_remaining_is_zero_proration() {
        let calc = ProrationCalculator::new().compute(dec!(99.99), dec!(199.99), 0, 30);
        assert_eq!(calc.proration_amount, Decimal::ZERO);
        assert_eq!(calc.savings, Decimal::ZERO);
        assert_eq!(calc.total_impact, dec!(199.99));
    }

    #[test]
    fn test_yearly_interval() {
        let calc = ProrationCalculator::new().compute(dec!(365), dec!(730), 73, 365);
        assert_eq!(calc.unused_ratio, dec!(0.2));
        assert_eq!(calc.proration_amount, dec!(-73));
    }

    #[test]
    fn test_plan_ids_are_carried() {
        let calc =
            ProrationCalculator::new().compute_for_plans("pro", "team", dec!(10), dec!(30), 5, 30);
        assert_eq!(calc.from_plan_id, "pro");
        assert_eq!(calc.to_plan_id, "team");
    }
}
