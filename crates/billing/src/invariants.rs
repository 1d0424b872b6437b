//! Billing Invariants Module
//!
//! Consistency checks over subscription records. The reconciliation worker
//! runs them after every sweep; tests run them after every transition.
//!
//! Checks only read. Violations carry enough context to debug.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{SubscriptionKind, SubscriptionRecord, SubscriptionStatus};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub account_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Access or charging is wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub records_checked: usize,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

type Check = fn(&SubscriptionRecord) -> Option<InvariantViolation>;

const CHECKS: [(&str, Check); 5] = [
    ("active_matches_status", check_active_matches_status),
    ("free_kind_matches_status", check_free_kind_matches_status),
    ("active_has_next_billing_date", check_active_has_next_billing_date),
    ("pending_cancel_has_end_date", check_pending_cancel_has_end_date),
    ("cancel_flag_matches_status", check_cancel_flag_matches_status),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct InvariantChecker;

impl InvariantChecker {
    pub fn new() -> Self {
        Self
    }

    /// Run every check against every record
    pub fn run_all_checks(&self, records: &[SubscriptionRecord]) -> InvariantCheckSummary {
        let violations: Vec<_> = records
            .iter()
            .flat_map(|r| self.check_record(r))
            .collect();

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            records_checked: records.len(),
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    pub fn check_record(&self, record: &SubscriptionRecord) -> Vec<InvariantViolation> {
        CHECKS.iter().filter_map(|(_, check)| check(record)).collect()
    }

    /// Run a single invariant check by name
    pub fn run_check(&self, name: &str, records: &[SubscriptionRecord]) -> Vec<InvariantViolation> {
        match CHECKS.iter().find(|(n, _)| *n == name) {
            Some((_, check)) => records.iter().filter_map(check).collect(),
            None => vec![],
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.iter().map(|(name, _)| *name).collect()
    }
}

fn violation(
    invariant: &str,
    record: &SubscriptionRecord,
    description: String,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        account_ids: vec![record.account_id],
        description,
        context: serde_json::json!({
            "subscription_ref": record.subscription_ref(),
            "status": record.status.as_str(),
            "active": record.active,
            "cancel_at_period_end": record.cancel_at_period_end,
            "plan_id": record.plan_id,
        }),
        severity,
    }
}

/// `active` must mirror `status == active`; access decisions read it
fn check_active_matches_status(record: &SubscriptionRecord) -> Option<InvariantViolation> {
    let expected = record.status == SubscriptionStatus::Active;
    (record.active != expected).then(|| {
        violation(
            "active_matches_status",
            record,
            format!(
                "active={} but status is {}",
                record.active, record.status
            ),
            ViolationSeverity::Critical,
        )
    })
}

fn check_free_kind_matches_status(record: &SubscriptionRecord) -> Option<InvariantViolation> {
    let is_free_status = record.status == SubscriptionStatus::Free;
    match (&record.kind, is_free_status) {
        (SubscriptionKind::Free { .. }, false) => Some(violation(
            "free_kind_matches_status",
            record,
            format!("free subscription has status {}", record.status),
            ViolationSeverity::High,
        )),
        (SubscriptionKind::Provisioned(_), true) => Some(violation(
            "free_kind_matches_status",
            record,
            "provider-backed subscription has status free".to_string(),
            ViolationSeverity::High,
        )),
        _ => None,
    }
}

fn check_active_has_next_billing_date(record: &SubscriptionRecord) -> Option<InvariantViolation> {
    (record.status == SubscriptionStatus::Active && record.next_billing_date.is_none()).then(|| {
        violation(
            "active_has_next_billing_date",
            record,
            "active subscription has no next billing date".to_string(),
            ViolationSeverity::Medium,
        )
    })
}

fn check_pending_cancel_has_end_date(record: &SubscriptionRecord) -> Option<InvariantViolation> {
    (record.status == SubscriptionStatus::CanceledAtPeriodEnd
        && record.subscription_end_date.is_none())
    .then(|| {
        violation(
            "pending_cancel_has_end_date",
            record,
            "subscription set to cancel at period end has no end date".to_string(),
            ViolationSeverity::Medium,
        )
    })
}

fn check_cancel_flag_matches_status(record: &SubscriptionRecord) -> Option<InvariantViolation> {
    let pending = record.status == SubscriptionStatus::CanceledAtPeriodEnd;
    (pending != record.cancel_at_period_end).then(|| {
        violation(
            "cancel_flag_matches_status",
            record,
            format!(
                "cancel_at_period_end={} but status is {}",
                record.cancel_at_period_end, record.status
            ),
            ViolationSeverity::Low,
        )
    })
}
