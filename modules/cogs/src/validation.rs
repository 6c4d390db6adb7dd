//! Structural validation of run requests.
//!
//! These checks run before any state change and fail the whole call;
//! per-row findings discovered during allocation are a different thing
//! (data, recorded with the run) and live in `domain::ValidationRecord`.

use std::collections::HashSet;
use std::fmt;

use crate::domain::{PurchaseLot, Sale};
use crate::tenant::TenantId;

/// One offending input, reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputViolation {
    /// Which input the violation refers to (a sale id, a lot id, a field).
    pub reference: String,
    pub message: String,
}

impl InputViolation {
    fn new(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for InputViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reference, self.message)
    }
}

pub fn format_violations(violations: &[InputViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate the structural shape of a run request. Returns every violation
/// found; an empty vector means the request may proceed.
///
/// An empty `tenant_id` on a sale or lot is tolerated here (the coordinator
/// stamps the scope's tenant onto it); a populated mismatching one is a
/// violation.
pub fn validate_run_request(
    tenant: &TenantId,
    sales: &[Sale],
    lots_upsert: &[PurchaseLot],
) -> Vec<InputViolation> {
    let mut violations = Vec::new();

    if sales.is_empty() {
        violations.push(InputViolation::new("sales", "sales list is empty"));
    }

    let mut seen_sales = HashSet::new();
    for sale in sales {
        if sale.sale_id.is_empty() {
            violations.push(InputViolation::new("sale", "sale_id is empty"));
            continue;
        }
        if !seen_sales.insert(sale.sale_id.as_str()) {
            violations.push(InputViolation::new(
                &sale.sale_id,
                "duplicate sale_id in request",
            ));
        }
        if sale.sku.is_empty() {
            violations.push(InputViolation::new(&sale.sale_id, "sku is empty"));
        }
        if sale.quantity == 0 {
            violations.push(InputViolation::new(&sale.sale_id, "quantity must be non-zero"));
        }
        if !sale.tenant_id.is_empty() && sale.tenant_id != tenant.as_str() {
            violations.push(InputViolation::new(
                &sale.sale_id,
                format!("belongs to tenant {:?}", sale.tenant_id),
            ));
        }
    }

    let mut seen_lots = HashSet::new();
    for lot in lots_upsert {
        if lot.lot_id.is_empty() {
            violations.push(InputViolation::new("lot", "lot_id is empty"));
            continue;
        }
        if !seen_lots.insert(lot.lot_id.as_str()) {
            violations.push(InputViolation::new(
                &lot.lot_id,
                "duplicate lot_id in request",
            ));
        }
        if !lot.tenant_id.is_empty() && lot.tenant_id != tenant.as_str() {
            violations.push(InputViolation::new(
                &lot.lot_id,
                format!("belongs to tenant {:?}", lot.tenant_id),
            ));
        }
        if let Err(detail) = lot.check_invariants() {
            violations.push(InputViolation::new(&lot.lot_id, detail));
        }
    }

    violations
}
