//! Core value types for the FIFO COGS engine.
//!
//! Every persisted entity carries a `tenant_id`; the tenant scope verifies it
//! before any I/O. Monetary values are fixed-point decimals (4 fractional
//! digits intermediate, 2 final); quantities are integral.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A single purchase lot: a batch of units of one SKU received on one date
/// at a known unit cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseLot {
    pub tenant_id: String,
    pub lot_id: String,
    pub sku: String,
    pub received_date: NaiveDate,
    pub original_quantity: i64,
    pub remaining_quantity: i64,
    pub unit_price: Decimal,
    pub freight_cost_per_unit: Decimal,
}

impl PurchaseLot {
    /// Total cost per unit including freight.
    pub fn effective_unit_cost(&self) -> Decimal {
        self.unit_price + self.freight_cost_per_unit
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_quantity <= 0
    }

    /// Units consumed so far, i.e. the capacity available to returns.
    pub fn consumed_quantity(&self) -> i64 {
        self.original_quantity - self.remaining_quantity
    }

    /// Check the structural invariants of a lot. Violations here are fatal
    /// for a run, never per-row validation findings.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.lot_id.is_empty() {
            return Err("lot_id is empty".to_string());
        }
        if self.sku.is_empty() {
            return Err(format!("lot {} has an empty sku", self.lot_id));
        }
        if self.original_quantity <= 0 {
            return Err(format!(
                "lot {} has non-positive original_quantity {}",
                self.lot_id, self.original_quantity
            ));
        }
        if self.remaining_quantity < 0 || self.remaining_quantity > self.original_quantity {
            return Err(format!(
                "lot {} has remaining_quantity {} outside 0..={}",
                self.lot_id, self.remaining_quantity, self.original_quantity
            ));
        }
        if self.unit_price.is_sign_negative() || self.freight_cost_per_unit.is_sign_negative() {
            return Err(format!("lot {} has a negative cost component", self.lot_id));
        }
        Ok(())
    }
}

/// A single sale transaction. A negative quantity is a return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub tenant_id: String,
    pub sale_id: String,
    pub sku: String,
    pub sale_date: NaiveDate,
    pub quantity: i64,
}

impl Sale {
    pub fn is_return(&self) -> bool {
        self.quantity < 0
    }

    /// The `YYYY-MM` period the sale falls into.
    pub fn period(&self) -> String {
        self.sale_date.format("%Y-%m").to_string()
    }
}

/// Kind of an inventory movement journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Sale,
    Return,
    Adjustment,
    Rollback,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sale => "sale",
            Self::Return => "return",
            Self::Adjustment => "adjustment",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for MovementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sale" => Ok(Self::Sale),
            "return" => Ok(Self::Return),
            "adjustment" => Ok(Self::Adjustment),
            "rollback" => Ok(Self::Rollback),
            _ => Err(format!("unknown movement kind: {s}")),
        }
    }
}

/// One append-only journal entry recording a single effect on a lot.
/// Negative quantity consumes inventory, positive restores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryMovement {
    pub movement_id: Uuid,
    pub tenant_id: String,
    pub run_id: Uuid,
    pub lot_id: String,
    pub sku: String,
    pub kind: MovementKind,
    pub quantity: i64,
    pub remaining_after: i64,
    pub unit_cost: Decimal,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Which side of a run a snapshot row captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    PreRun,
    PostRun,
}

impl SnapshotPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreRun => "pre_run",
            Self::PostRun => "post_run",
        }
    }
}

impl fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre_run" => Ok(Self::PreRun),
            "post_run" => Ok(Self::PostRun),
            _ => Err(format!("unknown snapshot phase: {s}")),
        }
    }
}

/// A per-run capture of one lot's state, identified by
/// `(tenant_id, run_id, lot_id, phase)`. Rows are immutable except for
/// `is_current`, the pointer marking the row that reflects the lot's latest
/// committed state: a run's commit points it at the post-run rows, a
/// rollback re-points it at the pre-run rows. Exactly one row per
/// `(tenant_id, lot_id)` is current at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub snapshot_id: Uuid,
    pub tenant_id: String,
    pub run_id: Uuid,
    pub lot_id: String,
    pub sku: String,
    pub remaining_quantity: i64,
    pub original_quantity: i64,
    pub unit_price: Decimal,
    pub freight_cost_per_unit: Decimal,
    pub received_date: NaiveDate,
    pub phase: SnapshotPhase,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

impl InventorySnapshot {
    pub fn from_lot(
        lot: &PurchaseLot,
        run_id: Uuid,
        phase: SnapshotPhase,
        is_current: bool,
    ) -> Self {
        Self {
            snapshot_id: Uuid::new_v4(),
            tenant_id: lot.tenant_id.clone(),
            run_id,
            lot_id: lot.lot_id.clone(),
            sku: lot.sku.clone(),
            remaining_quantity: lot.remaining_quantity,
            original_quantity: lot.original_quantity,
            unit_price: lot.unit_price,
            freight_cost_per_unit: lot.freight_cost_per_unit,
            received_date: lot.received_date,
            phase,
            is_current,
            created_at: Utc::now(),
        }
    }

    pub fn effective_unit_cost(&self) -> Decimal {
        self.unit_price + self.freight_cost_per_unit
    }
}

/// Line-item detail tying an attribution to one lot.
/// Invariant: `total_cost = quantity_allocated x unit_cost`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionDetail {
    pub detail_id: Uuid,
    pub attribution_id: Uuid,
    pub tenant_id: String,
    pub lot_id: String,
    pub quantity_allocated: i64,
    pub unit_cost: Decimal,
    pub total_cost: Decimal,
}

/// The decision record tying one sale to the lots that funded it.
/// Returns carry negative `quantity_sold` and `total_cogs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CogsAttribution {
    pub attribution_id: Uuid,
    pub tenant_id: String,
    pub run_id: Uuid,
    pub sale_id: String,
    pub sku: String,
    pub sale_date: NaiveDate,
    pub quantity_sold: i64,
    pub total_cogs: Decimal,
    pub average_unit_cost: Decimal,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
    pub details: Vec<AttributionDetail>,
}

/// Monthly COGS rollup by SKU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CogsSummary {
    pub summary_id: Uuid,
    pub tenant_id: String,
    pub run_id: Uuid,
    pub sku: String,
    pub period: String,
    pub total_quantity_sold: i64,
    pub total_cogs: Decimal,
    pub average_unit_cost: Decimal,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
}

/// Kind of a per-row validation finding. Findings are data, not errors:
/// a run completes even when it records them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    InsufficientInventory,
    OverReturn,
    UnknownSku,
    DateInversion,
    LotConflict,
}

impl ValidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientInventory => "insufficient_inventory",
            Self::OverReturn => "over_return",
            Self::UnknownSku => "unknown_sku",
            Self::DateInversion => "date_inversion",
            Self::LotConflict => "lot_conflict",
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insufficient_inventory" => Ok(Self::InsufficientInventory),
            "over_return" => Ok(Self::OverReturn),
            "unknown_sku" => Ok(Self::UnknownSku),
            "date_inversion" => Ok(Self::DateInversion),
            "lot_conflict" => Ok(Self::LotConflict),
            _ => Err(format!("unknown validation kind: {s}")),
        }
    }
}

/// A per-row validation finding persisted with its run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub record_id: Uuid,
    pub tenant_id: String,
    pub run_id: Uuid,
    pub kind: ValidationKind,
    pub sku: Option<String>,
    pub sale_id: Option<String>,
    pub quantity: Option<i64>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ValidationRecord {
    pub fn new(
        tenant_id: &str,
        run_id: Uuid,
        kind: ValidationKind,
        sku: Option<&str>,
        sale_id: Option<&str>,
        quantity: Option<i64>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            run_id,
            kind,
            sku: sku.map(str::to_string),
            sale_id: sale_id.map(str::to_string),
            quantity,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Per-SKU remaining quantity and value over current inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryValuation {
    pub sku: String,
    pub remaining_quantity: i64,
    pub remaining_value: Decimal,
}
