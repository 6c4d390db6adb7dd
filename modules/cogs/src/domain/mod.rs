pub mod models;
pub mod run;

pub use models::{
    AttributionDetail, CogsAttribution, CogsSummary, InventoryMovement, InventorySnapshot,
    InventoryValuation, MovementKind, PurchaseLot, Sale, SnapshotPhase, ValidationKind,
    ValidationRecord,
};
pub use run::{Page, RunCounters, RunFilter, RunMode, RunRecord, RunStatus};
