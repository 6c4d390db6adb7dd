//! Persistence contract for the COGS engine.
//!
//! Every operation is tenant-scoped and implementations reject cross-tenant
//! references. The composite `commit_run` / `commit_rollback` operations are
//! the engine's units of atomicity: a run is observable as `completed` (or
//! `rolled_back`) if and only if the whole composite applied.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    CogsAttribution, CogsSummary, InventoryMovement, InventorySnapshot, PurchaseLot, RunCounters,
    RunFilter, RunRecord, RunStatus, SnapshotPhase, ValidationRecord,
};
use crate::tenant::TenantError;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// How long a tenant lock lease lasts before it can be reclaimed.
pub const LOCK_LEASE_SECONDS: i64 = 300;

/// Proof of holding a tenant's advisory lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub tenant_id: String,
    pub token: Uuid,
}

/// Fields applied by a CAS status transition.
#[derive(Debug, Clone, Default)]
pub struct RunTransition {
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Everything the coordinator persists when a run commits. Applied
/// atomically, ending with the `running -> completed` transition.
#[derive(Debug, Clone)]
pub struct RunCommit {
    /// Full post-allocation state of every lot the run saw (new lots
    /// included); the store upserts attributes and remaining quantities.
    pub lots: Vec<PurchaseLot>,
    pub movements: Vec<InventoryMovement>,
    pub attributions: Vec<CogsAttribution>,
    pub summaries: Vec<CogsSummary>,
    pub validation_records: Vec<ValidationRecord>,
    pub counters: RunCounters,
    pub completed_at: DateTime<Utc>,
}

/// Everything the rollback engine persists when a rollback finalizes.
/// Applied atomically, ending with the `completed -> rolled_back` transition.
#[derive(Debug, Clone)]
pub struct RollbackCommit {
    /// `(lot_id, restored remaining_quantity)` from the pre-run snapshot.
    pub restored: Vec<(String, i64)>,
    pub movements: Vec<InventoryMovement>,
    pub rolled_back_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tenant {tenant_id} lock is already held")]
    LockHeld { tenant_id: String },

    #[error("stale or unknown lock token for tenant {tenant_id}")]
    StaleLock { tenant_id: String },

    #[error("run {run_id} not found for tenant {tenant_id}")]
    RunNotFound { tenant_id: String, run_id: Uuid },

    #[error("run {run_id} already exists")]
    RunExists { run_id: Uuid },

    #[error("run {run_id} is {actual}, expected {expected}")]
    StateConflict {
        run_id: Uuid,
        expected: RunStatus,
        actual: RunStatus,
    },

    #[error(transparent)]
    Tenant(#[from] TenantError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Storage operations the run coordinator and rollback engine require.
#[async_trait]
pub trait CogsStore: Send + Sync {
    /// Acquire the tenant's advisory lock, reclaiming an expired lease.
    /// Fails with [`StoreError::LockHeld`] without blocking.
    async fn acquire_tenant_lock(&self, tenant_id: &str) -> Result<LockToken, StoreError>;

    /// Release a previously acquired lock. Releasing a lease that already
    /// expired and was reclaimed fails with [`StoreError::StaleLock`].
    async fn release_tenant_lock(&self, token: &LockToken) -> Result<(), StoreError>;

    /// Lots with their current remaining quantities, optionally filtered to
    /// the given SKUs. Canonical order: `(sku, received_date, lot_id)`.
    async fn load_current_inventory(
        &self,
        tenant_id: &str,
        skus: Option<&[String]>,
    ) -> Result<Vec<PurchaseLot>, StoreError>;

    /// Create or update lot rows.
    async fn upsert_lots(&self, tenant_id: &str, lots: &[PurchaseLot]) -> Result<(), StoreError>;

    /// Bulk-set remaining quantities on existing lots.
    async fn update_lot_remaining(
        &self,
        tenant_id: &str,
        updates: &[(String, i64)],
    ) -> Result<(), StoreError>;

    /// Write one snapshot row per lot. Writing post-run rows atomically
    /// re-points the per-lot `is_current` flag at them.
    async fn write_snapshot(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        lots: &[PurchaseLot],
        phase: SnapshotPhase,
    ) -> Result<(), StoreError>;

    async fn read_snapshot(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        phase: SnapshotPhase,
    ) -> Result<Vec<InventorySnapshot>, StoreError>;

    async fn append_movements(
        &self,
        tenant_id: &str,
        movements: &[InventoryMovement],
    ) -> Result<(), StoreError>;

    /// Movements of a run in emission order.
    async fn read_movements(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<InventoryMovement>, StoreError>;

    async fn write_attributions(
        &self,
        tenant_id: &str,
        attributions: &[CogsAttribution],
    ) -> Result<(), StoreError>;

    async fn read_attributions(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CogsAttribution>, StoreError>;

    async fn write_summaries(
        &self,
        tenant_id: &str,
        summaries: &[CogsSummary],
    ) -> Result<(), StoreError>;

    async fn read_summaries(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<CogsSummary>, StoreError>;

    async fn write_validation_records(
        &self,
        tenant_id: &str,
        records: &[ValidationRecord],
    ) -> Result<(), StoreError>;

    async fn read_validation_records(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<ValidationRecord>, StoreError>;

    async fn create_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    /// Compare-and-set status transition. Fails with
    /// [`StoreError::StateConflict`] when the run is not in `from`.
    async fn transition_run(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
        fields: RunTransition,
    ) -> Result<RunRecord, StoreError>;

    async fn get_run(&self, tenant_id: &str, run_id: Uuid)
        -> Result<Option<RunRecord>, StoreError>;

    async fn list_runs(
        &self,
        tenant_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<RunRecord>, StoreError>;

    /// Flag a run's attributions and summaries `is_valid = false`.
    async fn invalidate_derived(&self, tenant_id: &str, run_id: Uuid) -> Result<(), StoreError>;

    /// Apply a run's side effects and the `running -> completed` transition
    /// as one atomic unit. Must be atomic: either every write is visible and
    /// the run is `completed`, or none are and the run is untouched.
    async fn commit_run(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        commit: RunCommit,
    ) -> Result<RunRecord, StoreError>;

    /// Apply a rollback's restoration and the `completed -> rolled_back`
    /// transition as one atomic unit: lot restore, rollback movements,
    /// current-snapshot re-point, derived invalidation, status CAS.
    async fn commit_rollback(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        commit: RollbackCommit,
    ) -> Result<RunRecord, StoreError>;
}
