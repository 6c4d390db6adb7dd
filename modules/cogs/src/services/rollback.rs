//! Rollback engine.
//!
//! Losslessly reverses a completed run: lot quantities are restored from the
//! run's pre-run snapshot (the authoritative capture), one `rollback`
//! movement per touched lot negates that lot's net journal effect, derived
//! artifacts are invalidated, and the run moves `completed -> rolled_back`
//! in one atomic commit. Already-rolled-back runs succeed as a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    InventoryMovement, InventorySnapshot, MovementKind, RunRecord, RunStatus, SnapshotPhase,
};
use crate::store::{CogsStore, RollbackCommit, StoreError};
use crate::tenant::{TenantError, TenantId, TenantScope};

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("tenant {tenant_id} already has an active run or rollback")]
    ConcurrentOperation { tenant_id: String },

    #[error("run {run_id} not found for tenant {tenant_id}")]
    NotFound { tenant_id: String, run_id: Uuid },

    #[error("cannot roll back run {run_id} in status {actual}")]
    IllegalState { run_id: Uuid, actual: RunStatus },

    #[error(transparent)]
    Tenant(#[from] TenantError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

pub async fn rollback_run(
    store: Arc<dyn CogsStore>,
    tenant_id: &str,
    run_id: Uuid,
) -> Result<RunRecord, RollbackError> {
    let tenant = TenantId::new(tenant_id)?;
    let scope = TenantScope::new(store, tenant);

    let token = match scope.acquire_lock().await {
        Ok(token) => token,
        Err(StoreError::LockHeld { tenant_id }) => {
            return Err(RollbackError::ConcurrentOperation { tenant_id });
        }
        Err(other) => return Err(other.into()),
    };

    let result = rollback_locked(&scope, run_id).await;

    if let Err(release_err) = scope.release_lock(&token).await {
        tracing::warn!(
            tenant_id = %scope.tenant_id(),
            error = %release_err,
            "failed to release tenant lock"
        );
    }
    result
}

async fn rollback_locked(scope: &TenantScope, run_id: Uuid) -> Result<RunRecord, RollbackError> {
    // A run belonging to another tenant is indistinguishable from a missing
    // one: the scoped read returns nothing.
    let run = scope
        .get_run(run_id)
        .await?
        .ok_or_else(|| RollbackError::NotFound {
            tenant_id: scope.tenant_id().to_string(),
            run_id,
        })?;

    match run.status {
        RunStatus::RolledBack => {
            tracing::info!(
                tenant_id = %scope.tenant_id(),
                run_id = %run_id,
                "run already rolled back"
            );
            return Ok(run);
        }
        RunStatus::Completed => {}
        actual => return Err(RollbackError::IllegalState { run_id, actual }),
    }

    let pre = scope.read_snapshot(run_id, SnapshotPhase::PreRun).await?;
    let movements = scope.read_movements(run_id).await?;

    // Net journal effect per lot; only touched lots need restoring.
    let mut net: HashMap<&str, i64> = HashMap::new();
    for movement in &movements {
        *net.entry(movement.lot_id.as_str()).or_insert(0) += movement.quantity;
    }

    let pre_by_lot: HashMap<&str, &InventorySnapshot> =
        pre.iter().map(|s| (s.lot_id.as_str(), s)).collect();

    // One inverse movement per lot, in reverse order of original emission so
    // the journal reads back symmetrically.
    let mut rollback_movements = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for movement in movements.iter().rev() {
        if !seen.insert(movement.lot_id.as_str()) {
            continue;
        }
        let delta = net.get(movement.lot_id.as_str()).copied().unwrap_or(0);
        if delta == 0 {
            continue;
        }
        let Some(snapshot) = pre_by_lot.get(movement.lot_id.as_str()) else {
            tracing::warn!(
                tenant_id = %scope.tenant_id(),
                run_id = %run_id,
                lot_id = %movement.lot_id,
                "movement references a lot missing from the pre-run snapshot"
            );
            continue;
        };
        rollback_movements.push(InventoryMovement {
            movement_id: Uuid::new_v4(),
            tenant_id: scope.tenant_id().to_string(),
            run_id,
            lot_id: snapshot.lot_id.clone(),
            sku: snapshot.sku.clone(),
            kind: MovementKind::Rollback,
            quantity: -delta,
            remaining_after: snapshot.remaining_quantity,
            unit_cost: snapshot.effective_unit_cost(),
            reference_id: Some(run_id.to_string()),
            created_at: Utc::now(),
        });
    }

    let restored: Vec<(String, i64)> = pre
        .iter()
        .filter(|s| net.get(s.lot_id.as_str()).copied().unwrap_or(0) != 0)
        .map(|s| (s.lot_id.clone(), s.remaining_quantity))
        .collect();

    let restored_count = restored.len();
    let commit = RollbackCommit {
        restored,
        movements: rollback_movements,
        rolled_back_at: Utc::now(),
    };
    let run = scope.commit_rollback(run_id, commit).await?;

    tracing::info!(
        tenant_id = %scope.tenant_id(),
        run_id = %run_id,
        restored_lots = restored_count,
        "run rolled back"
    );
    Ok(run)
}
