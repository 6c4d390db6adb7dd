//! Journaled run coordinator.
//!
//! Drives a single COGS run from request to a terminal status under the
//! tenant's advisory lock. A run is observable as `completed` if and only if
//! the whole commit applied; any failure after the run record exists marks
//! it `failed` with the error message captured. Snapshot and movement rows
//! written before the failure stay behind for forensic audit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{EngineConfig, LotMergePolicy};
use crate::domain::{
    PurchaseLot, RunCounters, RunMode, RunRecord, RunStatus, Sale, SnapshotPhase, ValidationKind,
    ValidationRecord,
};
use crate::services::allocator::{allocate, AllocationError};
use crate::store::{CogsStore, RunCommit, RunTransition, StoreError};
use crate::tenant::{TenantError, TenantId, TenantScope};
use crate::validation::{format_violations, validate_run_request, InputViolation};

/// One request to execute a COGS run. `run_id` may be client-supplied for
/// idempotent retries; when absent a fresh id is generated.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub tenant_id: String,
    pub mode: String,
    pub sales: Vec<Sale>,
    pub lots_upsert: Vec<PurchaseLot>,
    pub run_id: Option<Uuid>,
    pub created_by: Option<String>,
    pub input_file_id: Option<Uuid>,
}

impl RunRequest {
    pub fn new(tenant_id: impl Into<String>, sales: Vec<Sale>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            mode: "fifo".to_string(),
            sales,
            lots_upsert: Vec::new(),
            run_id: None,
            created_by: None,
            input_file_id: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("input validation failed: {}", format_violations(.0))]
    Validation(Vec<InputViolation>),

    #[error("tenant {tenant_id} already has an active run or rollback")]
    ConcurrentRunInProgress { tenant_id: String },

    #[error("run {run_id} not found for tenant {tenant_id}")]
    NotFound { tenant_id: String, run_id: Uuid },

    #[error("run {run_id} is {actual}: {detail}")]
    IllegalState {
        run_id: Uuid,
        actual: RunStatus,
        detail: String,
    },

    #[error(transparent)]
    Tenant(#[from] TenantError),

    #[error("allocation aborted: {0}")]
    Allocation(#[from] AllocationError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Execute a run end to end: validate, lock, record, merge lots, snapshot,
/// allocate, commit atomically, release the lock on every exit path.
pub async fn execute_run(
    store: Arc<dyn CogsStore>,
    config: &EngineConfig,
    request: RunRequest,
) -> Result<RunRecord, RunError> {
    let tenant = TenantId::new(request.tenant_id.clone())?;

    let mode = request.mode.parse::<RunMode>();
    let mut violations = validate_run_request(&tenant, &request.sales, &request.lots_upsert);
    if let Err(detail) = &mode {
        violations.push(InputViolation {
            reference: "mode".to_string(),
            message: detail.clone(),
        });
    }
    if !violations.is_empty() {
        return Err(RunError::Validation(violations));
    }
    let mode = mode.unwrap_or(RunMode::Fifo);

    // Normalize: stamp the validated tenant onto every entity.
    let sales: Vec<Sale> = request
        .sales
        .iter()
        .cloned()
        .map(|mut sale| {
            sale.tenant_id = tenant.as_str().to_string();
            sale
        })
        .collect();
    let lots_upsert: Vec<PurchaseLot> = request
        .lots_upsert
        .iter()
        .cloned()
        .map(|mut lot| {
            lot.tenant_id = tenant.as_str().to_string();
            lot
        })
        .collect();

    let scope = TenantScope::new(store, tenant);
    let token = match scope.acquire_lock().await {
        Ok(token) => token,
        Err(StoreError::LockHeld { tenant_id }) => {
            return Err(RunError::ConcurrentRunInProgress { tenant_id });
        }
        Err(other) => return Err(other.into()),
    };

    let result = execute_locked(&scope, config, mode, &request, sales, lots_upsert).await;

    if let Err(release_err) = scope.release_lock(&token).await {
        tracing::warn!(
            tenant_id = %scope.tenant_id(),
            error = %release_err,
            "failed to release tenant lock"
        );
    }
    result
}

async fn execute_locked(
    scope: &TenantScope,
    config: &EngineConfig,
    mode: RunMode,
    request: &RunRequest,
    sales: Vec<Sale>,
    lots_upsert: Vec<PurchaseLot>,
) -> Result<RunRecord, RunError> {
    // Client-supplied run ids make retries idempotent: a completed run is
    // replayed as success, an active one is a concurrency conflict.
    if let Some(run_id) = request.run_id {
        if let Some(existing) = scope.get_run(run_id).await? {
            return match existing.status {
                RunStatus::Completed => {
                    tracing::info!(
                        tenant_id = %scope.tenant_id(),
                        run_id = %run_id,
                        "run already completed, replaying result"
                    );
                    Ok(existing)
                }
                status if status.is_active() => Err(RunError::ConcurrentRunInProgress {
                    tenant_id: scope.tenant_id().to_string(),
                }),
                status => Err(RunError::IllegalState {
                    run_id,
                    actual: status,
                    detail: "run ids are single-use".to_string(),
                }),
            };
        }
    }

    let run_id = request.run_id.unwrap_or_else(Uuid::new_v4);
    let run = RunRecord::new(
        run_id,
        scope.tenant_id(),
        mode,
        request.created_by.clone(),
        request.input_file_id,
    );
    scope.create_run(&run).await?;
    scope
        .transition_run(
            run_id,
            RunStatus::Pending,
            RunStatus::Running,
            RunTransition::default(),
        )
        .await?;
    tracing::info!(
        tenant_id = %scope.tenant_id(),
        run_id = %run_id,
        mode = %mode,
        sales = sales.len(),
        lots_upserted = lots_upsert.len(),
        "run started"
    );

    match run_allocation(scope, config, run_id, &sales, &lots_upsert).await {
        Ok(record) => {
            tracing::info!(
                tenant_id = %scope.tenant_id(),
                run_id = %run_id,
                total_cogs = %record.total_cogs,
                validation_errors = record.validation_errors_count,
                "run completed"
            );
            Ok(record)
        }
        Err(err) => {
            let fields = RunTransition {
                completed_at: Some(Utc::now()),
                error_message: Some(err.to_string()),
            };
            if let Err(mark_err) = scope
                .transition_run(run_id, RunStatus::Running, RunStatus::Failed, fields)
                .await
            {
                tracing::error!(
                    tenant_id = %scope.tenant_id(),
                    run_id = %run_id,
                    error = %mark_err,
                    "failed to mark run as failed"
                );
            }
            tracing::error!(
                tenant_id = %scope.tenant_id(),
                run_id = %run_id,
                error = %err,
                "run failed"
            );
            Err(err)
        }
    }
}

async fn run_allocation(
    scope: &TenantScope,
    config: &EngineConfig,
    run_id: Uuid,
    sales: &[Sale],
    lots_upsert: &[PurchaseLot],
) -> Result<RunRecord, RunError> {
    let current = scope.load_current_inventory(None).await?;
    let (merged, mut validation_records) = merge_lots(
        scope.tenant_id(),
        run_id,
        current,
        lots_upsert,
        config.lot_merge_policy,
    );

    // Pre-run capture of every lot: the authoritative restore point.
    scope
        .write_snapshot(run_id, &merged, SnapshotPhase::PreRun)
        .await?;

    let outcome = allocate(
        scope.tenant_id(),
        run_id,
        &merged,
        sales,
        config.require_date_guard,
    )?;
    validation_records.extend(outcome.validation_records);

    let counters = RunCounters {
        total_sales_processed: sales.len() as i64,
        total_cogs: outcome.total_cogs,
        validation_errors_count: validation_records.len() as i64,
    };
    let commit = RunCommit {
        lots: outcome.lots,
        movements: outcome.movements,
        attributions: outcome.attributions,
        summaries: outcome.summaries,
        validation_records,
        counters,
        completed_at: Utc::now(),
    };
    Ok(scope.commit_run(run_id, commit).await?)
}

/// Merge incoming lots into current inventory under the configured policy.
/// Conflicting entries are skipped and recorded as `lot_conflict` findings.
fn merge_lots(
    tenant_id: &str,
    run_id: Uuid,
    current: Vec<PurchaseLot>,
    upserts: &[PurchaseLot],
    policy: LotMergePolicy,
) -> (Vec<PurchaseLot>, Vec<ValidationRecord>) {
    let mut merged = current;
    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(idx, lot)| (lot.lot_id.clone(), idx))
        .collect();
    let mut conflicts = Vec::new();

    let mut conflict = |lot: &PurchaseLot, message: String| {
        conflicts.push(ValidationRecord::new(
            tenant_id,
            run_id,
            ValidationKind::LotConflict,
            Some(&lot.sku),
            None,
            Some(lot.remaining_quantity),
            message,
        ));
    };

    for upsert in upserts {
        let Some(&idx) = index.get(&upsert.lot_id) else {
            index.insert(upsert.lot_id.clone(), merged.len());
            merged.push(upsert.clone());
            continue;
        };
        let existing = &merged[idx];

        if policy == LotMergePolicy::Reject {
            conflict(
                upsert,
                format!("lot {} already exists and merging is disabled", upsert.lot_id),
            );
            continue;
        }
        if upsert.sku != existing.sku {
            conflict(
                upsert,
                format!(
                    "lot {} sku mismatch: existing {}, incoming {}",
                    upsert.lot_id, existing.sku, upsert.sku
                ),
            );
            continue;
        }

        let delta = upsert.original_quantity - existing.original_quantity;
        if delta < 0 {
            conflict(
                upsert,
                format!(
                    "lot {} original_quantity may not shrink ({} -> {})",
                    upsert.lot_id, existing.original_quantity, upsert.original_quantity
                ),
            );
            continue;
        }

        // Remaining grows only by the original-quantity delta. The caller may
        // echo a full lot (remaining == original) or the computed value;
        // anything else is an attempt to set remaining directly.
        let computed_remaining = existing.remaining_quantity + delta;
        if upsert.remaining_quantity != computed_remaining
            && upsert.remaining_quantity != upsert.original_quantity
        {
            conflict(
                upsert,
                format!(
                    "lot {} remaining_quantity cannot be set directly (expected {})",
                    upsert.lot_id, computed_remaining
                ),
            );
            continue;
        }

        let existing = &mut merged[idx];
        existing.received_date = upsert.received_date;
        existing.original_quantity = upsert.original_quantity;
        existing.remaining_quantity = computed_remaining;
        existing.unit_price = upsert.unit_price;
        existing.freight_cost_per_unit = upsert.freight_cost_per_unit;
    }

    (merged, conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn lot(id: &str, original: i64, remaining: i64) -> PurchaseLot {
        PurchaseLot {
            tenant_id: "t1".to_string(),
            lot_id: id.to_string(),
            sku: "A".to_string(),
            received_date: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            original_quantity: original,
            remaining_quantity: remaining,
            unit_price: dec!(10.00),
            freight_cost_per_unit: dec!(0.00),
        }
    }

    #[test]
    fn test_merge_accepts_new_lots() {
        let (merged, conflicts) = merge_lots(
            "t1",
            Uuid::new_v4(),
            vec![],
            &[lot("L1", 100, 100)],
            LotMergePolicy::UpsertIncreaseOnly,
        );
        assert_eq!(merged.len(), 1);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_merge_grows_remaining_by_original_delta() {
        let (merged, conflicts) = merge_lots(
            "t1",
            Uuid::new_v4(),
            vec![lot("L1", 100, 40)],
            &[lot("L1", 150, 150)],
            LotMergePolicy::UpsertIncreaseOnly,
        );
        assert!(conflicts.is_empty());
        assert_eq!(merged[0].original_quantity, 150);
        // 40 remaining + 50 new units; consumption is preserved.
        assert_eq!(merged[0].remaining_quantity, 90);
    }

    #[test]
    fn test_merge_rejects_shrinking_original() {
        let (merged, conflicts) = merge_lots(
            "t1",
            Uuid::new_v4(),
            vec![lot("L1", 100, 40)],
            &[lot("L1", 80, 80)],
            LotMergePolicy::UpsertIncreaseOnly,
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ValidationKind::LotConflict);
        assert_eq!(merged[0].original_quantity, 100);
        assert_eq!(merged[0].remaining_quantity, 40);
    }

    #[test]
    fn test_merge_rejects_direct_remaining_overwrite() {
        let (merged, conflicts) = merge_lots(
            "t1",
            Uuid::new_v4(),
            vec![lot("L1", 100, 40)],
            &[lot("L1", 100, 77)],
            LotMergePolicy::UpsertIncreaseOnly,
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(merged[0].remaining_quantity, 40);
    }

    #[test]
    fn test_reject_policy_refuses_collisions() {
        let (merged, conflicts) = merge_lots(
            "t1",
            Uuid::new_v4(),
            vec![lot("L1", 100, 40)],
            &[lot("L1", 150, 150), lot("L2", 10, 10)],
            LotMergePolicy::Reject,
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].remaining_quantity, 40);
        assert_eq!(merged[1].lot_id, "L2");
    }
}
