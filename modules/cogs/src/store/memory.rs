//! In-memory implementation of the persistence contract.
//!
//! The fake-for-tests variant: every table is a mutex-guarded collection and
//! the composite commits apply under a single guard, which makes them atomic
//! with respect to every other operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    CogsAttribution, CogsSummary, InventoryMovement, InventorySnapshot, PurchaseLot, RunFilter,
    RunRecord, RunStatus, SnapshotPhase, ValidationRecord,
};

use super::{
    CogsStore, LockToken, RollbackCommit, RunCommit, RunTransition, StoreError,
    LOCK_LEASE_SECONDS,
};

#[derive(Debug, Clone)]
struct Lease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    /// Keyed by `(tenant_id, lot_id)`; BTreeMap keeps iteration stable.
    lots: BTreeMap<(String, String), PurchaseLot>,
    runs: HashMap<Uuid, RunRecord>,
    movements: Vec<InventoryMovement>,
    snapshots: Vec<InventorySnapshot>,
    attributions: Vec<CogsAttribution>,
    summaries: Vec<CogsSummary>,
    validation_records: Vec<ValidationRecord>,
    locks: HashMap<String, Lease>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }
}

impl Inner {
    fn run_for(&self, tenant_id: &str, run_id: Uuid) -> Option<&RunRecord> {
        self.runs
            .get(&run_id)
            .filter(|run| run.tenant_id == tenant_id)
    }

    /// CAS precondition check shared by transitions and commits.
    fn expect_status(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        expected: RunStatus,
    ) -> Result<(), StoreError> {
        let run = self
            .run_for(tenant_id, run_id)
            .ok_or_else(|| StoreError::RunNotFound {
                tenant_id: tenant_id.to_string(),
                run_id,
            })?;
        if run.status != expected {
            return Err(StoreError::StateConflict {
                run_id,
                expected,
                actual: run.status,
            });
        }
        Ok(())
    }

    fn apply_upserts(&mut self, tenant_id: &str, lots: &[PurchaseLot]) {
        for lot in lots {
            self.lots
                .insert((tenant_id.to_string(), lot.lot_id.clone()), lot.clone());
        }
    }

    fn apply_remaining(&mut self, tenant_id: &str, updates: &[(String, i64)]) {
        for (lot_id, remaining) in updates {
            if let Some(lot) = self
                .lots
                .get_mut(&(tenant_id.to_string(), lot_id.clone()))
            {
                lot.remaining_quantity = *remaining;
            }
        }
    }

    fn clear_current(&mut self, tenant_id: &str, lot_ids: &[String]) {
        for row in self
            .snapshots
            .iter_mut()
            .filter(|s| s.tenant_id == tenant_id && lot_ids.contains(&s.lot_id))
        {
            row.is_current = false;
        }
    }

    /// Write post-run rows and point the per-lot current flag at them.
    fn write_post_run(&mut self, tenant_id: &str, lots: &[PurchaseLot], run_id: Uuid) {
        let lot_ids: Vec<String> = lots.iter().map(|l| l.lot_id.clone()).collect();
        self.clear_current(tenant_id, &lot_ids);
        for lot in lots {
            self.snapshots.push(InventorySnapshot::from_lot(
                lot,
                run_id,
                SnapshotPhase::PostRun,
                true,
            ));
        }
    }

    fn invalidate(&mut self, tenant_id: &str, run_id: Uuid) {
        for attribution in self
            .attributions
            .iter_mut()
            .filter(|a| a.tenant_id == tenant_id && a.run_id == run_id)
        {
            attribution.is_valid = false;
        }
        for summary in self
            .summaries
            .iter_mut()
            .filter(|s| s.tenant_id == tenant_id && s.run_id == run_id)
        {
            summary.is_valid = false;
        }
    }
}

#[async_trait]
impl CogsStore for MemoryStore {
    async fn acquire_tenant_lock(&self, tenant_id: &str) -> Result<LockToken, StoreError> {
        let mut inner = self.guard();
        let now = Utc::now();
        if let Some(lease) = inner.locks.get(tenant_id) {
            if lease.expires_at > now {
                return Err(StoreError::LockHeld {
                    tenant_id: tenant_id.to_string(),
                });
            }
        }
        let token = Uuid::new_v4();
        inner.locks.insert(
            tenant_id.to_string(),
            Lease {
                token,
                expires_at: now + chrono::Duration::seconds(LOCK_LEASE_SECONDS),
            },
        );
        Ok(LockToken {
            tenant_id: tenant_id.to_string(),
            token,
        })
    }

    async fn release_tenant_lock(&self, token: &LockToken) -> Result<(), StoreError> {
        let mut inner = self.guard();
        match inner.locks.get(&token.tenant_id) {
            Some(lease) if lease.token == token.token => {
                inner.locks.remove(&token.tenant_id);
                Ok(())
            }
            _ => Err(StoreError::StaleLock {
                tenant_id: token.tenant_id.clone(),
            }),
        }
    }

    async fn load_current_inventory(
        &self,
        tenant_id: &str,
        skus: Option<&[String]>,
    ) -> Result<Vec<PurchaseLot>, StoreError> {
        let inner = self.guard();
        let mut lots: Vec<PurchaseLot> = inner
            .lots
            .values()
            .filter(|lot| lot.tenant_id == tenant_id)
            .filter(|lot| skus.map_or(true, |s| s.contains(&lot.sku)))
            .cloned()
            .collect();
        lots.sort_by(|a, b| {
            a.sku
                .cmp(&b.sku)
                .then_with(|| a.received_date.cmp(&b.received_date))
                .then_with(|| a.lot_id.cmp(&b.lot_id))
        });
        Ok(lots)
    }

    async fn upsert_lots(&self, tenant_id: &str, lots: &[PurchaseLot]) -> Result<(), StoreError> {
        self.guard().apply_upserts(tenant_id, lots);
        Ok(())
    }

    async fn update_lot_remaining(
        &self,
        tenant_id: &str,
        updates: &[(String, i64)],
    ) -> Result<(), StoreError> {
        self.guard().apply_remaining(tenant_id, updates);
        Ok(())
    }

    async fn write_snapshot(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        lots: &[PurchaseLot],
        phase: SnapshotPhase,
    ) -> Result<(), StoreError> {
        let mut inner = self.guard();
        match phase {
            SnapshotPhase::PostRun => inner.write_post_run(tenant_id, lots, run_id),
            SnapshotPhase::PreRun => {
                for lot in lots {
                    inner.snapshots.push(InventorySnapshot::from_lot(
                        lot,
                        run_id,
                        SnapshotPhase::PreRun,
                        false,
                    ));
                }
            }
        }
        Ok(())
    }

    async fn read_snapshot(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        phase: SnapshotPhase,
    ) -> Result<Vec<InventorySnapshot>, StoreError> {
        let inner = self.guard();
        Ok(inner
            .snapshots
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.run_id == run_id && s.phase == phase)
            .cloned()
            .collect())
    }

    async fn append_movements(
        &self,
        tenant_id: &str,
        movements: &[InventoryMovement],
    ) -> Result<(), StoreError> {
        let mut inner = self.guard();
        inner
            .movements
            .extend(movements.iter().filter(|m| m.tenant_id == tenant_id).cloned());
        Ok(())
    }

    async fn read_movements(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<InventoryMovement>, StoreError> {
        let inner = self.guard();
        Ok(inner
            .movements
            .iter()
            .filter(|m| m.tenant_id == tenant_id && m.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn write_attributions(
        &self,
        tenant_id: &str,
        attributions: &[CogsAttribution],
    ) -> Result<(), StoreError> {
        let mut inner = self.guard();
        inner
            .attributions
            .extend(attributions.iter().filter(|a| a.tenant_id == tenant_id).cloned());
        Ok(())
    }

    async fn read_attributions(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CogsAttribution>, StoreError> {
        let inner = self.guard();
        Ok(inner
            .attributions
            .iter()
            .filter(|a| a.tenant_id == tenant_id && a.run_id == run_id)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn write_summaries(
        &self,
        tenant_id: &str,
        summaries: &[CogsSummary],
    ) -> Result<(), StoreError> {
        let mut inner = self.guard();
        inner
            .summaries
            .extend(summaries.iter().filter(|s| s.tenant_id == tenant_id).cloned());
        Ok(())
    }

    async fn read_summaries(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<CogsSummary>, StoreError> {
        let inner = self.guard();
        Ok(inner
            .summaries
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn write_validation_records(
        &self,
        tenant_id: &str,
        records: &[ValidationRecord],
    ) -> Result<(), StoreError> {
        let mut inner = self.guard();
        inner
            .validation_records
            .extend(records.iter().filter(|r| r.tenant_id == tenant_id).cloned());
        Ok(())
    }

    async fn read_validation_records(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<ValidationRecord>, StoreError> {
        let inner = self.guard();
        Ok(inner
            .validation_records
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn create_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut inner = self.guard();
        if inner.runs.contains_key(&run.run_id) {
            return Err(StoreError::RunExists { run_id: run.run_id });
        }
        inner.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn transition_run(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
        fields: RunTransition,
    ) -> Result<RunRecord, StoreError> {
        let mut inner = self.guard();
        inner.expect_status(tenant_id, run_id, from)?;
        let run = inner.runs.get_mut(&run_id).expect("checked above");
        run.status = to;
        if let Some(completed_at) = fields.completed_at {
            run.completed_at = Some(completed_at);
        }
        if let Some(message) = fields.error_message {
            run.error_message = Some(message);
        }
        Ok(run.clone())
    }

    async fn get_run(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.guard().run_for(tenant_id, run_id).cloned())
    }

    async fn list_runs(
        &self,
        tenant_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let inner = self.guard();
        let mut runs: Vec<RunRecord> = inner
            .runs
            .values()
            .filter(|run| run.tenant_id == tenant_id)
            .filter(|run| filter.status.map_or(true, |s| run.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            runs.truncate(limit.max(0) as usize);
        }
        Ok(runs)
    }

    async fn invalidate_derived(&self, tenant_id: &str, run_id: Uuid) -> Result<(), StoreError> {
        self.guard().invalidate(tenant_id, run_id);
        Ok(())
    }

    async fn commit_run(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        commit: RunCommit,
    ) -> Result<RunRecord, StoreError> {
        let mut inner = self.guard();
        // Check the CAS precondition before any write so a conflict leaves
        // the store untouched.
        inner.expect_status(tenant_id, run_id, RunStatus::Running)?;

        inner.apply_upserts(tenant_id, &commit.lots);
        inner.write_post_run(tenant_id, &commit.lots, run_id);
        inner.movements.extend(commit.movements);
        inner.attributions.extend(commit.attributions);
        inner.summaries.extend(commit.summaries);
        inner.validation_records.extend(commit.validation_records);

        let run = inner.runs.get_mut(&run_id).expect("checked above");
        run.status = RunStatus::Completed;
        run.completed_at = Some(commit.completed_at);
        run.total_sales_processed = commit.counters.total_sales_processed;
        run.total_cogs = commit.counters.total_cogs;
        run.validation_errors_count = commit.counters.validation_errors_count;
        Ok(run.clone())
    }

    async fn commit_rollback(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        commit: RollbackCommit,
    ) -> Result<RunRecord, StoreError> {
        let mut inner = self.guard();
        inner.expect_status(tenant_id, run_id, RunStatus::Completed)?;

        inner.apply_remaining(tenant_id, &commit.restored);
        inner.movements.extend(commit.movements);

        // Re-point the current snapshot flag at the run's pre-run rows.
        let pre_lot_ids: Vec<String> = inner
            .snapshots
            .iter()
            .filter(|s| {
                s.tenant_id == tenant_id
                    && s.run_id == run_id
                    && s.phase == SnapshotPhase::PreRun
            })
            .map(|s| s.lot_id.clone())
            .collect();
        inner.clear_current(tenant_id, &pre_lot_ids);
        for row in inner.snapshots.iter_mut().filter(|s| {
            s.tenant_id == tenant_id && s.run_id == run_id && s.phase == SnapshotPhase::PreRun
        }) {
            row.is_current = true;
        }
        inner.invalidate(tenant_id, run_id);

        let run = inner.runs.get_mut(&run_id).expect("checked above");
        run.status = RunStatus::RolledBack;
        run.rolled_back_at = Some(commit.rolled_back_at);
        Ok(run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunMode, RunRecord};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn lot(tenant: &str, id: &str, remaining: i64) -> PurchaseLot {
        PurchaseLot {
            tenant_id: tenant.to_string(),
            lot_id: id.to_string(),
            sku: "A".to_string(),
            received_date: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            original_quantity: 100,
            remaining_quantity: remaining,
            unit_price: dec!(10.00),
            freight_cost_per_unit: dec!(1.00),
        }
    }

    #[tokio::test]
    async fn test_lock_excludes_second_acquire() {
        let store = MemoryStore::new();
        let token = store.acquire_tenant_lock("t1").await.unwrap();

        assert!(matches!(
            store.acquire_tenant_lock("t1").await,
            Err(StoreError::LockHeld { .. })
        ));
        // Other tenants are unaffected.
        store.acquire_tenant_lock("t2").await.unwrap();

        store.release_tenant_lock(&token).await.unwrap();
        store.acquire_tenant_lock("t1").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let store = MemoryStore::new();
        let token = store.acquire_tenant_lock("t1").await.unwrap();
        store
            .guard()
            .locks
            .get_mut("t1")
            .unwrap()
            .expires_at = Utc::now() - chrono::Duration::seconds(1);

        // A new acquire reclaims the lease; the old token is now stale.
        store.acquire_tenant_lock("t1").await.unwrap();
        assert!(matches!(
            store.release_tenant_lock(&token).await,
            Err(StoreError::StaleLock { .. })
        ));
    }

    #[tokio::test]
    async fn test_transition_run_is_compare_and_set() {
        let store = MemoryStore::new();
        let run = RunRecord::new(Uuid::new_v4(), "t1", RunMode::Fifo, None, None);
        store.create_run(&run).await.unwrap();

        let err = store
            .transition_run(
                "t1",
                run.run_id,
                RunStatus::Running,
                RunStatus::Completed,
                RunTransition::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StateConflict { actual, .. } if actual == RunStatus::Pending));

        store
            .transition_run(
                "t1",
                run.run_id,
                RunStatus::Pending,
                RunStatus::Running,
                RunTransition::default(),
            )
            .await
            .unwrap();
        let stored = store.get_run("t1", run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_duplicate_run_rejected() {
        let store = MemoryStore::new();
        let run = RunRecord::new(Uuid::new_v4(), "t1", RunMode::Fifo, None, None);
        store.create_run(&run).await.unwrap();
        assert!(matches!(
            store.create_run(&run).await,
            Err(StoreError::RunExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_post_run_snapshot_moves_current_pointer() {
        let store = MemoryStore::new();
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        store
            .write_snapshot("t1", run_a, &[lot("t1", "L1", 100)], SnapshotPhase::PostRun)
            .await
            .unwrap();
        store
            .write_snapshot("t1", run_b, &[lot("t1", "L1", 70)], SnapshotPhase::PostRun)
            .await
            .unwrap();

        let current: Vec<InventorySnapshot> = store
            .guard()
            .snapshots
            .iter()
            .filter(|s| s.is_current)
            .cloned()
            .collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].run_id, run_b);
        assert_eq!(current[0].remaining_quantity, 70);
    }

    #[tokio::test]
    async fn test_update_lot_remaining_is_a_bulk_set() {
        let store = MemoryStore::new();
        store
            .upsert_lots("t1", &[lot("t1", "L1", 100), lot("t1", "L2", 100)])
            .await
            .unwrap();

        store
            .update_lot_remaining("t1", &[("L1".to_string(), 40), ("L2".to_string(), 0)])
            .await
            .unwrap();

        let lots = store.load_current_inventory("t1", None).await.unwrap();
        assert_eq!(lots[0].remaining_quantity, 40);
        assert_eq!(lots[1].remaining_quantity, 0);
    }

    #[tokio::test]
    async fn test_invalidate_derived_flags_attributions_and_summaries() {
        use crate::domain::AttributionDetail;

        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        let attribution_id = Uuid::new_v4();
        let attribution = CogsAttribution {
            attribution_id,
            tenant_id: "t1".to_string(),
            run_id,
            sale_id: "s1".to_string(),
            sku: "A".to_string(),
            sale_date: NaiveDate::from_ymd_opt(2024, 7, 15).unwrap(),
            quantity_sold: 30,
            total_cogs: dec!(330.00),
            average_unit_cost: dec!(11.0000),
            is_valid: true,
            created_at: Utc::now(),
            details: vec![AttributionDetail {
                detail_id: Uuid::new_v4(),
                attribution_id,
                tenant_id: "t1".to_string(),
                lot_id: "L1".to_string(),
                quantity_allocated: 30,
                unit_cost: dec!(11.00),
                total_cost: dec!(330.00),
            }],
        };
        let summary = CogsSummary {
            summary_id: Uuid::new_v4(),
            tenant_id: "t1".to_string(),
            run_id,
            sku: "A".to_string(),
            period: "2024-07".to_string(),
            total_quantity_sold: 30,
            total_cogs: dec!(330.00),
            average_unit_cost: dec!(11.0000),
            is_valid: true,
            created_at: Utc::now(),
        };
        store.write_attributions("t1", &[attribution]).await.unwrap();
        store.write_summaries("t1", &[summary]).await.unwrap();

        store.invalidate_derived("t1", run_id).await.unwrap();

        let attributions = store.read_attributions("t1", run_id, 100, 0).await.unwrap();
        assert_eq!(attributions.len(), 1);
        assert!(!attributions[0].is_valid);
        assert_eq!(attributions[0].details.len(), 1);

        let summaries = store.read_summaries("t1", run_id).await.unwrap();
        assert!(!summaries[0].is_valid);
    }

    #[tokio::test]
    async fn test_cross_tenant_reads_return_nothing() {
        let store = MemoryStore::new();
        store
            .upsert_lots("t1", &[lot("t1", "L1", 100)])
            .await
            .unwrap();

        assert!(store
            .load_current_inventory("t2", None)
            .await
            .unwrap()
            .is_empty());
    }
}
