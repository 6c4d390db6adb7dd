//! Tenant isolation layer.
//!
//! [`TenantId`] validates identifier shape once, at the boundary.
//! [`TenantScope`] binds a store handle to one tenant and checks every
//! entity passed through it before any I/O: a mismatching `tenant_id` fails
//! closed with [`TenantError::ForeignEntity`] and never reaches the store.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    CogsAttribution, CogsSummary, InventoryMovement, InventorySnapshot, PurchaseLot, RunFilter,
    RunRecord, RunStatus, SnapshotPhase, ValidationRecord,
};
use crate::store::{CogsStore, LockToken, RollbackCommit, RunCommit, RunTransition, StoreError};

const MAX_TENANT_ID_LEN: usize = 100;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TenantError {
    #[error("invalid tenant id {0:?}: expected 1-100 chars of [A-Za-z0-9_-]")]
    InvalidTenantId(String),

    #[error("{entity} {id} belongs to tenant {found:?}, expected {expected}")]
    ForeignEntity {
        entity: &'static str,
        id: String,
        expected: String,
        found: String,
    },
}

/// A validated tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(raw: impl Into<String>) -> Result<Self, TenantError> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= MAX_TENANT_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Self(raw))
        } else {
            Err(TenantError::InvalidTenantId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A store handle bound to one tenant.
#[derive(Clone)]
pub struct TenantScope {
    store: Arc<dyn CogsStore>,
    tenant: TenantId,
}

impl TenantScope {
    pub fn new(store: Arc<dyn CogsStore>, tenant: TenantId) -> Self {
        Self { store, tenant }
    }

    pub fn tenant_id(&self) -> &str {
        self.tenant.as_str()
    }

    fn check(&self, entity: &'static str, id: &str, found: &str) -> Result<(), TenantError> {
        if found == self.tenant.as_str() {
            Ok(())
        } else {
            Err(TenantError::ForeignEntity {
                entity,
                id: id.to_string(),
                expected: self.tenant.as_str().to_string(),
                found: found.to_string(),
            })
        }
    }

    fn check_lots(&self, lots: &[PurchaseLot]) -> Result<(), StoreError> {
        for lot in lots {
            self.check("lot", &lot.lot_id, &lot.tenant_id)?;
        }
        Ok(())
    }

    pub async fn acquire_lock(&self) -> Result<LockToken, StoreError> {
        self.store.acquire_tenant_lock(self.tenant.as_str()).await
    }

    pub async fn release_lock(&self, token: &LockToken) -> Result<(), StoreError> {
        self.check("lock token", &token.token.to_string(), &token.tenant_id)?;
        self.store.release_tenant_lock(token).await
    }

    pub async fn load_current_inventory(
        &self,
        skus: Option<&[String]>,
    ) -> Result<Vec<PurchaseLot>, StoreError> {
        self.store
            .load_current_inventory(self.tenant.as_str(), skus)
            .await
    }

    pub async fn write_snapshot(
        &self,
        run_id: Uuid,
        lots: &[PurchaseLot],
        phase: SnapshotPhase,
    ) -> Result<(), StoreError> {
        self.check_lots(lots)?;
        self.store
            .write_snapshot(self.tenant.as_str(), run_id, lots, phase)
            .await
    }

    pub async fn read_snapshot(
        &self,
        run_id: Uuid,
        phase: SnapshotPhase,
    ) -> Result<Vec<InventorySnapshot>, StoreError> {
        self.store
            .read_snapshot(self.tenant.as_str(), run_id, phase)
            .await
    }

    pub async fn read_movements(&self, run_id: Uuid) -> Result<Vec<InventoryMovement>, StoreError> {
        self.store.read_movements(self.tenant.as_str(), run_id).await
    }

    pub async fn read_attributions(
        &self,
        run_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CogsAttribution>, StoreError> {
        self.store
            .read_attributions(self.tenant.as_str(), run_id, limit, offset)
            .await
    }

    pub async fn read_summaries(&self, run_id: Uuid) -> Result<Vec<CogsSummary>, StoreError> {
        self.store.read_summaries(self.tenant.as_str(), run_id).await
    }

    pub async fn read_validation_records(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<ValidationRecord>, StoreError> {
        self.store
            .read_validation_records(self.tenant.as_str(), run_id)
            .await
    }

    pub async fn create_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.check("run", &run.run_id.to_string(), &run.tenant_id)?;
        self.store.create_run(run).await
    }

    pub async fn transition_run(
        &self,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
        fields: RunTransition,
    ) -> Result<RunRecord, StoreError> {
        self.store
            .transition_run(self.tenant.as_str(), run_id, from, to, fields)
            .await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        self.store.get_run(self.tenant.as_str(), run_id).await
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, StoreError> {
        self.store.list_runs(self.tenant.as_str(), filter).await
    }

    pub async fn commit_run(
        &self,
        run_id: Uuid,
        commit: RunCommit,
    ) -> Result<RunRecord, StoreError> {
        self.check_lots(&commit.lots)?;
        for attribution in &commit.attributions {
            self.check(
                "attribution",
                &attribution.attribution_id.to_string(),
                &attribution.tenant_id,
            )?;
        }
        for movement in &commit.movements {
            self.check("movement", &movement.movement_id.to_string(), &movement.tenant_id)?;
        }
        self.store
            .commit_run(self.tenant.as_str(), run_id, commit)
            .await
    }

    pub async fn commit_rollback(
        &self,
        run_id: Uuid,
        commit: RollbackCommit,
    ) -> Result<RunRecord, StoreError> {
        for movement in &commit.movements {
            self.check("movement", &movement.movement_id.to_string(), &movement.tenant_id)?;
        }
        self.store
            .commit_rollback(self.tenant.as_str(), run_id, commit)
            .await
    }
}
