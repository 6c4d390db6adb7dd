//! Caller-facing engine facade.
//!
//! [`CogsEngine`] owns its persistence handle and configuration; there is no
//! process-wide state. HTTP layers, CLIs, and test harnesses all drive the
//! engine through this one surface.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::domain::{
    CogsAttribution, CogsSummary, InventoryValuation, Page, PurchaseLot, RunFilter, RunRecord,
    ValidationRecord,
};
use crate::services::rollback::{self, RollbackError};
use crate::services::runs::{self, RunError, RunRequest};
use crate::store::{CogsStore, StoreError};
use crate::tenant::{TenantError, TenantId, TenantScope};

/// Errors from read-side engine operations.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("run {run_id} not found for tenant {tenant_id}")]
    NotFound { tenant_id: String, run_id: Uuid },

    #[error(transparent)]
    Tenant(#[from] TenantError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

pub struct CogsEngine {
    store: Arc<dyn CogsStore>,
    config: EngineConfig,
}

impl CogsEngine {
    pub fn new(store: Arc<dyn CogsStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a journaled FIFO run. See [`runs::execute_run`].
    pub async fn execute_run(&self, request: RunRequest) -> Result<RunRecord, RunError> {
        runs::execute_run(self.store.clone(), &self.config, request).await
    }

    /// Reverse a completed run. See [`rollback::rollback_run`].
    pub async fn rollback_run(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<RunRecord, RollbackError> {
        rollback::rollback_run(self.store.clone(), tenant_id, run_id).await
    }

    pub async fn get_run(&self, tenant_id: &str, run_id: Uuid) -> Result<RunRecord, QueryError> {
        let scope = self.scope(tenant_id)?;
        scope
            .get_run(run_id)
            .await?
            .ok_or_else(|| QueryError::NotFound {
                tenant_id: tenant_id.to_string(),
                run_id,
            })
    }

    pub async fn list_runs(
        &self,
        tenant_id: &str,
        filter: RunFilter,
    ) -> Result<Vec<RunRecord>, QueryError> {
        let scope = self.scope(tenant_id)?;
        Ok(scope.list_runs(&filter).await?)
    }

    pub async fn read_attributions(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        page: Page,
    ) -> Result<Vec<CogsAttribution>, QueryError> {
        let scope = self.ensure_run(tenant_id, run_id).await?;
        Ok(scope
            .read_attributions(run_id, page.limit, page.offset)
            .await?)
    }

    pub async fn read_summaries(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<CogsSummary>, QueryError> {
        let scope = self.ensure_run(tenant_id, run_id).await?;
        Ok(scope.read_summaries(run_id).await?)
    }

    pub async fn read_validation_records(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<ValidationRecord>, QueryError> {
        let scope = self.ensure_run(tenant_id, run_id).await?;
        Ok(scope.read_validation_records(run_id).await?)
    }

    /// Current lot inventory, optionally filtered to one SKU.
    pub async fn read_current_inventory(
        &self,
        tenant_id: &str,
        sku: Option<&str>,
    ) -> Result<Vec<PurchaseLot>, QueryError> {
        let scope = self.scope(tenant_id)?;
        let skus = sku.map(|s| vec![s.to_string()]);
        Ok(scope.load_current_inventory(skus.as_deref()).await?)
    }

    /// Per-SKU remaining quantity and value over current inventory.
    pub async fn inventory_valuation(
        &self,
        tenant_id: &str,
        sku: Option<&str>,
    ) -> Result<Vec<InventoryValuation>, QueryError> {
        let lots = self.read_current_inventory(tenant_id, sku).await?;

        let mut valuations: Vec<InventoryValuation> = Vec::new();
        for lot in &lots {
            let value = lot.effective_unit_cost() * Decimal::from(lot.remaining_quantity);
            match valuations.iter_mut().find(|v| v.sku == lot.sku) {
                Some(entry) => {
                    entry.remaining_quantity += lot.remaining_quantity;
                    entry.remaining_value += value;
                }
                None => valuations.push(InventoryValuation {
                    sku: lot.sku.clone(),
                    remaining_quantity: lot.remaining_quantity,
                    remaining_value: value,
                }),
            }
        }
        for valuation in &mut valuations {
            valuation.remaining_value = valuation.remaining_value.round_dp(2);
        }
        valuations.sort_by(|a, b| a.sku.cmp(&b.sku));
        Ok(valuations)
    }

    fn scope(&self, tenant_id: &str) -> Result<TenantScope, TenantError> {
        Ok(TenantScope::new(
            self.store.clone(),
            TenantId::new(tenant_id)?,
        ))
    }

    async fn ensure_run(&self, tenant_id: &str, run_id: Uuid) -> Result<TenantScope, QueryError> {
        let scope = self.scope(tenant_id)?;
        if scope.get_run(run_id).await?.is_none() {
            return Err(QueryError::NotFound {
                tenant_id: tenant_id.to_string(),
                run_id,
            });
        }
        Ok(scope)
    }
}
