//! sqlx/Postgres implementation of the persistence contract.
//!
//! Multi-statement operations run inside a single transaction; the composite
//! commits lock the run row (`FOR UPDATE`), re-check the CAS precondition,
//! and apply every write before committing, so a run can never be observed
//! `completed` with only part of its side effects visible.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{
    AttributionDetail, CogsAttribution, CogsSummary, InventoryMovement, InventorySnapshot,
    MovementKind, PurchaseLot, RunFilter, RunMode, RunRecord, RunStatus, SnapshotPhase,
    ValidationKind, ValidationRecord,
};

use super::{
    CogsStore, LockToken, RollbackCommit, RunCommit, RunTransition, StoreError,
    LOCK_LEASE_SECONDS,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode_err(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> StoreError {
    StoreError::Database(sqlx::Error::Decode(e.into()))
}

#[derive(Debug, sqlx::FromRow)]
struct LotRow {
    tenant_id: String,
    lot_id: String,
    sku: String,
    received_date: NaiveDate,
    original_quantity: i64,
    remaining_quantity: i64,
    unit_price: Decimal,
    freight_cost_per_unit: Decimal,
}

impl From<LotRow> for PurchaseLot {
    fn from(row: LotRow) -> Self {
        PurchaseLot {
            tenant_id: row.tenant_id,
            lot_id: row.lot_id,
            sku: row.sku,
            received_date: row.received_date,
            original_quantity: row.original_quantity,
            remaining_quantity: row.remaining_quantity,
            unit_price: row.unit_price,
            freight_cost_per_unit: row.freight_cost_per_unit,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    run_id: Uuid,
    tenant_id: String,
    status: String,
    mode: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    rolled_back_at: Option<DateTime<Utc>>,
    input_file_id: Option<Uuid>,
    created_by: Option<String>,
    error_message: Option<String>,
    total_sales_processed: i64,
    total_cogs: Decimal,
    validation_errors_count: i64,
}

impl RunRow {
    fn into_record(self) -> Result<RunRecord, StoreError> {
        Ok(RunRecord {
            run_id: self.run_id,
            tenant_id: self.tenant_id,
            status: self.status.parse::<RunStatus>().map_err(decode_err)?,
            mode: self.mode.parse::<RunMode>().map_err(decode_err)?,
            started_at: self.started_at,
            completed_at: self.completed_at,
            rolled_back_at: self.rolled_back_at,
            input_file_id: self.input_file_id,
            created_by: self.created_by,
            error_message: self.error_message,
            total_sales_processed: self.total_sales_processed,
            total_cogs: self.total_cogs,
            validation_errors_count: self.validation_errors_count,
        })
    }
}

const RUN_COLUMNS: &str = "run_id, tenant_id, status, mode, started_at, completed_at, \
     rolled_back_at, input_file_id, created_by, error_message, \
     total_sales_processed, total_cogs, validation_errors_count";

#[derive(Debug, sqlx::FromRow)]
struct MovementRow {
    movement_id: Uuid,
    tenant_id: String,
    run_id: Uuid,
    lot_id: String,
    sku: String,
    kind: String,
    quantity: i64,
    remaining_after: i64,
    unit_cost: Decimal,
    reference_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl MovementRow {
    fn into_movement(self) -> Result<InventoryMovement, StoreError> {
        Ok(InventoryMovement {
            movement_id: self.movement_id,
            tenant_id: self.tenant_id,
            run_id: self.run_id,
            lot_id: self.lot_id,
            sku: self.sku,
            kind: self.kind.parse::<MovementKind>().map_err(decode_err)?,
            quantity: self.quantity,
            remaining_after: self.remaining_after,
            unit_cost: self.unit_cost,
            reference_id: self.reference_id,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    snapshot_id: Uuid,
    tenant_id: String,
    run_id: Uuid,
    lot_id: String,
    sku: String,
    remaining_quantity: i64,
    original_quantity: i64,
    unit_price: Decimal,
    freight_cost_per_unit: Decimal,
    received_date: NaiveDate,
    phase: String,
    is_current: bool,
    created_at: DateTime<Utc>,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<InventorySnapshot, StoreError> {
        Ok(InventorySnapshot {
            snapshot_id: self.snapshot_id,
            tenant_id: self.tenant_id,
            run_id: self.run_id,
            lot_id: self.lot_id,
            sku: self.sku,
            remaining_quantity: self.remaining_quantity,
            original_quantity: self.original_quantity,
            unit_price: self.unit_price,
            freight_cost_per_unit: self.freight_cost_per_unit,
            received_date: self.received_date,
            phase: self.phase.parse::<SnapshotPhase>().map_err(decode_err)?,
            is_current: self.is_current,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttributionRow {
    attribution_id: Uuid,
    tenant_id: String,
    run_id: Uuid,
    sale_id: String,
    sku: String,
    sale_date: NaiveDate,
    quantity_sold: i64,
    total_cogs: Decimal,
    average_unit_cost: Decimal,
    is_valid: bool,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct DetailRow {
    detail_id: Uuid,
    attribution_id: Uuid,
    tenant_id: String,
    lot_id: String,
    quantity_allocated: i64,
    unit_cost: Decimal,
    total_cost: Decimal,
}

// Transaction-scoped write helpers, shared by the standalone trait methods
// and the composite commits.

async fn upsert_lots_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    lots: &[PurchaseLot],
) -> Result<(), sqlx::Error> {
    for lot in lots {
        sqlx::query(
            r#"
            INSERT INTO lots
                (tenant_id, lot_id, sku, received_date, original_quantity,
                 remaining_quantity, unit_price, freight_cost_per_unit)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, lot_id) DO UPDATE SET
                sku = EXCLUDED.sku,
                received_date = EXCLUDED.received_date,
                original_quantity = EXCLUDED.original_quantity,
                remaining_quantity = EXCLUDED.remaining_quantity,
                unit_price = EXCLUDED.unit_price,
                freight_cost_per_unit = EXCLUDED.freight_cost_per_unit,
                updated_at = now()
            "#,
        )
        .bind(tenant_id)
        .bind(&lot.lot_id)
        .bind(&lot.sku)
        .bind(lot.received_date)
        .bind(lot.original_quantity)
        .bind(lot.remaining_quantity)
        .bind(lot.unit_price)
        .bind(lot.freight_cost_per_unit)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn update_lot_remaining_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    updates: &[(String, i64)],
) -> Result<(), sqlx::Error> {
    for (lot_id, remaining) in updates {
        sqlx::query(
            r#"
            UPDATE lots SET remaining_quantity = $3, updated_at = now()
            WHERE tenant_id = $1 AND lot_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(lot_id)
        .bind(remaining)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn clear_current_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    lot_ids: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE inventory_snapshots SET is_current = FALSE
        WHERE tenant_id = $1 AND lot_id = ANY($2) AND is_current
        "#,
    )
    .bind(tenant_id)
    .bind(lot_ids)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_snapshots_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    run_id: Uuid,
    lots: &[PurchaseLot],
    phase: SnapshotPhase,
    is_current: bool,
) -> Result<(), sqlx::Error> {
    for lot in lots {
        sqlx::query(
            r#"
            INSERT INTO inventory_snapshots
                (snapshot_id, tenant_id, run_id, lot_id, sku, remaining_quantity,
                 original_quantity, unit_price, freight_cost_per_unit,
                 received_date, phase, is_current, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(run_id)
        .bind(&lot.lot_id)
        .bind(&lot.sku)
        .bind(lot.remaining_quantity)
        .bind(lot.original_quantity)
        .bind(lot.unit_price)
        .bind(lot.freight_cost_per_unit)
        .bind(lot.received_date)
        .bind(phase.as_str())
        .bind(is_current)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn write_post_run_snapshot_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    run_id: Uuid,
    lots: &[PurchaseLot],
) -> Result<(), sqlx::Error> {
    let lot_ids: Vec<String> = lots.iter().map(|l| l.lot_id.clone()).collect();
    clear_current_tx(tx, tenant_id, &lot_ids).await?;
    insert_snapshots_tx(tx, tenant_id, run_id, lots, SnapshotPhase::PostRun, true).await
}

async fn append_movements_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    movements: &[InventoryMovement],
) -> Result<(), sqlx::Error> {
    for movement in movements {
        sqlx::query(
            r#"
            INSERT INTO inventory_movements
                (movement_id, tenant_id, run_id, lot_id, sku, kind, quantity,
                 remaining_after, unit_cost, reference_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(movement.movement_id)
        .bind(tenant_id)
        .bind(movement.run_id)
        .bind(&movement.lot_id)
        .bind(&movement.sku)
        .bind(movement.kind.as_str())
        .bind(movement.quantity)
        .bind(movement.remaining_after)
        .bind(movement.unit_cost)
        .bind(&movement.reference_id)
        .bind(movement.created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn write_attributions_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    attributions: &[CogsAttribution],
) -> Result<(), sqlx::Error> {
    for attribution in attributions {
        sqlx::query(
            r#"
            INSERT INTO cogs_attributions
                (attribution_id, tenant_id, run_id, sale_id, sku, sale_date,
                 quantity_sold, total_cogs, average_unit_cost, is_valid, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(attribution.attribution_id)
        .bind(tenant_id)
        .bind(attribution.run_id)
        .bind(&attribution.sale_id)
        .bind(&attribution.sku)
        .bind(attribution.sale_date)
        .bind(attribution.quantity_sold)
        .bind(attribution.total_cogs)
        .bind(attribution.average_unit_cost)
        .bind(attribution.is_valid)
        .bind(attribution.created_at)
        .execute(&mut **tx)
        .await?;

        for detail in &attribution.details {
            sqlx::query(
                r#"
                INSERT INTO cogs_attribution_details
                    (detail_id, attribution_id, tenant_id, lot_id,
                     quantity_allocated, unit_cost, total_cost)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(detail.detail_id)
            .bind(attribution.attribution_id)
            .bind(tenant_id)
            .bind(&detail.lot_id)
            .bind(detail.quantity_allocated)
            .bind(detail.unit_cost)
            .bind(detail.total_cost)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn write_summaries_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    summaries: &[CogsSummary],
) -> Result<(), sqlx::Error> {
    for summary in summaries {
        sqlx::query(
            r#"
            INSERT INTO cogs_summaries
                (summary_id, tenant_id, run_id, sku, period, total_quantity_sold,
                 total_cogs, average_unit_cost, is_valid, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(summary.summary_id)
        .bind(tenant_id)
        .bind(summary.run_id)
        .bind(&summary.sku)
        .bind(&summary.period)
        .bind(summary.total_quantity_sold)
        .bind(summary.total_cogs)
        .bind(summary.average_unit_cost)
        .bind(summary.is_valid)
        .bind(summary.created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn write_validation_records_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    records: &[ValidationRecord],
) -> Result<(), sqlx::Error> {
    for record in records {
        sqlx::query(
            r#"
            INSERT INTO validation_records
                (record_id, tenant_id, run_id, kind, sku, sale_id, quantity,
                 message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.record_id)
        .bind(tenant_id)
        .bind(record.run_id)
        .bind(record.kind.as_str())
        .bind(&record.sku)
        .bind(&record.sale_id)
        .bind(record.quantity)
        .bind(&record.message)
        .bind(record.created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn invalidate_derived_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    run_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE cogs_attributions SET is_valid = FALSE WHERE tenant_id = $1 AND run_id = $2")
        .bind(tenant_id)
        .bind(run_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("UPDATE cogs_summaries SET is_valid = FALSE WHERE tenant_id = $1 AND run_id = $2")
        .bind(tenant_id)
        .bind(run_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Lock the run row and verify it is in `expected` status.
async fn lock_run_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    run_id: Uuid,
    expected: RunStatus,
) -> Result<(), StoreError> {
    let status: Option<String> = sqlx::query_scalar(
        "SELECT status FROM cogs_runs WHERE tenant_id = $1 AND run_id = $2 FOR UPDATE",
    )
    .bind(tenant_id)
    .bind(run_id)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(status) = status else {
        return Err(StoreError::RunNotFound {
            tenant_id: tenant_id.to_string(),
            run_id,
        });
    };
    let actual = status.parse::<RunStatus>().map_err(decode_err)?;
    if actual != expected {
        return Err(StoreError::StateConflict {
            run_id,
            expected,
            actual,
        });
    }
    Ok(())
}

async fn fetch_run_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    run_id: Uuid,
) -> Result<RunRecord, StoreError> {
    let row = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM cogs_runs WHERE tenant_id = $1 AND run_id = $2"
    ))
    .bind(tenant_id)
    .bind(run_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| StoreError::RunNotFound {
        tenant_id: tenant_id.to_string(),
        run_id,
    })?;
    row.into_record()
}

#[async_trait]
impl CogsStore for PgStore {
    async fn acquire_tenant_lock(&self, tenant_id: &str) -> Result<LockToken, StoreError> {
        let token = Uuid::new_v4();
        let expires_at = Utc::now() + chrono::Duration::seconds(LOCK_LEASE_SECONDS);
        let result = sqlx::query(
            r#"
            INSERT INTO tenant_locks (tenant_id, token, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id) DO UPDATE
                SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                WHERE tenant_locks.expires_at <= now()
            "#,
        )
        .bind(tenant_id)
        .bind(token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LockHeld {
                tenant_id: tenant_id.to_string(),
            });
        }
        Ok(LockToken {
            tenant_id: tenant_id.to_string(),
            token,
        })
    }

    async fn release_tenant_lock(&self, token: &LockToken) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM tenant_locks WHERE tenant_id = $1 AND token = $2")
            .bind(&token.tenant_id)
            .bind(token.token)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::StaleLock {
                tenant_id: token.tenant_id.clone(),
            });
        }
        Ok(())
    }

    async fn load_current_inventory(
        &self,
        tenant_id: &str,
        skus: Option<&[String]>,
    ) -> Result<Vec<PurchaseLot>, StoreError> {
        let rows = sqlx::query_as::<_, LotRow>(
            r#"
            SELECT tenant_id, lot_id, sku, received_date, original_quantity,
                   remaining_quantity, unit_price, freight_cost_per_unit
            FROM lots
            WHERE tenant_id = $1
              AND ($2::text[] IS NULL OR sku = ANY($2))
            ORDER BY sku, received_date, lot_id
            "#,
        )
        .bind(tenant_id)
        .bind(skus.map(<[String]>::to_vec))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PurchaseLot::from).collect())
    }

    async fn upsert_lots(&self, tenant_id: &str, lots: &[PurchaseLot]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        upsert_lots_tx(&mut tx, tenant_id, lots).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_lot_remaining(
        &self,
        tenant_id: &str,
        updates: &[(String, i64)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        update_lot_remaining_tx(&mut tx, tenant_id, updates).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn write_snapshot(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        lots: &[PurchaseLot],
        phase: SnapshotPhase,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        match phase {
            SnapshotPhase::PreRun => {
                insert_snapshots_tx(&mut tx, tenant_id, run_id, lots, phase, false).await?
            }
            SnapshotPhase::PostRun => {
                write_post_run_snapshot_tx(&mut tx, tenant_id, run_id, lots).await?
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn read_snapshot(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        phase: SnapshotPhase,
    ) -> Result<Vec<InventorySnapshot>, StoreError> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT snapshot_id, tenant_id, run_id, lot_id, sku, remaining_quantity,
                   original_quantity, unit_price, freight_cost_per_unit,
                   received_date, phase, is_current, created_at
            FROM inventory_snapshots
            WHERE tenant_id = $1 AND run_id = $2 AND phase = $3
            ORDER BY lot_id
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .bind(phase.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    async fn append_movements(
        &self,
        tenant_id: &str,
        movements: &[InventoryMovement],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        append_movements_tx(&mut tx, tenant_id, movements).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_movements(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<InventoryMovement>, StoreError> {
        let rows = sqlx::query_as::<_, MovementRow>(
            r#"
            SELECT movement_id, tenant_id, run_id, lot_id, sku, kind, quantity,
                   remaining_after, unit_cost, reference_id, created_at
            FROM inventory_movements
            WHERE tenant_id = $1 AND run_id = $2
            ORDER BY seq
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MovementRow::into_movement).collect()
    }

    async fn write_attributions(
        &self,
        tenant_id: &str,
        attributions: &[CogsAttribution],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_attributions_tx(&mut tx, tenant_id, attributions).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_attributions(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CogsAttribution>, StoreError> {
        let rows = sqlx::query_as::<_, AttributionRow>(
            r#"
            SELECT attribution_id, tenant_id, run_id, sale_id, sku, sale_date,
                   quantity_sold, total_cogs, average_unit_cost, is_valid, created_at
            FROM cogs_attributions
            WHERE tenant_id = $1 AND run_id = $2
            ORDER BY seq
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.attribution_id).collect();
        let detail_rows = sqlx::query_as::<_, DetailRow>(
            r#"
            SELECT detail_id, attribution_id, tenant_id, lot_id,
                   quantity_allocated, unit_cost, total_cost
            FROM cogs_attribution_details
            WHERE tenant_id = $1 AND attribution_id = ANY($2)
            ORDER BY seq
            "#,
        )
        .bind(tenant_id)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut attributions: Vec<CogsAttribution> = rows
            .into_iter()
            .map(|row| CogsAttribution {
                attribution_id: row.attribution_id,
                tenant_id: row.tenant_id,
                run_id: row.run_id,
                sale_id: row.sale_id,
                sku: row.sku,
                sale_date: row.sale_date,
                quantity_sold: row.quantity_sold,
                total_cogs: row.total_cogs,
                average_unit_cost: row.average_unit_cost,
                is_valid: row.is_valid,
                created_at: row.created_at,
                details: Vec::new(),
            })
            .collect();
        for detail in detail_rows {
            if let Some(attribution) = attributions
                .iter_mut()
                .find(|a| a.attribution_id == detail.attribution_id)
            {
                attribution.details.push(AttributionDetail {
                    detail_id: detail.detail_id,
                    attribution_id: detail.attribution_id,
                    tenant_id: detail.tenant_id,
                    lot_id: detail.lot_id,
                    quantity_allocated: detail.quantity_allocated,
                    unit_cost: detail.unit_cost,
                    total_cost: detail.total_cost,
                });
            }
        }
        Ok(attributions)
    }

    async fn write_summaries(
        &self,
        tenant_id: &str,
        summaries: &[CogsSummary],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_summaries_tx(&mut tx, tenant_id, summaries).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_summaries(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<CogsSummary>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct SummaryRow {
            summary_id: Uuid,
            tenant_id: String,
            run_id: Uuid,
            sku: String,
            period: String,
            total_quantity_sold: i64,
            total_cogs: Decimal,
            average_unit_cost: Decimal,
            is_valid: bool,
            created_at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT summary_id, tenant_id, run_id, sku, period, total_quantity_sold,
                   total_cogs, average_unit_cost, is_valid, created_at
            FROM cogs_summaries
            WHERE tenant_id = $1 AND run_id = $2
            ORDER BY sku, period
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| CogsSummary {
                summary_id: row.summary_id,
                tenant_id: row.tenant_id,
                run_id: row.run_id,
                sku: row.sku,
                period: row.period,
                total_quantity_sold: row.total_quantity_sold,
                total_cogs: row.total_cogs,
                average_unit_cost: row.average_unit_cost,
                is_valid: row.is_valid,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn write_validation_records(
        &self,
        tenant_id: &str,
        records: &[ValidationRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_validation_records_tx(&mut tx, tenant_id, records).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_validation_records(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Vec<ValidationRecord>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct ValidationRow {
            record_id: Uuid,
            tenant_id: String,
            run_id: Uuid,
            kind: String,
            sku: Option<String>,
            sale_id: Option<String>,
            quantity: Option<i64>,
            message: String,
            created_at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, ValidationRow>(
            r#"
            SELECT record_id, tenant_id, run_id, kind, sku, sale_id, quantity,
                   message, created_at
            FROM validation_records
            WHERE tenant_id = $1 AND run_id = $2
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(ValidationRecord {
                    record_id: row.record_id,
                    tenant_id: row.tenant_id,
                    run_id: row.run_id,
                    kind: row.kind.parse::<ValidationKind>().map_err(decode_err)?,
                    sku: row.sku,
                    sale_id: row.sale_id,
                    quantity: row.quantity,
                    message: row.message,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn create_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO cogs_runs
                (run_id, tenant_id, status, mode, started_at, completed_at,
                 rolled_back_at, input_file_id, created_by, error_message,
                 total_sales_processed, total_cogs, validation_errors_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run.run_id)
        .bind(&run.tenant_id)
        .bind(run.status.as_str())
        .bind(run.mode.as_str())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.rolled_back_at)
        .bind(run.input_file_id)
        .bind(&run.created_by)
        .bind(&run.error_message)
        .bind(run.total_sales_processed)
        .bind(run.total_cogs)
        .bind(run.validation_errors_count)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunExists { run_id: run.run_id });
        }
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
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE cogs_runs
            SET status = $4,
                completed_at = COALESCE($5, completed_at),
                error_message = COALESCE($6, error_message)
            WHERE tenant_id = $1 AND run_id = $2 AND status = $3
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(fields.completed_at)
        .bind(&fields.error_message)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish "gone" from "wrong state".
            let run = fetch_run_tx(&mut tx, tenant_id, run_id).await?;
            return Err(StoreError::StateConflict {
                run_id,
                expected: from,
                actual: run.status,
            });
        }
        let run = fetch_run_tx(&mut tx, tenant_id, run_id).await?;
        tx.commit().await?;
        Ok(run)
    }

    async fn get_run(
        &self,
        tenant_id: &str,
        run_id: Uuid,
    ) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM cogs_runs WHERE tenant_id = $1 AND run_id = $2"
        ))
        .bind(tenant_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RunRow::into_record).transpose()
    }

    async fn list_runs(
        &self,
        tenant_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM cogs_runs
            WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY started_at DESC
            LIMIT $3
            "#
        ))
        .bind(tenant_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RunRow::into_record).collect()
    }

    async fn invalidate_derived(&self, tenant_id: &str, run_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        invalidate_derived_tx(&mut tx, tenant_id, run_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_run(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        commit: RunCommit,
    ) -> Result<RunRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_run_tx(&mut tx, tenant_id, run_id, RunStatus::Running).await?;

        upsert_lots_tx(&mut tx, tenant_id, &commit.lots).await?;
        write_post_run_snapshot_tx(&mut tx, tenant_id, run_id, &commit.lots).await?;
        append_movements_tx(&mut tx, tenant_id, &commit.movements).await?;
        write_attributions_tx(&mut tx, tenant_id, &commit.attributions).await?;
        write_summaries_tx(&mut tx, tenant_id, &commit.summaries).await?;
        write_validation_records_tx(&mut tx, tenant_id, &commit.validation_records).await?;

        sqlx::query(
            r#"
            UPDATE cogs_runs
            SET status = $3, completed_at = $4, total_sales_processed = $5,
                total_cogs = $6, validation_errors_count = $7
            WHERE tenant_id = $1 AND run_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .bind(RunStatus::Completed.as_str())
        .bind(commit.completed_at)
        .bind(commit.counters.total_sales_processed)
        .bind(commit.counters.total_cogs)
        .bind(commit.counters.validation_errors_count)
        .execute(&mut *tx)
        .await?;

        let run = fetch_run_tx(&mut tx, tenant_id, run_id).await?;
        tx.commit().await?;
        Ok(run)
    }

    async fn commit_rollback(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        commit: RollbackCommit,
    ) -> Result<RunRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_run_tx(&mut tx, tenant_id, run_id, RunStatus::Completed).await?;

        update_lot_remaining_tx(&mut tx, tenant_id, &commit.restored).await?;
        append_movements_tx(&mut tx, tenant_id, &commit.movements).await?;

        // Re-point the current snapshot flag at the run's pre-run rows.
        let pre_lot_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT lot_id FROM inventory_snapshots
            WHERE tenant_id = $1 AND run_id = $2 AND phase = 'pre_run'
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await?;
        clear_current_tx(&mut tx, tenant_id, &pre_lot_ids).await?;
        sqlx::query(
            r#"
            UPDATE inventory_snapshots SET is_current = TRUE
            WHERE tenant_id = $1 AND run_id = $2 AND phase = 'pre_run'
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        invalidate_derived_tx(&mut tx, tenant_id, run_id).await?;

        sqlx::query(
            r#"
            UPDATE cogs_runs SET status = $3, rolled_back_at = $4
            WHERE tenant_id = $1 AND run_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .bind(RunStatus::RolledBack.as_str())
        .bind(commit.rolled_back_at)
        .execute(&mut *tx)
        .await?;

        let run = fetch_run_tx(&mut tx, tenant_id, run_id).await?;
        tx.commit().await?;
        Ok(run)
    }
}
