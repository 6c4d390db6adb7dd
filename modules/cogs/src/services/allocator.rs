//! Pure FIFO allocation.
//!
//! Allocates one tenant's sales against its lot inventory and produces the
//! full decision record: attributions with per-lot details, the movement
//! journal, post-allocation lot state, per-row validation findings, and
//! monthly summaries. No I/O; the coordinator persists the outcome.
//!
//! Determinism: lots are walked in canonical order (`received_date` asc,
//! `lot_id` asc per SKU), sales in `(sale_date, sale_id)` order, and every
//! grouped output is sorted, so identical inputs produce identical outputs.

use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    AttributionDetail, CogsAttribution, CogsSummary, InventoryMovement, MovementKind, PurchaseLot,
    Sale, ValidationKind, ValidationRecord,
};

/// Decimal places carried by monetary sums and per-unit averages.
const MONEY_DP: u32 = 2;
const UNIT_COST_DP: u32 = 4;

/// Structural input violations. These abort the run (`failed`); data-shape
/// problems per sale never land here, they become validation records.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("lot invariant violated: {0}")]
    LotInvariant(String),

    #[error("sale {sale_id} has zero quantity")]
    ZeroQuantitySale { sale_id: String },
}

/// Everything a single allocation pass decides.
#[derive(Debug, Clone)]
pub struct AllocationOutcome {
    pub attributions: Vec<CogsAttribution>,
    pub movements: Vec<InventoryMovement>,
    /// Post-allocation state of every input lot, in canonical order.
    pub lots: Vec<PurchaseLot>,
    pub validation_records: Vec<ValidationRecord>,
    pub summaries: Vec<CogsSummary>,
    /// Sum of attribution `total_cogs` (returns negative), 2 dp.
    pub total_cogs: Decimal,
}

/// Allocate `sales` against `lots` for one tenant.
///
/// Sales are processed in ascending `(sale_date, sale_id)` order. Positive
/// quantities consume lots oldest-first; negative quantities (returns)
/// restore newest-consumed-first. When `require_date_guard` is set, a sale
/// may not consume lots received after its sale date.
pub fn allocate(
    tenant_id: &str,
    run_id: Uuid,
    lots: &[PurchaseLot],
    sales: &[Sale],
    require_date_guard: bool,
) -> Result<AllocationOutcome, AllocationError> {
    for lot in lots {
        lot.check_invariants()
            .map_err(AllocationError::LotInvariant)?;
    }
    for sale in sales {
        if sale.quantity == 0 {
            return Err(AllocationError::ZeroQuantitySale {
                sale_id: sale.sale_id.clone(),
            });
        }
    }

    let mut working: Vec<PurchaseLot> = lots.to_vec();
    working.sort_by(|a, b| {
        a.sku
            .cmp(&b.sku)
            .then_with(|| a.received_date.cmp(&b.received_date))
            .then_with(|| a.lot_id.cmp(&b.lot_id))
    });

    // Canonical per-SKU walk order over `working`.
    let mut by_sku: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, lot) in working.iter().enumerate() {
        by_sku.entry(lot.sku.clone()).or_default().push(idx);
    }

    let mut ordered_sales: Vec<&Sale> = sales.iter().collect();
    ordered_sales.sort_by(|a, b| {
        a.sale_date
            .cmp(&b.sale_date)
            .then_with(|| a.sale_id.cmp(&b.sale_id))
    });

    let mut state = Pass {
        tenant_id,
        run_id,
        attributions: Vec::new(),
        movements: Vec::new(),
        validation_records: Vec::new(),
    };

    for sale in ordered_sales {
        let lot_indices = by_sku.get(sale.sku.as_str()).map(Vec::as_slice);
        if sale.quantity > 0 {
            state.consume(sale, &mut working, lot_indices, require_date_guard);
        } else {
            state.restore(sale, &mut working, lot_indices);
        }
    }

    let summaries = summarize(tenant_id, run_id, &state.attributions);
    let total_cogs = state
        .attributions
        .iter()
        .map(|a| a.total_cogs)
        .sum::<Decimal>()
        .round_dp(MONEY_DP);

    Ok(AllocationOutcome {
        attributions: state.attributions,
        movements: state.movements,
        lots: working,
        validation_records: state.validation_records,
        summaries,
        total_cogs,
    })
}

struct Pass<'a> {
    tenant_id: &'a str,
    run_id: Uuid,
    attributions: Vec<CogsAttribution>,
    movements: Vec<InventoryMovement>,
    validation_records: Vec<ValidationRecord>,
}

impl Pass<'_> {
    /// Allocate a positive-quantity sale oldest-first.
    fn consume(
        &mut self,
        sale: &Sale,
        working: &mut [PurchaseLot],
        lot_indices: Option<&[usize]>,
        require_date_guard: bool,
    ) {
        let Some(indices) = lot_indices else {
            self.validation_records.push(ValidationRecord::new(
                self.tenant_id,
                self.run_id,
                ValidationKind::UnknownSku,
                Some(&sale.sku),
                Some(&sale.sale_id),
                Some(sale.quantity),
                format!("no lots exist for SKU {}", sale.sku),
            ));
            return;
        };

        let attribution_id = Uuid::new_v4();
        let mut need = sale.quantity;
        let mut details: Vec<AttributionDetail> = Vec::new();
        let mut guard_skipped = false;

        for &idx in indices {
            if need == 0 {
                break;
            }
            let lot = &mut working[idx];
            if lot.is_exhausted() {
                continue;
            }
            if require_date_guard && lot.received_date > sale.sale_date {
                guard_skipped = true;
                continue;
            }

            let take = need.min(lot.remaining_quantity);
            lot.remaining_quantity -= take;
            need -= take;

            let unit_cost = lot.effective_unit_cost();
            details.push(AttributionDetail {
                detail_id: Uuid::new_v4(),
                attribution_id,
                tenant_id: self.tenant_id.to_string(),
                lot_id: lot.lot_id.clone(),
                quantity_allocated: take,
                unit_cost,
                total_cost: unit_cost * Decimal::from(take),
            });
            let movement = self.movement(sale, lot, MovementKind::Sale, -take, unit_cost);
            self.movements.push(movement);
            tracing::debug!(
                sale_id = %sale.sale_id,
                lot_id = %lot.lot_id,
                allocated = take,
                remaining = lot.remaining_quantity,
                "allocated units from lot"
            );
        }

        let allocated = sale.quantity - need;
        if need > 0 {
            self.validation_records.push(ValidationRecord::new(
                self.tenant_id,
                self.run_id,
                ValidationKind::InsufficientInventory,
                Some(&sale.sku),
                Some(&sale.sale_id),
                Some(need),
                format!(
                    "insufficient inventory for SKU {}: needed {}, allocated {}",
                    sale.sku, sale.quantity, allocated
                ),
            ));
            if guard_skipped {
                self.validation_records.push(ValidationRecord::new(
                    self.tenant_id,
                    self.run_id,
                    ValidationKind::DateInversion,
                    Some(&sale.sku),
                    Some(&sale.sale_id),
                    None,
                    format!(
                        "lots received after sale date {} were skipped",
                        sale.sale_date
                    ),
                ));
            }
        }
        if allocated == 0 {
            return;
        }

        self.attributions.push(build_attribution(
            attribution_id,
            self.tenant_id,
            self.run_id,
            sale,
            sale.quantity,
            need == 0,
            details,
        ));
    }

    /// Restore a return (negative quantity) newest-consumed-first. Returns
    /// ignore the date guard: restoration targets whatever was consumed.
    fn restore(&mut self, sale: &Sale, working: &mut [PurchaseLot], lot_indices: Option<&[usize]>) {
        let attribution_id = Uuid::new_v4();
        let mut need = -sale.quantity;
        let mut details: Vec<AttributionDetail> = Vec::new();

        if let Some(indices) = lot_indices {
            for &idx in indices.iter().rev() {
                if need == 0 {
                    break;
                }
                let lot = &mut working[idx];
                let capacity = lot.consumed_quantity();
                if capacity == 0 {
                    continue;
                }

                let restore = need.min(capacity);
                lot.remaining_quantity += restore;
                need -= restore;

                let unit_cost = lot.effective_unit_cost();
                details.push(AttributionDetail {
                    detail_id: Uuid::new_v4(),
                    attribution_id,
                    tenant_id: self.tenant_id.to_string(),
                    lot_id: lot.lot_id.clone(),
                    quantity_allocated: -restore,
                    unit_cost,
                    total_cost: unit_cost * Decimal::from(-restore),
                });
                let movement = self.movement(sale, lot, MovementKind::Return, restore, unit_cost);
                self.movements.push(movement);
                tracing::debug!(
                    sale_id = %sale.sale_id,
                    lot_id = %lot.lot_id,
                    restored = restore,
                    remaining = lot.remaining_quantity,
                    "restored units to lot"
                );
            }
        }

        let restored = -sale.quantity - need;
        if need > 0 {
            self.validation_records.push(ValidationRecord::new(
                self.tenant_id,
                self.run_id,
                ValidationKind::OverReturn,
                Some(&sale.sku),
                Some(&sale.sale_id),
                Some(need),
                format!(
                    "return of {} exceeds consumed capacity for SKU {}: restored {}",
                    -sale.quantity,
                    sale.sku,
                    restored
                ),
            ));
        }
        if restored == 0 {
            return;
        }

        self.attributions.push(build_attribution(
            attribution_id,
            self.tenant_id,
            self.run_id,
            sale,
            -restored,
            true,
            details,
        ));
    }

    fn movement(
        &self,
        sale: &Sale,
        lot: &PurchaseLot,
        kind: MovementKind,
        quantity: i64,
        unit_cost: Decimal,
    ) -> InventoryMovement {
        InventoryMovement {
            movement_id: Uuid::new_v4(),
            tenant_id: self.tenant_id.to_string(),
            run_id: self.run_id,
            lot_id: lot.lot_id.clone(),
            sku: lot.sku.clone(),
            kind,
            quantity,
            remaining_after: lot.remaining_quantity,
            unit_cost,
            reference_id: Some(sale.sale_id.clone()),
            created_at: Utc::now(),
        }
    }
}

fn build_attribution(
    attribution_id: Uuid,
    tenant_id: &str,
    run_id: Uuid,
    sale: &Sale,
    quantity_sold: i64,
    is_valid: bool,
    details: Vec<AttributionDetail>,
) -> CogsAttribution {
    let total_cogs = details
        .iter()
        .map(|d| d.total_cost)
        .sum::<Decimal>()
        .round_dp(MONEY_DP);
    CogsAttribution {
        attribution_id,
        tenant_id: tenant_id.to_string(),
        run_id,
        sale_id: sale.sale_id.clone(),
        sku: sale.sku.clone(),
        sale_date: sale.sale_date,
        quantity_sold,
        total_cogs,
        average_unit_cost: average_cost(total_cogs, quantity_sold),
        is_valid,
        created_at: Utc::now(),
        details,
    }
}

fn average_cost(total: Decimal, quantity: i64) -> Decimal {
    if quantity == 0 {
        return Decimal::ZERO;
    }
    (total / Decimal::from(quantity)).round_dp(UNIT_COST_DP)
}

/// Roll attributions up by `(sku, YYYY-MM)`. Partial attributions contribute
/// their allocated cost; return attributions contribute negative quantity
/// and negative COGS.
fn summarize(tenant_id: &str, run_id: Uuid, attributions: &[CogsAttribution]) -> Vec<CogsSummary> {
    let mut grouped: HashMap<(String, String), (i64, Decimal)> = HashMap::new();
    for attribution in attributions {
        let period = attribution.sale_date.format("%Y-%m").to_string();
        let entry = grouped
            .entry((attribution.sku.clone(), period))
            .or_insert((0, Decimal::ZERO));
        entry.0 += attribution.quantity_sold;
        entry.1 += attribution.total_cogs;
    }

    let mut summaries: Vec<CogsSummary> = grouped
        .into_iter()
        .map(|((sku, period), (quantity, total))| {
            let total = total.round_dp(MONEY_DP);
            CogsSummary {
                summary_id: Uuid::new_v4(),
                tenant_id: tenant_id.to_string(),
                run_id,
                sku,
                period,
                total_quantity_sold: quantity,
                total_cogs: total,
                average_unit_cost: average_cost(total, quantity),
                is_valid: true,
                created_at: Utc::now(),
            }
        })
        .collect();

    // Deterministic output ordering, independent of map iteration.
    summaries.sort_by(|a, b| a.sku.cmp(&b.sku).then_with(|| a.period.cmp(&b.period)));
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn lot(id: &str, sku: &str, received: NaiveDate, qty: i64, price: Decimal) -> PurchaseLot {
        PurchaseLot {
            tenant_id: "t1".to_string(),
            lot_id: id.to_string(),
            sku: sku.to_string(),
            received_date: received,
            original_quantity: qty,
            remaining_quantity: qty,
            unit_price: price,
            freight_cost_per_unit: Decimal::ZERO,
        }
    }

    fn sale(id: &str, sku: &str, day: NaiveDate, qty: i64) -> Sale {
        Sale {
            tenant_id: "t1".to_string(),
            sale_id: id.to_string(),
            sku: sku.to_string(),
            sale_date: day,
            quantity: qty,
        }
    }

    #[test]
    fn test_canonical_order_breaks_date_ties_by_lot_id() {
        let lots = vec![
            lot("L2", "A", date(2024, 7, 1), 5, dec!(2.00)),
            lot("L1", "A", date(2024, 7, 1), 5, dec!(1.00)),
        ];
        let sales = vec![sale("s1", "A", date(2024, 7, 2), 5)];

        let outcome = allocate("t1", Uuid::new_v4(), &lots, &sales, true).unwrap();

        // Same received date: L1 wins the tie-break.
        assert_eq!(outcome.attributions[0].details[0].lot_id, "L1");
        assert_eq!(outcome.attributions[0].total_cogs, dec!(5.00));
    }

    #[test]
    fn test_sales_processed_in_date_order() {
        let lots = vec![lot("L1", "A", date(2024, 7, 1), 10, dec!(1.00))];
        let sales = vec![
            sale("s2", "A", date(2024, 7, 20), 6),
            sale("s1", "A", date(2024, 7, 10), 6),
        ];

        let outcome = allocate("t1", Uuid::new_v4(), &lots, &sales, true).unwrap();

        // s1 (earlier date) allocates fully; s2 takes the remainder.
        assert_eq!(outcome.attributions[0].sale_id, "s1");
        assert!(outcome.attributions[0].is_valid);
        assert_eq!(outcome.attributions[1].sale_id, "s2");
        assert!(!outcome.attributions[1].is_valid);
    }

    #[test]
    fn test_zero_quantity_sale_is_structural() {
        let lots = vec![lot("L1", "A", date(2024, 7, 1), 10, dec!(1.00))];
        let sales = vec![sale("s1", "A", date(2024, 7, 2), 0)];
        assert!(matches!(
            allocate("t1", Uuid::new_v4(), &lots, &sales, true),
            Err(AllocationError::ZeroQuantitySale { .. })
        ));
    }

    #[test]
    fn test_corrupt_lot_is_structural() {
        let mut bad = lot("L1", "A", date(2024, 7, 1), 10, dec!(1.00));
        bad.remaining_quantity = 12;
        let sales = vec![sale("s1", "A", date(2024, 7, 2), 1)];
        assert!(matches!(
            allocate("t1", Uuid::new_v4(), &[bad], &sales, true),
            Err(AllocationError::LotInvariant(_))
        ));
    }

    #[test]
    fn test_date_guard_disabled_consumes_future_lots() {
        let lots = vec![lot("L1", "A", date(2024, 8, 1), 10, dec!(1.00))];
        let sales = vec![sale("s1", "A", date(2024, 7, 2), 10)];

        let guarded = allocate("t1", Uuid::new_v4(), &lots, &sales, true).unwrap();
        assert!(guarded.attributions.is_empty());
        assert!(guarded
            .validation_records
            .iter()
            .any(|r| r.kind == ValidationKind::DateInversion));

        let unguarded = allocate("t1", Uuid::new_v4(), &lots, &sales, false).unwrap();
        assert_eq!(unguarded.attributions.len(), 1);
        assert!(unguarded.validation_records.is_empty());
    }
}
