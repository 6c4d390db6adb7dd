//! Golden allocation scenarios over the pure allocator: single-lot and
//! multi-lot FIFO spans, shortfalls, returns, and determinism.

mod common;

use common::{date, lot, sale};

use rust_decimal_macros::dec;
use uuid::Uuid;

use cogs_rs::domain::{MovementKind, ValidationKind};
use cogs_rs::services::allocator::allocate;

const TENANT: &str = "t1";

#[test]
fn test_single_lot_allocation() {
    // One 100-unit lot at 10.00 + 1.00 freight; a 30-unit sale.
    let lots = vec![lot(
        TENANT,
        "L1",
        "A",
        date(2024, 7, 1),
        100,
        dec!(10.00),
        dec!(1.00),
    )];
    let sales = vec![sale(TENANT, "s1", "A", date(2024, 7, 15), 30)];

    let outcome = allocate(TENANT, Uuid::new_v4(), &lots, &sales, true).unwrap();

    assert_eq!(outcome.attributions.len(), 1);
    let attribution = &outcome.attributions[0];
    assert_eq!(attribution.quantity_sold, 30);
    assert_eq!(attribution.total_cogs, dec!(330.00));
    assert_eq!(attribution.average_unit_cost, dec!(11.0000));
    assert!(attribution.is_valid);

    assert_eq!(attribution.details.len(), 1);
    let detail = &attribution.details[0];
    assert_eq!(detail.lot_id, "L1");
    assert_eq!(detail.quantity_allocated, 30);
    assert_eq!(detail.unit_cost, dec!(11.00));
    assert_eq!(detail.total_cost, dec!(330.00));

    assert_eq!(outcome.movements.len(), 1);
    let movement = &outcome.movements[0];
    assert_eq!(movement.kind, MovementKind::Sale);
    assert_eq!(movement.quantity, -30);
    assert_eq!(movement.remaining_after, 70);
    assert_eq!(movement.reference_id.as_deref(), Some("s1"));

    assert_eq!(outcome.lots[0].remaining_quantity, 70);
    assert!(outcome.validation_records.is_empty());
    assert_eq!(outcome.total_cogs, dec!(330.00));
}

#[test]
fn test_multi_lot_fifo_spanning() {
    // 50 units at 11.00 effective, then 100 at 13.00; an 80-unit sale takes
    // all of the older lot and 30 from the newer one.
    let lots = vec![
        lot(TENANT, "L1", "A", date(2024, 7, 1), 50, dec!(10.00), dec!(1.00)),
        lot(TENANT, "L2", "A", date(2024, 7, 10), 100, dec!(12.00), dec!(1.00)),
    ];
    let sales = vec![sale(TENANT, "s1", "A", date(2024, 7, 20), 80)];

    let outcome = allocate(TENANT, Uuid::new_v4(), &lots, &sales, true).unwrap();

    let attribution = &outcome.attributions[0];
    assert_eq!(attribution.quantity_sold, 80);
    assert_eq!(attribution.total_cogs, dec!(940.00));
    assert_eq!(attribution.average_unit_cost, dec!(11.7500));

    let details: Vec<(&str, i64, rust_decimal::Decimal, rust_decimal::Decimal)> = attribution
        .details
        .iter()
        .map(|d| (d.lot_id.as_str(), d.quantity_allocated, d.unit_cost, d.total_cost))
        .collect();
    assert_eq!(
        details,
        vec![
            ("L1", 50, dec!(11.00), dec!(550.00)),
            ("L2", 30, dec!(13.00), dec!(390.00)),
        ]
    );

    let movements: Vec<(&str, i64, i64)> = outcome
        .movements
        .iter()
        .map(|m| (m.lot_id.as_str(), m.quantity, m.remaining_after))
        .collect();
    assert_eq!(movements, vec![("L1", -50, 0), ("L2", -30, 70)]);

    assert_eq!(outcome.lots[0].remaining_quantity, 0);
    assert_eq!(outcome.lots[1].remaining_quantity, 70);
}

#[test]
fn test_exact_lot_consumption_does_not_touch_next_lot() {
    let lots = vec![
        lot(TENANT, "L1", "A", date(2024, 7, 1), 50, dec!(10.00), dec!(0.00)),
        lot(TENANT, "L2", "A", date(2024, 7, 10), 100, dec!(12.00), dec!(0.00)),
    ];
    let sales = vec![sale(TENANT, "s1", "A", date(2024, 7, 20), 50)];

    let outcome = allocate(TENANT, Uuid::new_v4(), &lots, &sales, true).unwrap();

    let attribution = &outcome.attributions[0];
    assert_eq!(attribution.details.len(), 1);
    assert_eq!(outcome.movements.len(), 1);
    assert_eq!(outcome.lots[0].remaining_quantity, 0);
    assert_eq!(outcome.lots[1].remaining_quantity, 100);
}

#[test]
fn test_one_unit_past_lot_boundary_spans_two_lots() {
    let lots = vec![
        lot(TENANT, "L1", "A", date(2024, 7, 1), 50, dec!(10.00), dec!(0.00)),
        lot(TENANT, "L2", "A", date(2024, 7, 10), 100, dec!(12.00), dec!(0.00)),
    ];
    let sales = vec![sale(TENANT, "s1", "A", date(2024, 7, 20), 51)];

    let outcome = allocate(TENANT, Uuid::new_v4(), &lots, &sales, true).unwrap();

    let attribution = &outcome.attributions[0];
    assert_eq!(attribution.details.len(), 2);
    assert_eq!(attribution.details[1].quantity_allocated, 1);
    assert_eq!(outcome.lots[0].remaining_quantity, 0);
    assert_eq!(outcome.lots[1].remaining_quantity, 99);
}

#[test]
fn test_insufficient_inventory_partial_allocation() {
    let lots = vec![lot(
        TENANT,
        "L1",
        "B",
        date(2024, 6, 1),
        10,
        dec!(5.00),
        dec!(0.00),
    )];
    let sales = vec![sale(TENANT, "s1", "B", date(2024, 7, 1), 25)];

    let outcome = allocate(TENANT, Uuid::new_v4(), &lots, &sales, true).unwrap();

    let attribution = &outcome.attributions[0];
    assert!(!attribution.is_valid);
    assert_eq!(attribution.quantity_sold, 25);
    assert_eq!(attribution.total_cogs, dec!(50.00));
    assert_eq!(attribution.details.len(), 1);
    assert_eq!(attribution.details[0].quantity_allocated, 10);

    assert_eq!(outcome.validation_records.len(), 1);
    let record = &outcome.validation_records[0];
    assert_eq!(record.kind, ValidationKind::InsufficientInventory);
    assert_eq!(record.sale_id.as_deref(), Some("s1"));
    assert_eq!(record.quantity, Some(15));

    assert_eq!(outcome.lots[0].remaining_quantity, 0);
}

#[test]
fn test_return_restores_newest_consumed_first() {
    // Post-S2 inventory: L1 exhausted, L2 at 70 of 100. A 20-unit return
    // reconstitutes the newest consumed lot (L2), not L1.
    let mut l1 = lot(TENANT, "L1", "A", date(2024, 7, 1), 50, dec!(10.00), dec!(1.00));
    l1.remaining_quantity = 0;
    let mut l2 = lot(TENANT, "L2", "A", date(2024, 7, 10), 100, dec!(12.00), dec!(1.00));
    l2.remaining_quantity = 70;

    let sales = vec![sale(TENANT, "s2", "A", date(2024, 7, 25), -20)];

    let outcome = allocate(TENANT, Uuid::new_v4(), &[l1, l2], &sales, true).unwrap();

    assert_eq!(outcome.movements.len(), 1);
    let movement = &outcome.movements[0];
    assert_eq!(movement.lot_id, "L2");
    assert_eq!(movement.kind, MovementKind::Return);
    assert_eq!(movement.quantity, 20);
    assert_eq!(movement.remaining_after, 90);

    assert_eq!(outcome.lots[0].remaining_quantity, 0);
    assert_eq!(outcome.lots[1].remaining_quantity, 90);

    // The period reflects the negative COGS of 20 x 13.00.
    assert_eq!(outcome.summaries.len(), 1);
    let summary = &outcome.summaries[0];
    assert_eq!(summary.period, "2024-07");
    assert_eq!(summary.total_quantity_sold, -20);
    assert_eq!(summary.total_cogs, dec!(-260.00));
}

#[test]
fn test_return_spans_lots_newest_first_when_capacity_is_split() {
    let mut l1 = lot(TENANT, "L1", "A", date(2024, 7, 1), 50, dec!(10.00), dec!(0.00));
    l1.remaining_quantity = 40; // 10 consumed
    let mut l2 = lot(TENANT, "L2", "A", date(2024, 7, 10), 100, dec!(12.00), dec!(0.00));
    l2.remaining_quantity = 85; // 15 consumed

    let sales = vec![sale(TENANT, "s1", "A", date(2024, 7, 25), -20)];

    let outcome = allocate(TENANT, Uuid::new_v4(), &[l1, l2], &sales, true).unwrap();

    // L2 takes its full 15 back first, the remaining 5 land on L1.
    let movements: Vec<(&str, i64, i64)> = outcome
        .movements
        .iter()
        .map(|m| (m.lot_id.as_str(), m.quantity, m.remaining_after))
        .collect();
    assert_eq!(movements, vec![("L2", 15, 100), ("L1", 5, 45)]);
    assert!(outcome.validation_records.is_empty());
}

#[test]
fn test_return_against_unconsumed_sku_is_an_over_return() {
    // Full lot, nothing consumed: nothing to restore.
    let lots = vec![lot(
        TENANT,
        "L1",
        "A",
        date(2024, 7, 1),
        50,
        dec!(10.00),
        dec!(0.00),
    )];
    let sales = vec![sale(TENANT, "s1", "A", date(2024, 7, 25), -5)];

    let outcome = allocate(TENANT, Uuid::new_v4(), &lots, &sales, true).unwrap();

    assert!(outcome.movements.is_empty());
    assert!(outcome.attributions.is_empty());
    assert_eq!(outcome.validation_records.len(), 1);
    assert_eq!(outcome.validation_records[0].kind, ValidationKind::OverReturn);
}

#[test]
fn test_over_return_restores_only_capacity() {
    let mut l1 = lot(TENANT, "L1", "A", date(2024, 7, 1), 50, dec!(10.00), dec!(0.00));
    l1.remaining_quantity = 45; // 5 consumed

    let sales = vec![sale(TENANT, "s1", "A", date(2024, 7, 25), -8)];

    let outcome = allocate(TENANT, Uuid::new_v4(), &[l1], &sales, true).unwrap();

    assert_eq!(outcome.lots[0].remaining_quantity, 50);
    assert_eq!(outcome.movements.len(), 1);
    assert_eq!(outcome.movements[0].quantity, 5);

    let record = &outcome.validation_records[0];
    assert_eq!(record.kind, ValidationKind::OverReturn);
    assert_eq!(record.quantity, Some(3));

    // The attribution reflects what was actually restored.
    assert_eq!(outcome.attributions[0].quantity_sold, -5);
}

#[test]
fn test_sale_for_unknown_sku_records_a_finding() {
    let lots = vec![lot(
        TENANT,
        "L1",
        "A",
        date(2024, 7, 1),
        50,
        dec!(10.00),
        dec!(0.00),
    )];
    let sales = vec![sale(TENANT, "s1", "ZZZ", date(2024, 7, 25), 5)];

    let outcome = allocate(TENANT, Uuid::new_v4(), &lots, &sales, true).unwrap();

    assert!(outcome.attributions.is_empty());
    assert!(outcome.movements.is_empty());
    assert_eq!(outcome.validation_records.len(), 1);
    assert_eq!(outcome.validation_records[0].kind, ValidationKind::UnknownSku);
}

#[test]
fn test_attribution_totals_telescope_from_details() {
    let lots = vec![
        lot(TENANT, "L1", "A", date(2024, 7, 1), 7, dec!(3.25), dec!(0.50)),
        lot(TENANT, "L2", "A", date(2024, 7, 3), 11, dec!(4.10), dec!(0.25)),
        lot(TENANT, "L3", "A", date(2024, 7, 5), 13, dec!(2.95), dec!(1.05)),
    ];
    let sales = vec![
        sale(TENANT, "s1", "A", date(2024, 7, 10), 9),
        sale(TENANT, "s2", "A", date(2024, 7, 12), 14),
    ];

    let outcome = allocate(TENANT, Uuid::new_v4(), &lots, &sales, true).unwrap();

    for attribution in &outcome.attributions {
        let detail_total: rust_decimal::Decimal =
            attribution.details.iter().map(|d| d.total_cost).sum();
        assert_eq!(attribution.total_cogs, detail_total.round_dp(2));
        if attribution.is_valid {
            let allocated: i64 = attribution.details.iter().map(|d| d.quantity_allocated).sum();
            assert_eq!(allocated, attribution.quantity_sold);
        }
    }
}

#[test]
fn test_summaries_group_by_sku_and_month() {
    let lots = vec![
        lot(TENANT, "L1", "A", date(2024, 6, 1), 100, dec!(10.00), dec!(0.00)),
        lot(TENANT, "L2", "B", date(2024, 6, 1), 100, dec!(4.00), dec!(0.00)),
    ];
    let sales = vec![
        sale(TENANT, "s1", "A", date(2024, 7, 5), 10),
        sale(TENANT, "s2", "A", date(2024, 7, 20), 5),
        sale(TENANT, "s3", "A", date(2024, 8, 2), 5),
        sale(TENANT, "s4", "B", date(2024, 7, 9), 8),
    ];

    let outcome = allocate(TENANT, Uuid::new_v4(), &lots, &sales, true).unwrap();

    let rows: Vec<(&str, &str, i64, rust_decimal::Decimal)> = outcome
        .summaries
        .iter()
        .map(|s| (s.sku.as_str(), s.period.as_str(), s.total_quantity_sold, s.total_cogs))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("A", "2024-07", 15, dec!(150.00)),
            ("A", "2024-08", 5, dec!(50.00)),
            ("B", "2024-07", 8, dec!(32.00)),
        ]
    );
}

#[test]
fn test_identical_inputs_allocate_identically() {
    let lots = vec![
        lot(TENANT, "L1", "A", date(2024, 7, 1), 40, dec!(10.00), dec!(1.00)),
        lot(TENANT, "L2", "A", date(2024, 7, 2), 60, dec!(12.00), dec!(0.50)),
        lot(TENANT, "L3", "B", date(2024, 7, 3), 25, dec!(7.77), dec!(0.00)),
    ];
    let sales = vec![
        sale(TENANT, "s1", "A", date(2024, 7, 10), 55),
        sale(TENANT, "s2", "B", date(2024, 7, 11), 30),
        sale(TENANT, "s3", "A", date(2024, 7, 12), -10),
    ];

    let run_id = Uuid::new_v4();
    let first = allocate(TENANT, run_id, &lots, &sales, true).unwrap();
    let second = allocate(TENANT, run_id, &lots, &sales, true).unwrap();

    // Identical modulo generated ids and timestamps.
    let shape = |outcome: &cogs_rs::services::allocator::AllocationOutcome| {
        let attributions: Vec<_> = outcome
            .attributions
            .iter()
            .map(|a| {
                (
                    a.sale_id.clone(),
                    a.quantity_sold,
                    a.total_cogs,
                    a.average_unit_cost,
                    a.is_valid,
                    a.details
                        .iter()
                        .map(|d| (d.lot_id.clone(), d.quantity_allocated, d.total_cost))
                        .collect::<Vec<_>>(),
                )
            })
            .collect();
        let movements: Vec<_> = outcome
            .movements
            .iter()
            .map(|m| (m.lot_id.clone(), m.kind, m.quantity, m.remaining_after))
            .collect();
        let summaries: Vec<_> = outcome
            .summaries
            .iter()
            .map(|s| (s.sku.clone(), s.period.clone(), s.total_quantity_sold, s.total_cogs))
            .collect();
        (attributions, movements, summaries, outcome.total_cogs)
    };
    assert_eq!(shape(&first), shape(&second));
}
