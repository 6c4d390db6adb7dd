#![allow(dead_code)]

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use cogs_rs::config::EngineConfig;
use cogs_rs::domain::{PurchaseLot, Sale};
use cogs_rs::store::MemoryStore;
use cogs_rs::CogsEngine;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn lot(
    tenant: &str,
    id: &str,
    sku: &str,
    received: NaiveDate,
    quantity: i64,
    unit_price: Decimal,
    freight: Decimal,
) -> PurchaseLot {
    PurchaseLot {
        tenant_id: tenant.to_string(),
        lot_id: id.to_string(),
        sku: sku.to_string(),
        received_date: received,
        original_quantity: quantity,
        remaining_quantity: quantity,
        unit_price,
        freight_cost_per_unit: freight,
    }
}

pub fn sale(tenant: &str, id: &str, sku: &str, day: NaiveDate, quantity: i64) -> Sale {
    Sale {
        tenant_id: tenant.to_string(),
        sale_id: id.to_string(),
        sku: sku.to_string(),
        sale_date: day,
        quantity,
    }
}

/// Engine over a fresh in-memory store; the store handle is returned too so
/// tests can inspect journal rows the caller API does not expose.
pub fn engine() -> (CogsEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = CogsEngine::new(store.clone(), EngineConfig::default());
    (engine, store)
}
