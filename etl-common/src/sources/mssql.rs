//! MSSQL `DB_SALES`: the canonical relational source.
//!
//! Heterogeneities: gender already arrives as `Masculino`/`Femenino`,
//! currency is always USD, dates are native datetimes, and products carry
//! the official SKU. Order lines may carry a percentage discount that must
//! be applied to the line total.

use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::normalize::{normalize_channel, normalize_gender};
use crate::records::{BatchSummary, ProductSourceRecord, StagingClient, StagingOrderLine};
use crate::source::SourceSystem;

#[derive(Debug, Clone)]
pub struct MssqlClient {
    pub client_id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub gender: Option<String>,
    pub country: Option<String>,
    pub registered_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct MssqlProduct {
    pub product_id: i64,
    pub sku: Option<String>,
    pub name: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MssqlOrder {
    pub order_id: i64,
    pub client_id: i64,
    pub ordered_at: NaiveDateTime,
    pub channel: Option<String>,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct MssqlOrderLine {
    pub line_id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: f64,
    pub unit_price: f64,
    pub discount_pct: Option<f64>,
}

pub fn product_records(products: &[MssqlProduct]) -> Vec<ProductSourceRecord> {
    products
        .iter()
        .map(|p| ProductSourceRecord {
            source: SourceSystem::Mssql,
            source_code: p.product_id.to_string(),
            sku: p.sku.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned),
            name: p.name.clone().unwrap_or_default(),
            category: p.category.clone().unwrap_or_default(),
            is_service: false,
        })
        .collect()
}

pub fn normalize_clients(clients: &[MssqlClient]) -> (Vec<StagingClient>, BatchSummary) {
    let mut summary = BatchSummary::default();
    let rows = clients
        .iter()
        .map(|c| {
            summary.processed += 1;
            summary.staged += 1;
            StagingClient {
                source_system: SourceSystem::Mssql,
                source_code: c.client_id.to_string(),
                email: c.email.clone(),
                name: c.name.clone(),
                gender_raw: c.gender.clone(),
                gender: normalize_gender(c.gender.as_deref()),
                country: c.country.clone(),
                created_raw: c.registered_at.map(|d| d.to_string()),
                created_date: c.registered_at.map(|d| d.date()),
            }
        })
        .collect();
    (rows, summary)
}

pub fn normalize_order_lines(
    orders: &[MssqlOrder],
    lines: &[MssqlOrderLine],
) -> (Vec<StagingOrderLine>, BatchSummary) {
    let mut summary = BatchSummary::default();
    let by_order: HashMap<i64, &MssqlOrder> = orders.iter().map(|o| (o.order_id, o)).collect();

    let mut rows = Vec::with_capacity(lines.len());
    for line in lines {
        summary.processed += 1;
        let Some(order) = by_order.get(&line.order_id) else {
            summary.skipped_missing_key += 1;
            continue;
        };

        let discount_pct = line.discount_pct.unwrap_or(0.0);
        let total = line.quantity * line.unit_price * (1.0 - discount_pct / 100.0);

        rows.push(StagingOrderLine {
            source_system: SourceSystem::Mssql,
            order_key: order.order_id.to_string(),
            line_key: line.line_id.to_string(),
            product_code: line.product_id.to_string(),
            client_key: order.client_id.to_string(),
            date_raw: order.ordered_at.to_string(),
            channel: normalize_channel(order.channel.as_deref()),
            currency: order.currency.clone(),
            quantity_raw: line.quantity.to_string(),
            unit_price_raw: line.unit_price.to_string(),
            total_raw: total.to_string(),
            order_date: order.ordered_at.date(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            total,
        });
        summary.staged += 1;
    }
    (rows, summary)
}
