//! MongoDB source documents.
//!
//! Heterogeneities: orders embed their line items as an array, product
//! documents carry an `equivalencias` sub-document linking back to other
//! systems, gender includes an explicit "Otro" value, and timestamps are
//! native BSON datetimes already deserialized as UTC instants.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::normalize::{normalize_channel, normalize_gender, normalize_sku};
use crate::records::{BatchSummary, ProductSourceRecord, StagingClient, StagingOrderLine};
use crate::source::SourceSystem;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MongoEquivalences {
    pub sku: Option<String>,
    #[serde(rename = "codigo_alt")]
    pub alt_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoProduct {
    #[serde(rename = "codigo_mongo")]
    pub mongo_code: String,
    #[serde(rename = "nombre")]
    pub name: Option<String>,
    #[serde(rename = "categoria")]
    pub category: Option<String>,
    #[serde(rename = "equivalencias", default)]
    pub equivalences: MongoEquivalences,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoClient {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "nombre")]
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(rename = "genero")]
    pub gender: Option<String>,
    #[serde(rename = "pais")]
    pub country: Option<String>,
    #[serde(rename = "creado")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoOrderItem {
    #[serde(rename = "producto_id")]
    pub product_id: String,
    #[serde(rename = "cantidad")]
    pub quantity: f64,
    #[serde(rename = "precio_unit")]
    pub unit_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoOrder {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "cliente_id")]
    pub client_id: String,
    #[serde(rename = "fecha")]
    pub date: Option<DateTime<Utc>>,
    #[serde(rename = "canal")]
    pub channel: Option<String>,
    #[serde(rename = "moneda")]
    pub currency: Option<String>,
    #[serde(rename = "items", default)]
    pub items: Vec<MongoOrderItem>,
}

pub fn product_records(products: &[MongoProduct]) -> Vec<ProductSourceRecord> {
    products
        .iter()
        .map(|p| {
            let sku = p
                .equivalences
                .sku
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(normalize_sku);
            ProductSourceRecord {
                source: SourceSystem::Mongo,
                source_code: p.mongo_code.clone(),
                is_service: sku.is_none() && p.equivalences.alt_code.is_none(),
                sku,
                name: p.name.clone().unwrap_or_default(),
                category: p.category.clone().unwrap_or_default(),
            }
        })
        .collect()
}

pub fn normalize_clients(clients: &[MongoClient]) -> (Vec<StagingClient>, BatchSummary) {
    let mut summary = BatchSummary::default();
    let rows = clients
        .iter()
        .map(|c| {
            summary.processed += 1;
            summary.staged += 1;
            StagingClient {
                source_system: SourceSystem::Mongo,
                source_code: c.id.clone(),
                email: c.email.clone(),
                name: c.name.clone(),
                gender_raw: c.gender.clone(),
                gender: normalize_gender(c.gender.as_deref()),
                country: c.country.clone(),
                created_raw: c.created_at.map(|t| t.to_rfc3339()),
                created_date: c.created_at.map(|t| t.date_naive()),
            }
        })
        .collect();
    (rows, summary)
}

/// Flattens each order's embedded item array into one staged line per item.
/// The line key is the item's product id, so an order cannot carry the same
/// product twice; the source guarantees that shape.
pub fn normalize_order_lines(
    orders: &[MongoOrder],
    products: &[MongoProduct],
) -> (Vec<StagingOrderLine>, BatchSummary) {
    let mut summary = BatchSummary::default();
    let known: HashSet<&str> = products.iter().map(|p| p.mongo_code.as_str()).collect();

    let mut rows = Vec::new();
    for order in orders {
        let Some(date) = order.date else {
            summary.processed += order.items.len() as u64;
            summary.skipped_parse += order.items.len() as u64;
            continue;
        };
        for item in &order.items {
            summary.processed += 1;
            if !known.contains(item.product_id.as_str()) {
                summary.skipped_missing_key += 1;
                continue;
            }
            if item.quantity <= 0.0 {
                summary.skipped_parse += 1;
                continue;
            }
            let total = item.quantity * item.unit_price;
            rows.push(StagingOrderLine {
                source_system: SourceSystem::Mongo,
                order_key: order.id.clone(),
                line_key: item.product_id.clone(),
                product_code: item.product_id.clone(),
                client_key: order.client_id.clone(),
                date_raw: date.to_rfc3339(),
                channel: normalize_channel(order.channel.as_deref()),
                currency: order.currency.clone().unwrap_or_else(|| "USD".to_owned()),
                quantity_raw: item.quantity.to_string(),
                unit_price_raw: item.unit_price.to_string(),
                total_raw: total.to_string(),
                order_date: date.date_naive(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                total,
            });
            summary.staged += 1;
        }
    }
    (rows, summary)
}
