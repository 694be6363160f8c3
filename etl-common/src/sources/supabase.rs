//! Supabase (managed Postgres) source, extracted over its REST API.
//!
//! Heterogeneities: the SKU may be empty (services) or in the compact
//! `SKU0000` form, dates are ISO-8601 strings with or without an offset,
//! gender mixes single letters with already-spelled values, and countries
//! arrive as free-text names that are mapped to ISO-2 codes where known.

use std::collections::HashMap;

use serde::Deserialize;

use crate::normalize::{
    country_code, normalize_channel, normalize_gender, normalize_sku, parse_date,
};
use crate::records::{BatchSummary, ProductSourceRecord, StagingClient, StagingOrderLine};
use crate::source::SourceSystem;

#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseClient {
    #[serde(rename = "cliente_id")]
    pub client_id: i64,
    #[serde(rename = "nombre")]
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(rename = "genero")]
    pub gender: Option<String>,
    #[serde(rename = "pais")]
    pub country: Option<String>,
    #[serde(rename = "fecha_registro")]
    pub registered_raw: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseProduct {
    #[serde(rename = "producto_id")]
    pub product_id: i64,
    pub sku: Option<String>,
    #[serde(rename = "nombre")]
    pub name: Option<String>,
    #[serde(rename = "categoria")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseOrder {
    #[serde(rename = "orden_id")]
    pub order_id: i64,
    #[serde(rename = "cliente_id")]
    pub client_id: i64,
    #[serde(rename = "fecha")]
    pub date_raw: Option<String>,
    #[serde(rename = "canal")]
    pub channel: Option<String>,
    #[serde(rename = "moneda")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseOrderLine {
    #[serde(rename = "orden_id")]
    pub order_id: i64,
    #[serde(rename = "producto_id")]
    pub product_id: i64,
    #[serde(rename = "cantidad")]
    pub quantity: Option<f64>,
    #[serde(rename = "precio_unitario")]
    pub unit_price: Option<f64>,
}

/// An empty SKU marks a service row; the source code falls back to the
/// product id so order lines can still be joined.
pub fn product_records(products: &[SupabaseProduct]) -> Vec<ProductSourceRecord> {
    products
        .iter()
        .map(|p| {
            let sku = p
                .sku
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(normalize_sku);
            ProductSourceRecord {
                source: SourceSystem::Supabase,
                source_code: match &sku {
                    Some(sku) => sku.clone(),
                    None => p.product_id.to_string(),
                },
                is_service: sku.is_none(),
                sku,
                name: p.name.clone().unwrap_or_default(),
                category: p.category.clone().unwrap_or_default(),
            }
        })
        .collect()
}

pub fn normalize_clients(clients: &[SupabaseClient]) -> (Vec<StagingClient>, BatchSummary) {
    let mut summary = BatchSummary::default();
    let rows = clients
        .iter()
        .map(|c| {
            summary.processed += 1;
            summary.staged += 1;
            let created_date = match c.registered_raw.as_deref() {
                Some(raw) => match parse_date(raw) {
                    Ok(date) => Some(date),
                    Err(_) => {
                        summary.field_parse_failures += 1;
                        None
                    }
                },
                None => None,
            };
            let country = c.country.as_deref().map(|name| {
                country_code(name)
                    .map(str::to_owned)
                    .unwrap_or_else(|| name.to_owned())
            });
            StagingClient {
                source_system: SourceSystem::Supabase,
                source_code: c.client_id.to_string(),
                email: c.email.clone(),
                name: c.name.clone(),
                gender_raw: c.gender.clone(),
                gender: normalize_gender(c.gender.as_deref()),
                country,
                created_raw: c.registered_raw.clone(),
                created_date,
            }
        })
        .collect();
    (rows, summary)
}

/// Lines reference products by id; the staged product code is the product's
/// normalized SKU. A line pointing at a product with no SKU (a service row
/// keyed by id) uses the id-based code so the join still lands.
pub fn normalize_order_lines(
    orders: &[SupabaseOrder],
    lines: &[SupabaseOrderLine],
    products: &[SupabaseProduct],
) -> (Vec<StagingOrderLine>, BatchSummary) {
    let mut summary = BatchSummary::default();
    let by_order: HashMap<i64, &SupabaseOrder> = orders.iter().map(|o| (o.order_id, o)).collect();
    let codes: HashMap<i64, String> = product_records(products)
        .into_iter()
        .zip(products)
        .map(|(record, p)| (p.product_id, record.source_code))
        .collect();

    let mut rows = Vec::with_capacity(lines.len());
    for line in lines {
        summary.processed += 1;
        let Some(order) = by_order.get(&line.order_id) else {
            summary.skipped_missing_key += 1;
            continue;
        };
        let Some(product_code) = codes.get(&line.product_id) else {
            summary.skipped_missing_key += 1;
            continue;
        };
        let date_raw = order.date_raw.clone().unwrap_or_default();
        let Ok(order_date) = parse_date(&date_raw) else {
            summary.skipped_parse += 1;
            continue;
        };
        let (Some(quantity), Some(unit_price)) = (line.quantity, line.unit_price) else {
            summary.skipped_parse += 1;
            continue;
        };
        if quantity <= 0.0 {
            summary.skipped_parse += 1;
            continue;
        }
        let total = quantity * unit_price;

        rows.push(StagingOrderLine {
            source_system: SourceSystem::Supabase,
            order_key: order.order_id.to_string(),
            line_key: line.product_id.to_string(),
            product_code: product_code.clone(),
            client_key: order.client_id.to_string(),
            date_raw,
            channel: normalize_channel(order.channel.as_deref()),
            currency: order.currency.clone().unwrap_or_else(|| "USD".to_owned()),
            quantity_raw: quantity.to_string(),
            unit_price_raw: unit_price.to_string(),
            total_raw: total.to_string(),
            order_date,
            quantity,
            unit_price,
            total,
        });
        summary.staged += 1;
    }
    (rows, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn product(id: i64, sku: Option<&str>) -> SupabaseProduct {
        SupabaseProduct {
            product_id: id,
            sku: sku.map(str::to_owned),
            name: Some("Wireless Mouse".to_owned()),
            category: Some("Electronics".to_owned()),
        }
    }

    #[test]
    fn compact_sku_form_is_normalized() {
        let records = product_records(&[product(31, Some("SKU0031"))]);
        assert_eq!(records[0].sku.as_deref(), Some("SKU-0031"));
        assert_eq!(records[0].source_code, "SKU-0031");
        assert!(!records[0].is_service);
    }

    #[test]
    fn empty_sku_marks_a_service_keyed_by_product_id() {
        let records = product_records(&[product(31, None), product(32, Some(""))]);
        assert!(records.iter().all(|r| r.is_service && r.sku.is_none()));
        assert_eq!(records[0].source_code, "31");
        assert_eq!(records[1].source_code, "32");
    }

    #[test]
    fn iso_offset_dates_parse_and_countries_map() {
        let clients = [SupabaseClient {
            client_id: 5,
            name: Some("Luis".to_owned()),
            email: Some("luis@example.com".to_owned()),
            gender: Some("M".to_owned()),
            country: Some("Costa Rica".to_owned()),
            registered_raw: Some("2025-10-31T13:20:00-06:00".to_owned()),
        }];
        let (rows, _) = normalize_clients(&clients);
        assert_eq!(rows[0].country.as_deref(), Some("CR"));
        assert_eq!(
            rows[0].created_date,
            Some(NaiveDate::from_ymd_opt(2025, 10, 31).unwrap())
        );
    }

    #[test]
    fn unknown_country_passes_through() {
        let clients = [SupabaseClient {
            client_id: 5,
            name: None,
            email: None,
            gender: None,
            country: Some("Atlantis".to_owned()),
            registered_raw: None,
        }];
        let (rows, _) = normalize_clients(&clients);
        assert_eq!(rows[0].country.as_deref(), Some("Atlantis"));
    }

    #[test]
    fn nonpositive_quantity_is_skipped() {
        let orders = [SupabaseOrder {
            order_id: 1,
            client_id: 2,
            date_raw: Some("2025-06-01".to_owned()),
            channel: None,
            currency: None,
        }];
        let lines = [SupabaseOrderLine {
            order_id: 1,
            product_id: 31,
            quantity: Some(0.0),
            unit_price: Some(10.0),
        }];
        let (rows, summary) =
            normalize_order_lines(&orders, &lines, &[product(31, Some("SKU-0031"))]);
        assert!(rows.is_empty());
        assert_eq!(summary.skipped_parse, 1);
    }
}
