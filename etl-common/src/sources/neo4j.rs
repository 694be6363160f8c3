//! Neo4j graph source.
//!
//! Heterogeneities: products and clients are nodes, orders hang off a
//! `PLACED` relationship and lines off an `ORDER_PRODUCT` relationship
//! whose properties carry quantity and unit price. Product nodes may key
//! themselves by SKU, an alternate code, a mongo code, or a bare node id,
//! in that order of usefulness.

use std::collections::HashMap;

use serde::Deserialize;

use crate::normalize::{normalize_channel, normalize_gender, normalize_sku, parse_date};
use crate::records::{BatchSummary, ProductSourceRecord, StagingClient, StagingOrderLine};
use crate::source::SourceSystem;

#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jProduct {
    pub id: Option<String>,
    pub sku: Option<String>,
    #[serde(rename = "codigo_alt")]
    pub alt_code: Option<String>,
    #[serde(rename = "codigo_mongo")]
    pub mongo_code: Option<String>,
    #[serde(rename = "nombre")]
    pub name: Option<String>,
    #[serde(rename = "categoria")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jClient {
    pub id: String,
    #[serde(rename = "nombre")]
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(rename = "genero")]
    pub gender: Option<String>,
    #[serde(rename = "pais")]
    pub country: Option<String>,
    #[serde(rename = "registrado")]
    pub registered_raw: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jOrder {
    pub id: String,
    #[serde(rename = "fecha")]
    pub date_raw: Option<String>,
    #[serde(rename = "canal")]
    pub channel: Option<String>,
    #[serde(rename = "moneda")]
    pub currency: Option<String>,
}

/// A `(client)-[:PLACED]->(order)` pair.
#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jPlacedOrder {
    pub client_id: String,
    pub order: Neo4jOrder,
}

/// An `(order)-[:ORDER_PRODUCT]->(product)` edge with its properties.
#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jOrderProduct {
    pub order_id: String,
    pub product: Neo4jProduct,
    #[serde(rename = "cantidad")]
    pub quantity: Option<f64>,
    #[serde(rename = "precio_unit")]
    pub unit_price: Option<f64>,
}

fn node_code(p: &Neo4jProduct) -> Option<String> {
    if let Some(sku) = p.sku.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return Some(normalize_sku(sku));
    }
    for candidate in [&p.alt_code, &p.mongo_code, &p.id] {
        if let Some(code) = candidate.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return Some(code.to_owned());
        }
    }
    None
}

pub fn product_records(products: &[Neo4jProduct]) -> Vec<ProductSourceRecord> {
    products
        .iter()
        .filter_map(|p| {
            let source_code = node_code(p)?;
            let sku = p
                .sku
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(normalize_sku);
            Some(ProductSourceRecord {
                source: SourceSystem::Neo4j,
                source_code,
                is_service: sku.is_none() && p.alt_code.is_none() && p.mongo_code.is_none(),
                sku,
                name: p.name.clone().unwrap_or_default(),
                category: p.category.clone().unwrap_or_default(),
            })
        })
        .collect()
}

pub fn normalize_clients(clients: &[Neo4jClient]) -> (Vec<StagingClient>, BatchSummary) {
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
            StagingClient {
                source_system: SourceSystem::Neo4j,
                source_code: c.id.clone(),
                email: c.email.clone(),
                name: c.name.clone(),
                gender_raw: c.gender.clone(),
                gender: normalize_gender(c.gender.as_deref()),
                country: c.country.clone(),
                created_raw: c.registered_raw.clone(),
                created_date,
            }
        })
        .collect();
    (rows, summary)
}

/// Joins `ORDER_PRODUCT` edges to their `PLACED` order. Edges pointing at an
/// unknown order, carrying a keyless product node, or missing a parseable
/// date or positive quantity are skipped and counted.
pub fn normalize_order_lines(
    placed: &[Neo4jPlacedOrder],
    edges: &[Neo4jOrderProduct],
) -> (Vec<StagingOrderLine>, BatchSummary) {
    let mut summary = BatchSummary::default();
    let by_order: HashMap<&str, &Neo4jPlacedOrder> =
        placed.iter().map(|p| (p.order.id.as_str(), p)).collect();

    let mut rows = Vec::with_capacity(edges.len());
    for edge in edges {
        summary.processed += 1;
        let Some(placed) = by_order.get(edge.order_id.as_str()) else {
            summary.skipped_missing_key += 1;
            continue;
        };
        let Some(product_code) = node_code(&edge.product) else {
            summary.skipped_missing_key += 1;
            continue;
        };
        let date_raw = placed.order.date_raw.clone().unwrap_or_default();
        let Ok(order_date) = parse_date(&date_raw) else {
            summary.skipped_parse += 1;
            continue;
        };
        let (Some(quantity), Some(unit_price)) = (edge.quantity, edge.unit_price) else {
            summary.skipped_parse += 1;
            continue;
        };
        if quantity <= 0.0 {
            summary.skipped_parse += 1;
            continue;
        }
        let total = quantity * unit_price;

        rows.push(StagingOrderLine {
            source_system: SourceSystem::Neo4j,
            order_key: edge.order_id.clone(),
            line_key: product_code.clone(),
            product_code: product_code.clone(),
            client_key: placed.client_id.clone(),
            date_raw,
            channel: normalize_channel(placed.order.channel.as_deref()),
            currency: placed
                .order
                .currency
                .clone()
                .unwrap_or_else(|| "USD".to_owned()),
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

    fn product(sku: Option<&str>, alt: Option<&str>) -> Neo4jProduct {
        Neo4jProduct {
            id: Some("n-9".to_owned()),
            sku: sku.map(str::to_owned),
            alt_code: alt.map(str::to_owned),
            mongo_code: None,
            name: Some("Wireless Mouse".to_owned()),
            category: Some("Electronics".to_owned()),
        }
    }

    fn placed(order_id: &str, date: Option<&str>) -> Neo4jPlacedOrder {
        Neo4jPlacedOrder {
            client_id: "c-1".to_owned(),
            order: Neo4jOrder {
                id: order_id.to_owned(),
                date_raw: date.map(str::to_owned),
                channel: Some("tienda".to_owned()),
                currency: Some("CRC".to_owned()),
            },
        }
    }

    #[test]
    fn node_code_prefers_sku_then_alt_then_mongo_then_id() {
        assert_eq!(
            node_code(&product(Some("SKU0042"), Some("ALT-1"))).as_deref(),
            Some("SKU-0042")
        );
        assert_eq!(
            node_code(&product(None, Some("ALT-1"))).as_deref(),
            Some("ALT-1")
        );
        assert_eq!(node_code(&product(None, None)).as_deref(), Some("n-9"));
    }

    #[test]
    fn edge_joins_to_its_placed_order() {
        let placed = [placed("o-1", Some("2025-06-01"))];
        let edges = [Neo4jOrderProduct {
            order_id: "o-1".to_owned(),
            product: product(Some("SKU-0042"), None),
            quantity: Some(3.0),
            unit_price: Some(4.0),
        }];
        let (rows, summary) = normalize_order_lines(&placed, &edges);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].client_key, "c-1");
        assert_eq!(rows[0].product_code, "SKU-0042");
        assert_eq!(rows[0].channel, "STORE");
        assert_eq!(rows[0].total, 12.0);
        assert_eq!(summary.staged, 1);
    }

    #[test]
    fn unparseable_order_date_skips_the_edge() {
        let placed = [placed("o-1", Some("next tuesday"))];
        let edges = [Neo4jOrderProduct {
            order_id: "o-1".to_owned(),
            product: product(Some("SKU-0042"), None),
            quantity: Some(1.0),
            unit_price: Some(1.0),
        }];
        let (rows, summary) = normalize_order_lines(&placed, &edges);
        assert!(rows.is_empty());
        assert_eq!(summary.skipped_parse, 1);
    }

    #[test]
    fn edge_to_unknown_order_is_counted() {
        let edges = [Neo4jOrderProduct {
            order_id: "o-404".to_owned(),
            product: product(Some("SKU-0042"), None),
            quantity: Some(1.0),
            unit_price: Some(1.0),
        }];
        let (rows, summary) = normalize_order_lines(&[], &edges);
        assert!(rows.is_empty());
        assert_eq!(summary.skipped_missing_key, 1);
    }
}
