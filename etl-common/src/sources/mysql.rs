//! MySQL `DB_SALES`: everything arrives as text.
//!
//! Heterogeneities: gender is the enum `M`/`F`/`X`, dates and amounts are
//! varchar in several formats, the sale channel is free text, currency may
//! be USD or CRC, and products are identified by an alternate code with no
//! SKU anywhere.

use std::collections::HashMap;

use crate::normalize::{normalize_channel, normalize_gender, parse_amount, parse_date};
use crate::records::{BatchSummary, ProductSourceRecord, StagingClient, StagingOrderLine};
use crate::source::SourceSystem;

#[derive(Debug, Clone)]
pub struct MysqlClient {
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub gender: Option<String>,
    pub country: Option<String>,
    pub created_raw: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MysqlProduct {
    pub id: i64,
    pub alt_code: String,
    pub name: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MysqlOrder {
    pub id: i64,
    pub client_id: i64,
    pub date_raw: Option<String>,
    pub channel: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MysqlOrderLine {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity_raw: Option<String>,
    pub unit_price_raw: Option<String>,
}

pub fn product_records(products: &[MysqlProduct]) -> Vec<ProductSourceRecord> {
    products
        .iter()
        .map(|p| ProductSourceRecord {
            source: SourceSystem::Mysql,
            source_code: p.alt_code.clone(),
            sku: None,
            name: p.name.clone().unwrap_or_default(),
            category: p.category.clone().unwrap_or_default(),
            is_service: false,
        })
        .collect()
}

pub fn normalize_clients(clients: &[MysqlClient]) -> (Vec<StagingClient>, BatchSummary) {
    let mut summary = BatchSummary::default();
    let rows = clients
        .iter()
        .map(|c| {
            summary.processed += 1;
            summary.staged += 1;
            let created_date = match c.created_raw.as_deref() {
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
                source_system: SourceSystem::Mysql,
                source_code: c.id.to_string(),
                email: c.email.clone(),
                name: c.name.clone(),
                gender_raw: c.gender.clone(),
                gender: normalize_gender(c.gender.as_deref()),
                country: c.country.clone(),
                created_raw: c.created_raw.clone(),
                created_date,
            }
        })
        .collect();
    (rows, summary)
}

/// Order lines reference products by numeric id; the staging product code is
/// the alternate code, resolved through the extracted product list.
pub fn normalize_order_lines(
    orders: &[MysqlOrder],
    lines: &[MysqlOrderLine],
    products: &[MysqlProduct],
) -> (Vec<StagingOrderLine>, BatchSummary) {
    let mut summary = BatchSummary::default();
    let by_order: HashMap<i64, &MysqlOrder> = orders.iter().map(|o| (o.id, o)).collect();
    let alt_codes: HashMap<i64, &str> =
        products.iter().map(|p| (p.id, p.alt_code.as_str())).collect();

    let mut rows = Vec::with_capacity(lines.len());
    for line in lines {
        summary.processed += 1;
        let Some(order) = by_order.get(&line.order_id) else {
            summary.skipped_missing_key += 1;
            continue;
        };

        let date_raw = order.date_raw.clone().unwrap_or_default();
        let Ok(order_date) = parse_date(&date_raw) else {
            summary.skipped_parse += 1;
            continue;
        };
        let quantity_raw = line.quantity_raw.clone().unwrap_or_default();
        let unit_price_raw = line.unit_price_raw.clone().unwrap_or_default();
        let (Ok(quantity), Ok(unit_price)) =
            (parse_amount(&quantity_raw), parse_amount(&unit_price_raw))
        else {
            summary.skipped_parse += 1;
            continue;
        };

        let product_code = alt_codes
            .get(&line.product_id)
            .map(|c| (*c).to_owned())
            .unwrap_or_else(|| format!("PROD-{}", line.product_id));
        let total = quantity * unit_price;

        rows.push(StagingOrderLine {
            source_system: SourceSystem::Mysql,
            order_key: order.id.to_string(),
            line_key: line.id.to_string(),
            product_code,
            client_key: order.client_id.to_string(),
            date_raw,
            channel: normalize_channel(order.channel.as_deref()),
            currency: order.currency.clone().unwrap_or_else(|| "USD".to_owned()),
            quantity_raw,
            unit_price_raw,
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
    use crate::normalize::Gender;
    use chrono::NaiveDate;

    fn order(date_raw: &str) -> MysqlOrder {
        MysqlOrder {
            id: 1,
            client_id: 2,
            date_raw: Some(date_raw.to_owned()),
            channel: Some("online".to_owned()),
            currency: Some("CRC".to_owned()),
        }
    }

    fn line() -> MysqlOrderLine {
        MysqlOrderLine {
            id: 10,
            order_id: 1,
            product_id: 7,
            quantity_raw: Some("2".to_owned()),
            unit_price_raw: Some("1,200.50".to_owned()),
        }
    }

    fn product() -> MysqlProduct {
        MysqlProduct {
            id: 7,
            alt_code: "ALT-AB12".to_owned(),
            name: Some("Televisor LED 32".to_owned()),
            category: Some("Electrónica".to_owned()),
        }
    }

    #[test]
    fn varchar_dates_and_amounts_are_parsed() {
        let (rows, summary) =
            normalize_order_lines(&[order("2025-06-01 10:30:00")], &[line()], &[product()]);
        assert_eq!(summary.staged, 1);
        let row = &rows[0];
        assert_eq!(row.order_date, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        assert_eq!(row.unit_price, 1200.50);
        assert_eq!(row.total, 2401.0);
        assert_eq!(row.product_code, "ALT-AB12");
        assert_eq!(row.channel, "WEB");
        assert_eq!(row.currency, "CRC");
    }

    #[test]
    fn unparseable_order_date_skips_the_line() {
        let (rows, summary) = normalize_order_lines(&[order("mañana")], &[line()], &[product()]);
        assert!(rows.is_empty());
        assert_eq!(summary.skipped_parse, 1);
    }

    #[test]
    fn unknown_product_id_falls_back_to_a_synthetic_code() {
        let (rows, _) = normalize_order_lines(&[order("2025-06-01")], &[line()], &[]);
        assert_eq!(rows[0].product_code, "PROD-7");
    }

    #[test]
    fn enum_genders_map_to_canonical_values() {
        let clients = [
            MysqlClient {
                id: 1,
                name: None,
                email: None,
                gender: Some("X".to_owned()),
                country: None,
                created_raw: Some("2024-01-15".to_owned()),
            },
            MysqlClient {
                id: 2,
                name: None,
                email: None,
                gender: Some("F".to_owned()),
                country: None,
                created_raw: Some("not a date".to_owned()),
            },
        ];
        let (rows, summary) = normalize_clients(&clients);
        assert_eq!(rows[0].gender, Gender::Unspecified);
        assert_eq!(rows[1].gender, Gender::Female);
        // A bad creation date stages the client anyway, date left null.
        assert_eq!(rows[1].created_date, None);
        assert_eq!(summary.field_parse_failures, 1);
    }
}
