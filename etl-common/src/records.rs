use chrono::NaiveDate;

use crate::normalize::Gender;
use crate::source::SourceSystem;

/// One product as seen by one source, after normalization of its native
/// shape. Consumed once by the equivalence resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductSourceRecord {
    pub source: SourceSystem,
    /// The code this source uses to reference the product in its own order
    /// lines (SKU, alternate code, document code or graph code).
    pub source_code: String,
    /// A SKU this source claims for the product, if it carries one.
    pub sku: Option<String>,
    pub name: String,
    pub category: String,
    pub is_service: bool,
}

/// A client row bound for `stg.clients`. Upserted by
/// (source_system, source_code); later writes coalesce missing fields and
/// never overwrite a present value with null.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingClient {
    pub source_system: SourceSystem,
    pub source_code: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub gender_raw: Option<String>,
    pub gender: Gender,
    pub country: Option<String>,
    pub created_raw: Option<String>,
    /// None when the source date was absent or unparseable; the warehouse
    /// loader skips such clients until a date materializes, never defaults.
    pub created_date: Option<NaiveDate>,
}

/// The durable, queryable form of the equivalence resolver's output: one row
/// per (source, source code) carrying the authoritative SKU.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingProductMap {
    pub source_system: SourceSystem,
    pub source_code: String,
    pub sku: String,
    pub name: String,
    pub category: String,
    pub is_service: bool,
}

/// One order line bound for `stg.order_lines`. Insert-only, keyed by
/// (source_system, order_key, line_key); duplicates on rerun are no-ops.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingOrderLine {
    pub source_system: SourceSystem,
    pub order_key: String,
    pub line_key: String,
    /// References the product in this source's own code space; joined to
    /// `stg.product_map.source_code` downstream.
    pub product_code: String,
    pub client_key: String,
    pub date_raw: String,
    pub channel: String,
    pub currency: String,
    pub quantity_raw: String,
    pub unit_price_raw: String,
    pub total_raw: String,
    pub order_date: NaiveDate,
    pub quantity: f64,
    pub unit_price: f64,
    pub total: f64,
}

/// Outcome counts for one normalization batch. Parse and key failures are
/// recovered locally (record skipped, counted) and never abort the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Records seen.
    pub processed: u64,
    /// Records emitted for staging.
    pub staged: u64,
    /// Records dropped because a critical field would not parse.
    pub skipped_parse: u64,
    /// Records dropped because no usable natural key could be formed.
    pub skipped_missing_key: u64,
    /// Records staged with a non-critical field left null after a parse
    /// failure (e.g. a client's creation date).
    pub field_parse_failures: u64,
}

impl BatchSummary {
    pub fn merge(&mut self, other: &BatchSummary) {
        self.processed += other.processed;
        self.staged += other.staged;
        self.skipped_parse += other.skipped_parse;
        self.skipped_missing_key += other.skipped_missing_key;
        self.field_parse_failures += other.field_parse_failures;
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_parse + self.skipped_missing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_all_counters() {
        let mut left = BatchSummary {
            processed: 10,
            staged: 8,
            skipped_parse: 1,
            skipped_missing_key: 1,
            field_parse_failures: 2,
        };
        let right = BatchSummary {
            processed: 5,
            staged: 5,
            ..Default::default()
        };
        left.merge(&right);
        assert_eq!(left.processed, 15);
        assert_eq!(left.staged, 13);
        assert_eq!(left.skipped(), 2);
        assert_eq!(left.field_parse_failures, 2);
    }
}
