//! Load-cycle reporting.
//!
//! Every staged order line the fact load leaves behind is attributed to
//! exactly one skip reason. The classification here mirrors the SQL CASE
//! used by the diagnostics query, so the buckets always sum to the number
//! of skipped rows.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
#[error("{0} is not a valid skip reason")]
pub struct ParseSkipReasonError(String);

/// Why a staged order line was not loaded into the fact table.
/// Listed in the order the classification checks them; a row failing
/// several checks lands in the first bucket that matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    MissingTimeDim,
    MissingClientDim,
    MissingProductDim,
    DuplicateNaturalKey,
    MissingExchangeRate,
}

impl SkipReason {
    pub const ALL: [SkipReason; 5] = [
        SkipReason::MissingTimeDim,
        SkipReason::MissingClientDim,
        SkipReason::MissingProductDim,
        SkipReason::DuplicateNaturalKey,
        SkipReason::MissingExchangeRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingTimeDim => "missing_time_dim",
            SkipReason::MissingClientDim => "missing_client_dim",
            SkipReason::MissingProductDim => "missing_product_dim",
            SkipReason::DuplicateNaturalKey => "duplicate_natural_key",
            SkipReason::MissingExchangeRate => "missing_exchange_rate",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SkipReason {
    type Err = ParseSkipReasonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing_time_dim" => Ok(SkipReason::MissingTimeDim),
            "missing_client_dim" => Ok(SkipReason::MissingClientDim),
            "missing_product_dim" => Ok(SkipReason::MissingProductDim),
            "duplicate_natural_key" => Ok(SkipReason::DuplicateNaturalKey),
            "missing_exchange_rate" => Ok(SkipReason::MissingExchangeRate),
            invalid => Err(ParseSkipReasonError(invalid.to_owned())),
        }
    }
}

/// Join outcomes for one staged line, as seen by the fact load.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineChecks {
    pub has_time_dim: bool,
    pub has_client_dim: bool,
    pub has_product_dim: bool,
    pub already_loaded: bool,
    pub has_exchange_rate: bool,
}

/// Attributes a skipped line to its first failing check. Returns `None`
/// when every check passes, meaning the line was loadable.
pub fn classify(checks: LineChecks) -> Option<SkipReason> {
    if !checks.has_time_dim {
        return Some(SkipReason::MissingTimeDim);
    }
    if !checks.has_client_dim {
        return Some(SkipReason::MissingClientDim);
    }
    if !checks.has_product_dim {
        return Some(SkipReason::MissingProductDim);
    }
    if checks.already_loaded {
        return Some(SkipReason::DuplicateNaturalKey);
    }
    if !checks.has_exchange_rate {
        return Some(SkipReason::MissingExchangeRate);
    }
    None
}

/// Inserted and skipped counts for one load step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub inserted: u64,
    pub skipped: u64,
}

/// Everything one load cycle did, for logging and for callers that want
/// to verify counts in tests.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub started_at: Option<DateTime<Utc>>,
    pub watermark: Option<DateTime<Utc>>,
    pub dim_time_days_added: u64,
    pub rates_synced: u64,
    pub dim_clients: StepCounts,
    pub dim_products: StepCounts,
    pub facts_inserted: u64,
    pub facts_by_source: HashMap<String, u64>,
    pub skips: HashMap<SkipReason, u64>,
    pub rate_coverage_pct: f64,
}

impl LoadReport {
    pub fn facts_skipped(&self) -> u64 {
        self.skips.values().sum()
    }

    pub fn log(&self) {
        info!(
            dim_time_days = self.dim_time_days_added,
            rates = self.rates_synced,
            clients_inserted = self.dim_clients.inserted,
            products_inserted = self.dim_products.inserted,
            facts = self.facts_inserted,
            rate_coverage_pct = self.rate_coverage_pct,
            "load cycle complete"
        );
        for (source, count) in &self.facts_by_source {
            info!(source = source.as_str(), count = *count, "facts loaded by source");
        }
        for reason in SkipReason::ALL {
            if let Some(count) = self.skips.get(&reason).filter(|count| **count > 0) {
                warn!(reason = reason.as_str(), count = *count, "fact rows skipped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loadable() -> LineChecks {
        LineChecks {
            has_time_dim: true,
            has_client_dim: true,
            has_product_dim: true,
            already_loaded: false,
            has_exchange_rate: true,
        }
    }

    #[test]
    fn loadable_line_has_no_reason() {
        assert_eq!(classify(loadable()), None);
    }

    #[test]
    fn first_failing_check_wins() {
        let mut checks = loadable();
        checks.has_time_dim = false;
        checks.has_exchange_rate = false;
        assert_eq!(classify(checks), Some(SkipReason::MissingTimeDim));

        let mut checks = loadable();
        checks.has_product_dim = false;
        checks.already_loaded = true;
        assert_eq!(classify(checks), Some(SkipReason::MissingProductDim));
    }

    #[test]
    fn duplicate_outranks_missing_rate() {
        let mut checks = loadable();
        checks.already_loaded = true;
        checks.has_exchange_rate = false;
        assert_eq!(classify(checks), Some(SkipReason::DuplicateNaturalKey));
    }

    #[test]
    fn skip_reason_round_trips_through_str() {
        for reason in SkipReason::ALL {
            assert_eq!(reason.as_str().parse::<SkipReason>().unwrap(), reason);
        }
        assert!("bogus".parse::<SkipReason>().is_err());
    }

    #[test]
    fn skipped_total_sums_buckets() {
        let mut report = LoadReport::default();
        report.skips.insert(SkipReason::MissingClientDim, 3);
        report.skips.insert(SkipReason::MissingExchangeRate, 2);
        assert_eq!(report.facts_skipped(), 5);
    }
}
