use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use metrics::counter;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info, warn};

use etl_common::cancel::CancelToken;

use crate::report::{LoadReport, SkipReason, StepCounts};

/// Advisory lock key for the load cycle. One loader at a time; a second
/// process attempting a cycle fails fast instead of queueing.
const LOAD_LOCK_KEY: i64 = 0x45544c_4c4f4144;

/// A fresh warehouse has no facts; the watermark falls back to a date
/// older than any source row.
const EPOCH_WATERMARK: &str = "1900-01-01 00:00:00+00";

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("another load cycle is already running")]
    ConcurrentRun,
    #[error("interrupted by shutdown request")]
    Interrupted,
    #[error("warehouse reset requires confirmation with 'YES', got {0:?}")]
    ResetNotConfirmed(String),
}

pub type LoadResult<T> = Result<T, LoadError>;

/// Incremental loader from the `stg` schema into the `dw` star schema.
/// A cycle runs dimension steps before facts so the fact joins always see
/// the dimensions this cycle produced.
pub struct WarehouseLoader {
    pool: PgPool,
}

impl WarehouseLoader {
    pub fn new(url: &str) -> LoadResult<Self> {
        let pool = PgPoolOptions::new()
            .connect_lazy(url)
            .map_err(|error| LoadError::ConnectionError { error })?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run one load cycle. Returns `Ok(None)` when the gate decides there
    /// is nothing to do. The whole cycle holds an advisory lock; a cycle
    /// already in flight elsewhere yields `ConcurrentRun`.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn run_cycle(
        &self,
        force: bool,
        cancel: &CancelToken,
    ) -> LoadResult<Option<LoadReport>> {
        // The lock lives on this connection; dropping it releases the lock
        // even if a step fails mid-cycle.
        let mut lock_conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| LoadError::ConnectionError { error })?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(LOAD_LOCK_KEY)
            .fetch_one(&mut *lock_conn)
            .await
            .map_err(|error| LoadError::QueryError {
                command: "ADVISORY_LOCK".to_owned(),
                error,
            })?;
        if !locked {
            return Err(LoadError::ConcurrentRun);
        }

        let result = self.run_cycle_locked(force, cancel).await;

        if let Err(error) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(LOAD_LOCK_KEY)
            .execute(&mut *lock_conn)
            .await
        {
            warn!(%error, "failed to release load lock, connection will be dropped");
        }
        result
    }

    async fn run_cycle_locked(
        &self,
        force: bool,
        cancel: &CancelToken,
    ) -> LoadResult<Option<LoadReport>> {
        let started_at = Utc::now();
        let watermark = self.last_load_ts().await?;

        if !self.should_run(force, watermark, started_at).await? {
            info!(%watermark, "load gate closed, nothing new and last cycle is recent");
            return Ok(None);
        }

        let mut report = LoadReport {
            started_at: Some(started_at),
            watermark: Some(watermark),
            ..LoadReport::default()
        };

        report.dim_time_days_added = self.ensure_dim_time().await?;
        self.check_cancel(cancel)?;

        report.rates_synced = self.sync_exchange_rates().await?;
        self.check_cancel(cancel)?;

        report.dim_clients = self.load_dim_client().await?;
        self.check_cancel(cancel)?;

        report.dim_products = self.load_dim_product(watermark).await?;
        self.check_cancel(cancel)?;

        report.facts_by_source = self.load_fact_sales().await?;
        report.facts_inserted = report.facts_by_source.values().sum();
        for (source, count) in &report.facts_by_source {
            counter!("etl_warehouse_facts_inserted", "source" => source.clone())
                .increment(*count);
        }
        self.check_cancel(cancel)?;

        report.skips = self.skip_diagnostics(watermark, started_at).await?;
        for (reason, count) in &report.skips {
            counter!("etl_warehouse_facts_skipped", "reason" => reason.as_str())
                .increment(*count);
        }
        report.rate_coverage_pct = self.exchange_rate_coverage().await?;

        report.log();
        Ok(Some(report))
    }

    fn check_cancel(&self, cancel: &CancelToken) -> LoadResult<()> {
        if cancel.is_cancelled() {
            return Err(LoadError::Interrupted);
        }
        Ok(())
    }

    /// Watermark of the last completed cycle, or an epoch value for a
    /// fresh warehouse.
    pub async fn last_load_ts(&self) -> LoadResult<DateTime<Utc>> {
        sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(load_ts), '{EPOCH_WATERMARK}'::timestamptz) FROM dw.fact_sales"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|error| LoadError::QueryError {
            command: "LAST_LOAD_TS".to_owned(),
            error,
        })
    }

    /// The gate opens when any staging table has rows newer than its
    /// target's watermark or the last fact load is older than a day.
    /// `force` bypasses it.
    async fn should_run(
        &self,
        force: bool,
        watermark: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LoadResult<bool> {
        if force {
            return Ok(true);
        }
        if now - watermark >= Duration::hours(24) {
            return Ok(true);
        }
        let new_rows: bool = sqlx::query_scalar(GATE_NEW_ROWS)
            .bind(watermark)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| LoadError::QueryError {
                command: "GATE_NEW_ROWS".to_owned(),
                error,
            })?;
        Ok(new_rows)
    }

    /// Materialize the calendar for the trailing three-year window ending
    /// today. Existing days are left alone.
    async fn ensure_dim_time(&self) -> LoadResult<u64> {
        let (from, to) = dim_time_window(Utc::now().date_naive());
        let result = sqlx::query(ENSURE_DIM_TIME)
            .bind(from)
            .bind(to)
            .execute(&self.pool)
            .await
            .map_err(|error| LoadError::QueryError {
                command: "ENSURE_DIM_TIME".to_owned(),
                error,
            })?;
        let added = result.rows_affected();
        if added > 0 {
            debug!(days = added, "calendar extended");
        }
        Ok(added)
    }

    /// Copy staged CRC/USD rates onto their calendar day. Several quotes
    /// for one day collapse to the highest, matching how corrections are
    /// staged (the corrected quote overwrites upward).
    async fn sync_exchange_rates(&self) -> LoadResult<u64> {
        let result = sqlx::query(SYNC_EXCHANGE_RATES)
            .execute(&self.pool)
            .await
            .map_err(|error| LoadError::QueryError {
                command: "SYNC_EXCHANGE_RATES".to_owned(),
                error,
            })?;
        Ok(result.rows_affected())
    }

    /// One dimension row per (source_system, source_key). A client whose
    /// registration day has no calendar row yet is left in staging and
    /// retried next cycle; inserting it with a NULL link would fix the
    /// natural key and the link could never be repaired.
    ///
    /// Full scan with NOT EXISTS rather than a watermark cut: a client
    /// skipped on an earlier cycle must be retried once its calendar day
    /// materializes.
    async fn load_dim_client(&self) -> LoadResult<StepCounts> {
        let result = sqlx::query(LOAD_DIM_CLIENT)
            .execute(&self.pool)
            .await
            .map_err(|error| LoadError::QueryError {
                command: "LOAD_DIM_CLIENT".to_owned(),
                error,
            })?;
        let staged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stg.clients")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| LoadError::QueryError {
                command: "COUNT_STAGED_CLIENTS".to_owned(),
                error,
            })?;
        let inserted = result.rows_affected();
        Ok(StepCounts {
            inserted,
            skipped: (staged as u64).saturating_sub(inserted),
        })
    }

    /// One dimension row per SKU. When several sources claim the same SKU
    /// the highest-priority source supplies the descriptive fields and the
    /// rest are counted as skipped. A (source, code) already present is
    /// never re-inserted, even when a later resolution gave it a new SKU.
    async fn load_dim_product(&self, watermark: DateTime<Utc>) -> LoadResult<StepCounts> {
        let result = sqlx::query(LOAD_DIM_PRODUCT)
            .execute(&self.pool)
            .await
            .map_err(|error| LoadError::QueryError {
                command: "LOAD_DIM_PRODUCT".to_owned(),
                error,
            })?;
        let shadowed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM stg.product_map m \
             JOIN dw.dim_product d ON d.sku = m.sku \
             WHERE (d.source_system <> m.source_system OR d.source_key <> m.source_code) \
               AND m.load_ts > $1",
        )
        .bind(watermark)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| LoadError::QueryError {
            command: "COUNT_SHADOWED_PRODUCTS".to_owned(),
            error,
        })?;
        Ok(StepCounts {
            inserted: result.rows_affected(),
            skipped: shadowed as u64,
        })
    }

    /// Set-based fact insert. A line must land on all three dimensions and,
    /// when priced in CRC, on a day with a synced rate; everything else is
    /// left in staging for the diagnostics pass to explain.
    ///
    /// Full scan with NOT EXISTS rather than a watermark cut: a CRC line
    /// excluded for a missing rate must load once the rate lands, and its
    /// staging load_ts is by then older than the watermark.
    async fn load_fact_sales(
        &self,
    ) -> LoadResult<std::collections::HashMap<String, u64>> {
        let rows = sqlx::query(LOAD_FACT_SALES)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| LoadError::QueryError {
                command: "LOAD_FACT_SALES".to_owned(),
                error,
            })?;
        let mut by_source = std::collections::HashMap::new();
        for row in &rows {
            *by_source
                .entry(row.get::<String, _>("source_system"))
                .or_insert(0u64) += 1;
        }
        Ok(by_source)
    }

    /// Attribute every staged line newer than the watermark that did not
    /// load this cycle to exactly one reason. The CASE order matches
    /// `report::classify`.
    async fn skip_diagnostics(
        &self,
        watermark: DateTime<Utc>,
        cycle_started: DateTime<Utc>,
    ) -> LoadResult<std::collections::HashMap<SkipReason, u64>> {
        let rows = sqlx::query(SKIP_DIAGNOSTICS)
            .bind(watermark)
            .bind(cycle_started)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| LoadError::QueryError {
                command: "SKIP_DIAGNOSTICS".to_owned(),
                error,
            })?;
        let mut skips = std::collections::HashMap::new();
        for row in &rows {
            let reason: SkipReason = row
                .get::<String, _>("reason")
                .parse()
                .map_err(|_| LoadError::QueryError {
                    command: "SKIP_DIAGNOSTICS".to_owned(),
                    error: sqlx::Error::RowNotFound,
                })?;
            skips.insert(reason, row.get::<i64, _>("skipped") as u64);
        }
        Ok(skips)
    }

    /// Share of CRC order days that have a synced rate. 100 when no CRC
    /// lines are staged.
    async fn exchange_rate_coverage(&self) -> LoadResult<f64> {
        let coverage: Option<f64> = sqlx::query_scalar(RATE_COVERAGE)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| LoadError::QueryError {
                command: "RATE_COVERAGE".to_owned(),
                error,
            })?;
        Ok(coverage.unwrap_or(100.0))
    }
}

/// The load-cycle entry point as a seam, so orchestration can be tested
/// without a warehouse behind it.
#[async_trait]
pub trait LoadRunner: Send + Sync {
    async fn run_cycle(
        &self,
        force: bool,
        cancel: &CancelToken,
    ) -> LoadResult<Option<LoadReport>>;
}

#[async_trait]
impl LoadRunner for WarehouseLoader {
    async fn run_cycle(
        &self,
        force: bool,
        cancel: &CancelToken,
    ) -> LoadResult<Option<LoadReport>> {
        WarehouseLoader::run_cycle(self, force, cancel).await
    }
}

/// Empty the star schema and derived analytics. Dimension keys restart so
/// a reload produces a clean key space. Refuses to run without the literal
/// confirmation "YES".
pub async fn reset_warehouse(pool: &PgPool, confirm: &str) -> LoadResult<()> {
    if confirm != "YES" {
        return Err(LoadError::ResetNotConfirmed(confirm.to_owned()));
    }
    sqlx::query(
        "TRUNCATE dw.fact_sales, dw.dim_client, dw.dim_product, dw.dim_time, \
         analytics.association_rules RESTART IDENTITY CASCADE",
    )
    .execute(pool)
    .await
    .map_err(|error| LoadError::QueryError {
        command: "TRUNCATE_WAREHOUSE".to_owned(),
        error,
    })?;
    info!("warehouse truncated");
    Ok(())
}

/// Calendar coverage: one row per day from three years back through today.
fn dim_time_window(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    (today - Months::new(36), today)
}

const GATE_NEW_ROWS: &str = r#"
SELECT EXISTS(SELECT 1 FROM stg.order_lines WHERE load_ts > $1)
    OR EXISTS(
        SELECT 1 FROM stg.clients
        WHERE load_ts > (SELECT COALESCE(MAX(load_ts), '1900-01-01'::timestamptz)
                         FROM dw.dim_client))
    OR EXISTS(
        SELECT 1 FROM stg.product_map
        WHERE load_ts > (SELECT COALESCE(MAX(load_ts), '1900-01-01'::timestamptz)
                         FROM dw.dim_product))
"#;

const ENSURE_DIM_TIME: &str = r#"
INSERT INTO dw.dim_time (time_id, date_day, year, month, day)
SELECT
    TO_CHAR(d, 'YYYYMMDD')::INT,
    d::date,
    EXTRACT(YEAR FROM d)::INT,
    EXTRACT(MONTH FROM d)::INT,
    EXTRACT(DAY FROM d)::INT
FROM generate_series($1::date, $2::date, interval '1 day') AS d
ON CONFLICT (date_day) DO NOTHING
"#;

const SYNC_EXCHANGE_RATES: &str = r#"
UPDATE dw.dim_time t SET
    crc_usd_rate = COALESCE(r.crc_usd, t.crc_usd_rate),
    usd_crc_rate = COALESCE(r.usd_crc, t.usd_crc_rate)
FROM (
    SELECT
        rate_date,
        MAX(rate) FILTER (WHERE from_currency = 'CRC' AND to_currency = 'USD') AS crc_usd,
        MAX(rate) FILTER (WHERE from_currency = 'USD' AND to_currency = 'CRC') AS usd_crc
    FROM stg.exchange_rates
    GROUP BY rate_date
) r
WHERE t.date_day = r.rate_date
  AND (t.crc_usd_rate IS DISTINCT FROM r.crc_usd
       OR t.usd_crc_rate IS DISTINCT FROM r.usd_crc)
"#;

const LOAD_DIM_CLIENT: &str = r#"
INSERT INTO dw.dim_client
    (source_system, source_key, email, name, gender, country, created_time_id)
SELECT
    c.source_system,
    c.source_code,
    c.email,
    c.name,
    c.gender,
    c.country,
    t.time_id
FROM stg.clients c
JOIN dw.dim_time t ON t.date_day = c.created_date
WHERE NOT EXISTS (
    SELECT 1 FROM dw.dim_client d
    WHERE d.source_system = c.source_system AND d.source_key = c.source_code
)
"#;

const LOAD_DIM_PRODUCT: &str = r#"
INSERT INTO dw.dim_product (sku, name, category, is_service, source_system, source_key)
SELECT DISTINCT ON (m.sku)
    m.sku, m.name, m.category, m.is_service, m.source_system, m.source_code
FROM stg.product_map m
WHERE NOT EXISTS (
    SELECT 1 FROM dw.dim_product d
    WHERE d.source_system = m.source_system AND d.source_key = m.source_code
)
ORDER BY m.sku,
    CASE m.source_system
        WHEN 'mssql' THEN 0
        WHEN 'supabase' THEN 1
        WHEN 'mongo' THEN 2
        WHEN 'neo4j' THEN 3
        ELSE 4
    END
ON CONFLICT (sku) DO NOTHING
"#;

const LOAD_FACT_SALES: &str = r#"
INSERT INTO dw.fact_sales
    (time_id, client_key, product_key, source_system, source_order_key,
     source_line_key, channel, currency, quantity, unit_price, total,
     unit_price_usd, total_usd)
SELECT
    t.time_id,
    c.client_key,
    p.product_key,
    l.source_system,
    l.order_key,
    l.line_key,
    l.channel,
    l.currency,
    l.quantity,
    l.unit_price,
    l.total,
    CASE WHEN l.currency = 'CRC' THEN l.unit_price * t.crc_usd_rate ELSE l.unit_price END,
    CASE WHEN l.currency = 'CRC' THEN l.total * t.crc_usd_rate ELSE l.total END
FROM stg.order_lines l
JOIN dw.dim_time t ON t.date_day = l.order_date
JOIN dw.dim_client c
    ON c.source_system = l.source_system AND c.source_key = l.client_key
JOIN stg.product_map m
    ON m.source_system = l.source_system AND m.source_code = l.product_code
JOIN dw.dim_product p ON p.sku = m.sku
WHERE (l.currency <> 'CRC' OR t.crc_usd_rate IS NOT NULL)
  AND NOT EXISTS (
    SELECT 1 FROM dw.fact_sales f
    WHERE f.source_system = l.source_system
      AND f.source_order_key = l.order_key
      AND f.source_line_key = l.line_key
  )
RETURNING source_system
"#;

const SKIP_DIAGNOSTICS: &str = r#"
SELECT reason, COUNT(*) AS skipped
FROM (
    SELECT CASE
        WHEN t.time_id IS NULL THEN 'missing_time_dim'
        WHEN c.client_key IS NULL THEN 'missing_client_dim'
        WHEN p.product_key IS NULL THEN 'missing_product_dim'
        WHEN f.load_ts IS NOT NULL AND f.load_ts < $2 THEN 'duplicate_natural_key'
        WHEN f.load_ts IS NULL AND l.currency = 'CRC' AND t.crc_usd_rate IS NULL
            THEN 'missing_exchange_rate'
        ELSE NULL
    END AS reason
    FROM stg.order_lines l
    LEFT JOIN dw.dim_time t ON t.date_day = l.order_date
    LEFT JOIN dw.dim_client c
        ON c.source_system = l.source_system AND c.source_key = l.client_key
    LEFT JOIN stg.product_map m
        ON m.source_system = l.source_system AND m.source_code = l.product_code
    LEFT JOIN dw.dim_product p ON p.sku = m.sku
    LEFT JOIN dw.fact_sales f
        ON f.source_system = l.source_system
       AND f.source_order_key = l.order_key
       AND f.source_line_key = l.line_key
    WHERE l.load_ts > $1
) buckets
WHERE reason IS NOT NULL
GROUP BY reason
"#;

const RATE_COVERAGE: &str = r#"
SELECT (100.0 * COUNT(*) FILTER (WHERE t.crc_usd_rate IS NOT NULL) / NULLIF(COUNT(*), 0))::FLOAT8
FROM (
    SELECT DISTINCT order_date FROM stg.order_lines WHERE currency = 'CRC'
) crc_days
LEFT JOIN dw.dim_time t ON t.date_day = crc_days.order_date
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calendar_window_trails_three_years_from_today() {
        let (from, to) = dim_time_window(NaiveDate::from_ymd_opt(2026, 8, 30).unwrap());
        assert_eq!(from, NaiveDate::from_ymd_opt(2023, 8, 30).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2026, 8, 30).unwrap());
        // A day late in the first trailing year is inside the window.
        let in_window = NaiveDate::from_ymd_opt(2023, 10, 1).unwrap();
        assert!(from <= in_window && in_window <= to);
    }

    // The tests below pin statement shapes whose semantics cannot drift
    // without breaking incremental recovery.

    #[test]
    fn dim_client_insert_requires_the_calendar_day() {
        // An outer join here would insert the client with a NULL time link
        // and its natural key could never be repaired.
        assert!(!LOAD_DIM_CLIENT.contains("LEFT JOIN dw.dim_time"));
        assert!(LOAD_DIM_CLIENT.contains("JOIN dw.dim_time t ON t.date_day = c.created_date"));
    }

    #[test]
    fn rate_sync_never_overwrites_a_present_rate_with_null() {
        assert!(SYNC_EXCHANGE_RATES.contains("COALESCE(r.crc_usd, t.crc_usd_rate)"));
        assert!(SYNC_EXCHANGE_RATES.contains("COALESCE(r.usd_crc, t.usd_crc_rate)"));
    }

    #[test]
    fn dim_product_insert_skips_known_source_codes() {
        // Without this predicate a re-resolved (source, code) collides with
        // the source-key constraint and aborts the cycle.
        assert!(LOAD_DIM_PRODUCT
            .contains("WHERE d.source_system = m.source_system AND d.source_key = m.source_code"));
    }

    #[test]
    fn gate_watches_every_staging_table() {
        assert!(GATE_NEW_ROWS.contains("stg.order_lines"));
        assert!(GATE_NEW_ROWS.contains("stg.clients"));
        assert!(GATE_NEW_ROWS.contains("stg.product_map"));
    }
}
