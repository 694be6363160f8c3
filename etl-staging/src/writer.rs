use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use metrics::counter;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};

use etl_common::cancel::CancelToken;
use etl_common::normalize::sku_number;
use etl_common::records::{StagingClient, StagingOrderLine, StagingProductMap};
use etl_common::resolve::PersistedSkus;
use etl_common::source::SourceSystem;

/// Enumeration of errors for operations against the staging schema.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("interrupted by shutdown request")]
    Interrupted,
}

pub type StagingResult<T> = Result<T, StagingError>;

/// Row counts per staging table, for operator visibility after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingStats {
    pub clients: i64,
    pub product_maps: i64,
    pub order_lines: i64,
}

impl StagingStats {
    pub fn total(&self) -> i64 {
        self.clients + self.product_maps + self.order_lines
    }
}

/// Writes normalized source rows into the `stg` schema in chunked
/// transactions. A chunk either lands fully or not at all. A graceful stop
/// is honored between chunks so the open chunk still commits; an abort is
/// honored between rows and the open transaction rolls back on drop.
pub struct StagingWriter {
    pool: PgPool,
    batch_size: usize,
}

impl StagingWriter {
    /// Initialize a writer with a lazy pool; no connections are opened
    /// until the first write.
    pub fn new(url: &str, batch_size: usize) -> StagingResult<Self> {
        let pool = PgPoolOptions::new()
            .connect_lazy(url)
            .map_err(|error| StagingError::ConnectionError { error })?;
        Ok(Self { pool, batch_size })
    }

    pub fn with_pool(pool: PgPool, batch_size: usize) -> Self {
        Self { pool, batch_size }
    }

    /// Upsert clients keyed by (source_system, source_code). Re-extracted
    /// rows merge field-wise so a NULL from a later extract never erases a
    /// value captured earlier. `load_ts` keeps its first-insert value.
    pub async fn upsert_clients(
        &self,
        rows: &[StagingClient],
        cancel: &CancelToken,
    ) -> StagingResult<u64> {
        let mut written = 0u64;
        for chunk in rows.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(StagingError::Interrupted);
            }
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|error| StagingError::ConnectionError { error })?;
            for row in chunk {
                if cancel.is_aborted() {
                    return Err(StagingError::Interrupted);
                }
                sqlx::query(UPSERT_CLIENT)
                    .bind(row.source_system.as_str())
                    .bind(&row.source_code)
                    .bind(&row.email)
                    .bind(&row.name)
                    .bind(&row.gender_raw)
                    .bind(row.gender.as_str())
                    .bind(&row.country)
                    .bind(&row.created_raw)
                    .bind(row.created_date)
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| StagingError::QueryError {
                        command: "UPSERT_CLIENT".to_owned(),
                        error,
                    })?;
                written += 1;
            }
            tx.commit()
                .await
                .map_err(|error| StagingError::ConnectionError { error })?;
        }
        counter!("etl_staging_rows_written", "table" => "clients").increment(written);
        debug!(rows = written, "staged clients");
        Ok(written)
    }

    /// Upsert the product equivalence map. Resolution output is
    /// authoritative, so conflicts overwrite rather than merge.
    pub async fn upsert_product_maps(
        &self,
        rows: &[StagingProductMap],
        cancel: &CancelToken,
    ) -> StagingResult<u64> {
        let mut written = 0u64;
        for chunk in rows.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(StagingError::Interrupted);
            }
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|error| StagingError::ConnectionError { error })?;
            for row in chunk {
                if cancel.is_aborted() {
                    return Err(StagingError::Interrupted);
                }
                sqlx::query(UPSERT_PRODUCT_MAP)
                    .bind(row.source_system.as_str())
                    .bind(&row.source_code)
                    .bind(&row.sku)
                    .bind(&row.name)
                    .bind(&row.category)
                    .bind(row.is_service)
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| StagingError::QueryError {
                        command: "UPSERT_PRODUCT_MAP".to_owned(),
                        error,
                    })?;
                written += 1;
            }
            tx.commit()
                .await
                .map_err(|error| StagingError::ConnectionError { error })?;
        }
        counter!("etl_staging_rows_written", "table" => "product_map").increment(written);
        debug!(rows = written, "staged product map");
        Ok(written)
    }

    /// Insert order lines keyed by (source_system, order_key, line_key).
    /// Facts are immutable once staged, so conflicts are left untouched.
    /// Returns the number of rows actually inserted.
    pub async fn insert_order_lines(
        &self,
        rows: &[StagingOrderLine],
        cancel: &CancelToken,
    ) -> StagingResult<u64> {
        let mut inserted = 0u64;
        for chunk in rows.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(StagingError::Interrupted);
            }
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|error| StagingError::ConnectionError { error })?;
            for row in chunk {
                if cancel.is_aborted() {
                    return Err(StagingError::Interrupted);
                }
                let result = sqlx::query(INSERT_ORDER_LINE)
                    .bind(row.source_system.as_str())
                    .bind(&row.order_key)
                    .bind(&row.line_key)
                    .bind(&row.product_code)
                    .bind(&row.client_key)
                    .bind(&row.date_raw)
                    .bind(&row.channel)
                    .bind(&row.currency)
                    .bind(&row.quantity_raw)
                    .bind(&row.unit_price_raw)
                    .bind(&row.total_raw)
                    .bind(row.order_date)
                    .bind(row.quantity)
                    .bind(row.unit_price)
                    .bind(row.total)
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| StagingError::QueryError {
                        command: "INSERT_ORDER_LINE".to_owned(),
                        error,
                    })?;
                inserted += result.rows_affected();
            }
            tx.commit()
                .await
                .map_err(|error| StagingError::ConnectionError { error })?;
        }
        counter!("etl_staging_rows_written", "table" => "order_lines").increment(inserted);
        debug!(rows = inserted, "staged order lines");
        Ok(inserted)
    }

    /// Record a day's exchange rate. Conflicts overwrite, so a corrected
    /// rate for an already-seen day wins.
    pub async fn upsert_exchange_rate(
        &self,
        rate_date: NaiveDate,
        from_currency: &str,
        to_currency: &str,
        rate: f64,
    ) -> StagingResult<()> {
        sqlx::query(UPSERT_EXCHANGE_RATE)
            .bind(rate_date)
            .bind(from_currency)
            .bind(to_currency)
            .bind(rate)
            .execute(&self.pool)
            .await
            .map_err(|error| StagingError::QueryError {
                command: "UPSERT_EXCHANGE_RATE".to_owned(),
                error,
            })?;
        Ok(())
    }

    /// Highest numeric suffix among SKUs already persisted in the map.
    /// New SKU generation seeds from here so codes never regress across runs.
    pub async fn max_persisted_sku_number(&self) -> StagingResult<u32> {
        let rows = sqlx::query("SELECT DISTINCT sku FROM stg.product_map")
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StagingError::QueryError {
                command: "SELECT_SKUS".to_owned(),
                error,
            })?;
        let max = rows
            .iter()
            .filter_map(|row| sku_number(row.get::<String, _>(0).as_str()))
            .max()
            .unwrap_or(0);
        Ok(max)
    }

    /// Name-to-SKU assignments from previous runs, fed back into
    /// resolution so a product keeps its SKU across runs.
    pub async fn persisted_sku_map(&self) -> StagingResult<PersistedSkus> {
        let rows = sqlx::query("SELECT name, category, sku FROM stg.product_map")
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StagingError::QueryError {
                command: "SELECT_PRODUCT_MAP".to_owned(),
                error,
            })?;
        let mut persisted = PersistedSkus::default();
        for row in &rows {
            persisted.insert(
                row.get::<String, _>(0).as_str(),
                row.get::<String, _>(1).as_str(),
                row.get::<String, _>(2),
            );
        }
        Ok(persisted)
    }

    /// Row counts per source system across all staging tables.
    pub async fn stats(&self) -> StagingResult<HashMap<SourceSystem, StagingStats>> {
        let rows = sqlx::query(STAGING_STATS)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StagingError::QueryError {
                command: "STAGING_STATS".to_owned(),
                error,
            })?;
        let mut stats: HashMap<SourceSystem, StagingStats> = HashMap::new();
        for row in &rows {
            let Ok(source) = row.get::<String, _>("source_system").parse::<SourceSystem>() else {
                continue;
            };
            let entry = stats.entry(source).or_default();
            match row.get::<&str, _>("tbl") {
                "clients" => entry.clients = row.get("n"),
                "product_map" => entry.product_maps = row.get("n"),
                _ => entry.order_lines = row.get("n"),
            }
        }
        Ok(stats)
    }

    /// Truncate every staging table. Destructive; callers gate this
    /// behind explicit confirmation.
    pub async fn reset_staging_all(&self) -> StagingResult<()> {
        sqlx::query(
            "TRUNCATE stg.clients, stg.product_map, stg.order_lines, stg.exchange_rates",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| StagingError::QueryError {
            command: "TRUNCATE_STAGING".to_owned(),
            error,
        })?;
        info!("staging tables truncated");
        Ok(())
    }

    /// Delete one source system's rows from every staging table,
    /// leaving the other sources and the exchange rates intact.
    pub async fn reset_staging_source(&self, source: SourceSystem) -> StagingResult<u64> {
        let mut deleted = 0u64;
        for table in ["stg.clients", "stg.product_map", "stg.order_lines"] {
            let result = sqlx::query(&format!(
                "DELETE FROM {table} WHERE source_system = $1"
            ))
            .bind(source.as_str())
            .execute(&self.pool)
            .await
            .map_err(|error| StagingError::QueryError {
                command: format!("DELETE_{table}"),
                error,
            })?;
            deleted += result.rows_affected();
        }
        info!(source = source.as_str(), rows = deleted, "staging source reset");
        Ok(deleted)
    }
}

/// The staging operations the orchestrator depends on, as a seam so runs
/// can be driven against an in-memory store in tests.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn max_persisted_sku_number(&self) -> StagingResult<u32>;
    async fn persisted_sku_map(&self) -> StagingResult<PersistedSkus>;
    async fn upsert_product_maps(
        &self,
        rows: &[StagingProductMap],
        cancel: &CancelToken,
    ) -> StagingResult<u64>;
    async fn upsert_clients(
        &self,
        rows: &[StagingClient],
        cancel: &CancelToken,
    ) -> StagingResult<u64>;
    async fn insert_order_lines(
        &self,
        rows: &[StagingOrderLine],
        cancel: &CancelToken,
    ) -> StagingResult<u64>;
}

#[async_trait]
impl StagingStore for StagingWriter {
    async fn max_persisted_sku_number(&self) -> StagingResult<u32> {
        StagingWriter::max_persisted_sku_number(self).await
    }

    async fn persisted_sku_map(&self) -> StagingResult<PersistedSkus> {
        StagingWriter::persisted_sku_map(self).await
    }

    async fn upsert_product_maps(
        &self,
        rows: &[StagingProductMap],
        cancel: &CancelToken,
    ) -> StagingResult<u64> {
        StagingWriter::upsert_product_maps(self, rows, cancel).await
    }

    async fn upsert_clients(
        &self,
        rows: &[StagingClient],
        cancel: &CancelToken,
    ) -> StagingResult<u64> {
        StagingWriter::upsert_clients(self, rows, cancel).await
    }

    async fn insert_order_lines(
        &self,
        rows: &[StagingOrderLine],
        cancel: &CancelToken,
    ) -> StagingResult<u64> {
        StagingWriter::insert_order_lines(self, rows, cancel).await
    }
}

const STAGING_STATS: &str = r#"
SELECT source_system, 'clients' AS tbl, COUNT(*) AS n
FROM stg.clients GROUP BY source_system
UNION ALL
SELECT source_system, 'product_map', COUNT(*)
FROM stg.product_map GROUP BY source_system
UNION ALL
SELECT source_system, 'order_lines', COUNT(*)
FROM stg.order_lines GROUP BY source_system
"#;

const UPSERT_CLIENT: &str = r#"
INSERT INTO stg.clients
    (source_system, source_code, email, name, gender_raw, gender, country,
     created_raw, created_date, load_ts)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
ON CONFLICT (source_system, source_code) DO UPDATE SET
    email = COALESCE(EXCLUDED.email, stg.clients.email),
    name = COALESCE(EXCLUDED.name, stg.clients.name),
    gender_raw = COALESCE(EXCLUDED.gender_raw, stg.clients.gender_raw),
    gender = EXCLUDED.gender,
    country = COALESCE(EXCLUDED.country, stg.clients.country),
    created_raw = COALESCE(EXCLUDED.created_raw, stg.clients.created_raw),
    created_date = COALESCE(EXCLUDED.created_date, stg.clients.created_date)
"#;

const UPSERT_PRODUCT_MAP: &str = r#"
INSERT INTO stg.product_map
    (source_system, source_code, sku, name, category, is_service, load_ts)
VALUES
    ($1, $2, $3, $4, $5, $6, NOW())
ON CONFLICT (source_system, source_code) DO UPDATE SET
    sku = EXCLUDED.sku,
    name = EXCLUDED.name,
    category = EXCLUDED.category,
    is_service = EXCLUDED.is_service,
    load_ts = NOW()
"#;

const INSERT_ORDER_LINE: &str = r#"
INSERT INTO stg.order_lines
    (source_system, order_key, line_key, product_code, client_key,
     date_raw, channel, currency, quantity_raw, unit_price_raw, total_raw,
     order_date, quantity, unit_price, total, load_ts)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
ON CONFLICT (source_system, order_key, line_key) DO NOTHING
"#;

const UPSERT_EXCHANGE_RATE: &str = r#"
INSERT INTO stg.exchange_rates (rate_date, from_currency, to_currency, rate)
VALUES ($1, $2, $3, $4)
ON CONFLICT (rate_date, from_currency, to_currency) DO UPDATE SET
    rate = EXCLUDED.rate
"#;
