//! End-to-end orchestration: fetch every configured source, resolve product
//! identity across them, stage the normalized rows, then run a warehouse
//! load cycle.
//!
//! A source that fails to fetch or to stage is reported and skipped; the
//! run carries on with the sources that answered and still reaches the
//! load cycle. Only a shutdown request and cross-source infrastructure
//! failures (the resolution seed queries, the shared product map) abort
//! the run.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{error, info};

use etl_common::cancel::CancelToken;
use etl_common::records::{
    BatchSummary, ProductSourceRecord, StagingClient, StagingOrderLine,
};
use etl_common::resolve::{EquivalenceMap, ResolutionStats};
use etl_common::source::SourceSystem;
use etl_common::sources::{mongo, mssql, mysql, neo4j, supabase};
use etl_staging::{StagingError, StagingStore, StagingWriter};
use etl_warehouse::{LoadError, LoadReport, LoadRunner, WarehouseLoader};

use crate::adapter::{SourceAdapter, SourceExtract};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("staging failed: {0}")]
    Staging(#[from] StagingError),
    #[error("warehouse load failed: {0}")]
    Load(#[from] LoadError),
    #[error("interrupted by shutdown request")]
    Interrupted,
}

/// Per-source record of what a run extracted and staged. A source that
/// could not be fetched carries the failure detail and zero counts.
#[derive(Debug, Clone, Default)]
pub struct SourceRunSummary {
    pub clients: BatchSummary,
    pub lines: BatchSummary,
    pub failed: Option<String>,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub sources: HashMap<SourceSystem, SourceRunSummary>,
    pub resolution: ResolutionStats,
    pub clients_staged: u64,
    pub product_maps_staged: u64,
    pub lines_staged: u64,
    pub load: Option<LoadReport>,
}

/// One source's extract after normalization, ready for staging.
struct NormalizedExtract {
    source: SourceSystem,
    products: Vec<ProductSourceRecord>,
    clients: Vec<StagingClient>,
    client_summary: BatchSummary,
    lines: Vec<StagingOrderLine>,
    line_summary: BatchSummary,
}

fn normalize_extract(extract: SourceExtract) -> NormalizedExtract {
    let source = extract.source();
    match extract {
        SourceExtract::Mssql {
            clients,
            products,
            orders,
            lines,
        } => {
            let product_records = mssql::product_records(&products);
            let (clients, client_summary) = mssql::normalize_clients(&clients);
            let (lines, line_summary) = mssql::normalize_order_lines(&orders, &lines);
            NormalizedExtract {
                source,
                products: product_records,
                clients,
                client_summary,
                lines,
                line_summary,
            }
        }
        SourceExtract::Mysql {
            clients,
            products,
            orders,
            lines,
        } => {
            let product_records = mysql::product_records(&products);
            let (clients, client_summary) = mysql::normalize_clients(&clients);
            let (lines, line_summary) = mysql::normalize_order_lines(&orders, &lines, &products);
            NormalizedExtract {
                source,
                products: product_records,
                clients,
                client_summary,
                lines,
                line_summary,
            }
        }
        SourceExtract::Supabase {
            clients,
            products,
            orders,
            lines,
        } => {
            let product_records = supabase::product_records(&products);
            let (clients, client_summary) = supabase::normalize_clients(&clients);
            let (lines, line_summary) =
                supabase::normalize_order_lines(&orders, &lines, &products);
            NormalizedExtract {
                source,
                products: product_records,
                clients,
                client_summary,
                lines,
                line_summary,
            }
        }
        SourceExtract::Mongo {
            clients,
            products,
            orders,
        } => {
            let product_records = mongo::product_records(&products);
            let (clients, client_summary) = mongo::normalize_clients(&clients);
            let (lines, line_summary) = mongo::normalize_order_lines(&orders, &products);
            NormalizedExtract {
                source,
                products: product_records,
                clients,
                client_summary,
                lines,
                line_summary,
            }
        }
        SourceExtract::Neo4j {
            clients,
            products,
            placed,
            edges,
        } => {
            let product_records = neo4j::product_records(&products);
            let (clients, client_summary) = neo4j::normalize_clients(&clients);
            let (lines, line_summary) = neo4j::normalize_order_lines(&placed, &edges);
            NormalizedExtract {
                source,
                products: product_records,
                clients,
                client_summary,
                lines,
                line_summary,
            }
        }
    }
}

pub struct Pipeline<S = StagingWriter, L = WarehouseLoader> {
    staging: S,
    loader: L,
    sources: Vec<SourceSystem>,
    force_load: bool,
}

impl<S: StagingStore, L: LoadRunner> Pipeline<S, L> {
    pub fn new(staging: S, loader: L, sources: Vec<SourceSystem>, force_load: bool) -> Self {
        Self {
            staging,
            loader,
            sources,
            force_load,
        }
    }

    /// Run one pipeline pass over the given adapters. Adapters whose
    /// source is not configured are ignored.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        &self,
        adapters: &[Box<dyn SourceAdapter>],
        cancel: &CancelToken,
    ) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();

        let mut normalized = Vec::new();
        for adapter in adapters {
            let source = adapter.source();
            if !self.sources.contains(&source) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Interrupted);
            }
            match adapter.fetch().await {
                Ok(extract) if extract.source() == source => {
                    normalized.push(normalize_extract(extract));
                }
                Ok(extract) => {
                    error!(
                        declared = source.as_str(),
                        fetched = extract.source().as_str(),
                        "adapter returned an extract for the wrong source"
                    );
                    summary.sources.entry(source).or_default().failed =
                        Some("extract does not match declared source".to_owned());
                }
                Err(unavailable) => {
                    error!(source = source.as_str(), detail = %unavailable, "source skipped");
                    summary.sources.entry(source).or_default().failed =
                        Some(unavailable.detail);
                }
            }
        }

        // Identity resolution needs every answering source's product records
        // at once, so it runs after all fetches and before any staging.
        let sku_seed = self.staging.max_persisted_sku_number().await?;
        let persisted = self.staging.persisted_sku_map().await?;
        let all_products: Vec<ProductSourceRecord> = normalized
            .iter()
            .flat_map(|n| n.products.iter().cloned())
            .collect();
        let resolution = EquivalenceMap::resolve(all_products, sku_seed, &persisted);
        summary.resolution = resolution.stats;

        let map_rows = resolution.map.product_map_rows();
        summary.product_maps_staged = self.staging.upsert_product_maps(&map_rows, cancel).await?;

        // A staging failure on one source must not cost the others their
        // rows or the warehouse its load cycle. Only a shutdown request
        // stops the pass here.
        for extract in normalized {
            let mut failed = None;
            match self.staging.upsert_clients(&extract.clients, cancel).await {
                Ok(count) => summary.clients_staged += count,
                Err(StagingError::Interrupted) => return Err(PipelineError::Interrupted),
                Err(error) => {
                    error!(source = extract.source.as_str(), detail = %error, "client staging failed");
                    failed = Some(error.to_string());
                }
            }
            if failed.is_none() {
                match self.staging.insert_order_lines(&extract.lines, cancel).await {
                    Ok(count) => summary.lines_staged += count,
                    Err(StagingError::Interrupted) => return Err(PipelineError::Interrupted),
                    Err(error) => {
                        error!(source = extract.source.as_str(), detail = %error, "order line staging failed");
                        failed = Some(error.to_string());
                    }
                }
            }
            let entry = summary.sources.entry(extract.source).or_default();
            entry.clients = extract.client_summary;
            entry.line_summary_merge(extract.line_summary);
            entry.failed = failed;
        }

        info!(
            products = summary.resolution.products,
            clients = summary.clients_staged,
            lines = summary.lines_staged,
            "staging pass complete"
        );

        summary.load = self.loader.run_cycle(self.force_load, cancel).await?;
        Ok(summary)
    }
}

impl SourceRunSummary {
    fn line_summary_merge(&mut self, other: BatchSummary) {
        self.lines.merge(&other);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};

    use etl_common::records::StagingProductMap;
    use etl_common::resolve::PersistedSkus;
    use etl_staging::StagingResult;
    use etl_warehouse::LoadResult;

    use crate::adapter::SourceUnavailable;

    use super::*;

    fn mysql_extract() -> SourceExtract {
        SourceExtract::Mysql {
            clients: vec![mysql::MysqlClient {
                id: 1,
                name: Some("Maria".to_owned()),
                email: Some("maria@example.com".to_owned()),
                gender: Some("FEMENINO".to_owned()),
                country: Some("CR".to_owned()),
                created_raw: Some("2025-02-03".to_owned()),
            }],
            products: vec![mysql::MysqlProduct {
                id: 7,
                alt_code: "ALT-7".to_owned(),
                name: Some("Wireless Mouse".to_owned()),
                category: Some("Electronics".to_owned()),
            }],
            orders: vec![mysql::MysqlOrder {
                id: 10,
                client_id: 1,
                date_raw: Some("2025-02-10".to_owned()),
                channel: Some("online".to_owned()),
                currency: Some("USD".to_owned()),
            }],
            lines: vec![mysql::MysqlOrderLine {
                id: 100,
                order_id: 10,
                product_id: 7,
                quantity_raw: Some("2".to_owned()),
                unit_price_raw: Some("10,50".to_owned()),
            }],
        }
    }

    fn mongo_extract() -> SourceExtract {
        SourceExtract::Mongo {
            clients: vec![mongo::MongoClient {
                id: "65a1f0".to_owned(),
                name: Some("Jorge".to_owned()),
                email: Some("jorge@example.com".to_owned()),
                gender: Some("M".to_owned()),
                country: Some("Costa Rica".to_owned()),
                created_at: Some(Utc::now()),
            }],
            products: vec![],
            orders: vec![],
        }
    }

    struct FakeStaging {
        fail_clients_for: Option<SourceSystem>,
    }

    #[async_trait]
    impl StagingStore for FakeStaging {
        async fn max_persisted_sku_number(&self) -> StagingResult<u32> {
            Ok(0)
        }

        async fn persisted_sku_map(&self) -> StagingResult<PersistedSkus> {
            Ok(PersistedSkus::default())
        }

        async fn upsert_product_maps(
            &self,
            rows: &[StagingProductMap],
            _cancel: &CancelToken,
        ) -> StagingResult<u64> {
            Ok(rows.len() as u64)
        }

        async fn upsert_clients(
            &self,
            rows: &[StagingClient],
            _cancel: &CancelToken,
        ) -> StagingResult<u64> {
            if let Some(target) = self.fail_clients_for {
                if rows.first().map(|r| r.source_system) == Some(target) {
                    return Err(StagingError::QueryError {
                        command: "UPSERT_CLIENT".to_owned(),
                        error: sqlx::Error::PoolClosed,
                    });
                }
            }
            Ok(rows.len() as u64)
        }

        async fn insert_order_lines(
            &self,
            rows: &[StagingOrderLine],
            _cancel: &CancelToken,
        ) -> StagingResult<u64> {
            Ok(rows.len() as u64)
        }
    }

    #[derive(Clone)]
    struct FakeLoader {
        ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl LoadRunner for FakeLoader {
        async fn run_cycle(
            &self,
            _force: bool,
            _cancel: &CancelToken,
        ) -> LoadResult<Option<LoadReport>> {
            self.ran.store(true, Ordering::SeqCst);
            Ok(None)
        }
    }

    struct FixedAdapter {
        extract: SourceExtract,
    }

    #[async_trait]
    impl SourceAdapter for FixedAdapter {
        fn source(&self) -> SourceSystem {
            self.extract.source()
        }

        async fn fetch(&self) -> Result<SourceExtract, SourceUnavailable> {
            Ok(self.extract.clone())
        }
    }

    struct DownAdapter {
        source: SourceSystem,
    }

    #[async_trait]
    impl SourceAdapter for DownAdapter {
        fn source(&self) -> SourceSystem {
            self.source
        }

        async fn fetch(&self) -> Result<SourceExtract, SourceUnavailable> {
            Err(SourceUnavailable::new(self.source, "connection refused"))
        }
    }

    #[tokio::test]
    async fn staging_failure_on_one_source_does_not_stop_the_rest() {
        let ran = Arc::new(AtomicBool::new(false));
        let pipeline = Pipeline::new(
            FakeStaging {
                fail_clients_for: Some(SourceSystem::Mysql),
            },
            FakeLoader {
                ran: Arc::clone(&ran),
            },
            vec![SourceSystem::Mysql, SourceSystem::Mongo],
            false,
        );
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![
            Box::new(FixedAdapter {
                extract: mysql_extract(),
            }),
            Box::new(FixedAdapter {
                extract: mongo_extract(),
            }),
        ];

        let summary = pipeline.run(&adapters, &CancelToken::new()).await.unwrap();

        assert!(summary.sources[&SourceSystem::Mysql].failed.is_some());
        assert!(summary.sources[&SourceSystem::Mongo].failed.is_none());
        assert_eq!(summary.clients_staged, 1);
        assert_eq!(summary.lines_staged, 0);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unreachable_source_is_recorded_and_the_load_still_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let pipeline = Pipeline::new(
            FakeStaging {
                fail_clients_for: None,
            },
            FakeLoader {
                ran: Arc::clone(&ran),
            },
            vec![SourceSystem::Mysql, SourceSystem::Mongo],
            false,
        );
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![
            Box::new(DownAdapter {
                source: SourceSystem::Mysql,
            }),
            Box::new(FixedAdapter {
                extract: mongo_extract(),
            }),
        ];

        let summary = pipeline.run(&adapters, &CancelToken::new()).await.unwrap();

        assert!(summary.sources[&SourceSystem::Mysql].failed.is_some());
        assert_eq!(summary.clients_staged, 1);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn mysql_extract_normalizes_end_to_end() {
        let normalized = normalize_extract(mysql_extract());
        assert_eq!(normalized.source, SourceSystem::Mysql);
        assert_eq!(normalized.products.len(), 1);
        assert_eq!(normalized.clients.len(), 1);
        assert_eq!(
            normalized.clients[0].created_date,
            Some(NaiveDate::from_ymd_opt(2025, 2, 3).unwrap())
        );
        assert_eq!(normalized.lines.len(), 1);
        assert_eq!(normalized.lines[0].channel, "WEB");
        assert_eq!(normalized.lines[0].total, 21.0);
        assert_eq!(normalized.line_summary.staged, 1);
    }

    #[test]
    fn extract_source_matches_variant() {
        let extract = SourceExtract::Mongo {
            clients: vec![],
            products: vec![],
            orders: vec![],
        };
        assert_eq!(extract.source(), SourceSystem::Mongo);
        assert_eq!(normalize_extract(extract).source, SourceSystem::Mongo);
    }
}
