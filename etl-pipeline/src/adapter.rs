//! Extraction seam.
//!
//! The pipeline never talks to a source database directly; a deployment
//! supplies one [`SourceAdapter`] per system and the pipeline consumes the
//! native bundles they fetch. Tests use in-memory adapters.

use std::fmt;

use async_trait::async_trait;

use etl_common::source::SourceSystem;
use etl_common::sources::{mongo, mssql, mysql, neo4j, supabase};

#[derive(Debug)]
pub struct SourceUnavailable {
    pub source: SourceSystem,
    pub detail: String,
}

impl fmt::Display for SourceUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source {} unavailable: {}", self.source, self.detail)
    }
}

impl std::error::Error for SourceUnavailable {}

impl SourceUnavailable {
    pub fn new(source: SourceSystem, detail: impl Into<String>) -> Self {
        Self {
            source,
            detail: detail.into(),
        }
    }
}

/// One source system's full extract, in that system's native shape.
#[derive(Debug, Clone)]
pub enum SourceExtract {
    Mssql {
        clients: Vec<mssql::MssqlClient>,
        products: Vec<mssql::MssqlProduct>,
        orders: Vec<mssql::MssqlOrder>,
        lines: Vec<mssql::MssqlOrderLine>,
    },
    Mysql {
        clients: Vec<mysql::MysqlClient>,
        products: Vec<mysql::MysqlProduct>,
        orders: Vec<mysql::MysqlOrder>,
        lines: Vec<mysql::MysqlOrderLine>,
    },
    Supabase {
        clients: Vec<supabase::SupabaseClient>,
        products: Vec<supabase::SupabaseProduct>,
        orders: Vec<supabase::SupabaseOrder>,
        lines: Vec<supabase::SupabaseOrderLine>,
    },
    Mongo {
        clients: Vec<mongo::MongoClient>,
        products: Vec<mongo::MongoProduct>,
        orders: Vec<mongo::MongoOrder>,
    },
    Neo4j {
        clients: Vec<neo4j::Neo4jClient>,
        products: Vec<neo4j::Neo4jProduct>,
        placed: Vec<neo4j::Neo4jPlacedOrder>,
        edges: Vec<neo4j::Neo4jOrderProduct>,
    },
}

impl SourceExtract {
    pub fn source(&self) -> SourceSystem {
        match self {
            SourceExtract::Mssql { .. } => SourceSystem::Mssql,
            SourceExtract::Mysql { .. } => SourceSystem::Mysql,
            SourceExtract::Supabase { .. } => SourceSystem::Supabase,
            SourceExtract::Mongo { .. } => SourceSystem::Mongo,
            SourceExtract::Neo4j { .. } => SourceSystem::Neo4j,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceSystem;

    /// Fetch the full extract. An adapter whose extract variant does not
    /// match its declared source is a programming error and the pipeline
    /// treats it as unavailable.
    async fn fetch(&self) -> Result<SourceExtract, SourceUnavailable>;
}
