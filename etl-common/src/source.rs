use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid SourceSystem")]
pub struct ParseSourceSystemError(pub String);

/// The five independently-evolved stores feeding the warehouse.
///
/// The order of `SKU_PRIORITY` is the resolution policy: the MSSQL SKU is
/// canonical, then the Supabase SKU, then the equivalence SKU embedded in the
/// MongoDB document, then the Neo4j node SKU. MySQL only carries an alternate
/// code, never a SKU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceSystem {
    Mssql,
    Mysql,
    Supabase,
    Mongo,
    Neo4j,
}

impl SourceSystem {
    pub const ALL: [SourceSystem; 5] = [
        SourceSystem::Mssql,
        SourceSystem::Mysql,
        SourceSystem::Supabase,
        SourceSystem::Mongo,
        SourceSystem::Neo4j,
    ];

    /// Sources that may carry a SKU, in authoritative order.
    pub const SKU_PRIORITY: [SourceSystem; 4] = [
        SourceSystem::Mssql,
        SourceSystem::Supabase,
        SourceSystem::Mongo,
        SourceSystem::Neo4j,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSystem::Mssql => "mssql",
            SourceSystem::Mysql => "mysql",
            SourceSystem::Supabase => "supabase",
            SourceSystem::Mongo => "mongo",
            SourceSystem::Neo4j => "neo4j",
        }
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceSystem {
    type Err = ParseSourceSystemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mssql" => Ok(SourceSystem::Mssql),
            "mysql" => Ok(SourceSystem::Mysql),
            "supabase" => Ok(SourceSystem::Supabase),
            "mongo" => Ok(SourceSystem::Mongo),
            "neo4j" => Ok(SourceSystem::Neo4j),
            invalid => Err(ParseSourceSystemError(invalid.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_known_sources() {
        for source in SourceSystem::ALL {
            assert_eq!(source.as_str().parse::<SourceSystem>(), Ok(source));
        }
    }

    #[test]
    fn rejects_unknown_source() {
        assert_eq!(
            "oracle".parse::<SourceSystem>(),
            Err(ParseSourceSystemError("oracle".to_owned()))
        );
    }

    #[test]
    fn mysql_never_supplies_a_sku() {
        assert!(!SourceSystem::SKU_PRIORITY.contains(&SourceSystem::Mysql));
    }
}
