//! The product equivalence resolver.
//!
//! Each source models the same products under its own identifiers: MSSQL has
//! the official SKU, MySQL an alternate code, Supabase a possibly-empty SKU,
//! MongoDB a document code plus an embedded equivalence SKU, Neo4j a node
//! SKU. The resolver groups per-source product records by their normalized
//! (name, category) pair and assigns every group exactly one authoritative
//! SKU, chosen by source priority or synthesized from a counter seeded above
//! the highest SKU already persisted.
//!
//! Resolution happens in the constructor: lookups only exist on a resolved
//! map, so looking up before resolution is unrepresentable.

use std::collections::{HashMap, HashSet};

use crate::normalize::name_key;
use crate::records::{ProductSourceRecord, StagingProductMap};
use crate::source::SourceSystem;

/// The resolved identity of one product across all sources.
#[derive(Debug, Clone)]
pub struct CanonicalProduct {
    /// Name and category as first sighted (display form, not the folded key).
    pub name: String,
    pub category: String,
    pub sku: String,
    /// True when no physical code exists anywhere in the group.
    pub is_service: bool,
    pub sources: HashMap<SourceSystem, ProductSourceRecord>,
}

/// SKUs already assigned to (name, category) groups by previous runs,
/// queried from `stg.product_map`. Consulted before source priority so a
/// group resolved in an earlier run keeps its SKU when re-seen.
#[derive(Debug, Clone, Default)]
pub struct PersistedSkus {
    by_key: HashMap<(String, String), String>,
}

impl PersistedSkus {
    pub fn insert(&mut self, name: &str, category: &str, sku: String) {
        self.by_key
            .entry((name_key(name), name_key(category)))
            .or_insert(sku);
    }

    fn get(&self, key: &(String, String)) -> Option<&String> {
        self.by_key.get(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Where each group's authoritative SKU came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionStats {
    pub products: u64,
    pub services: u64,
    pub dropped_missing_name: u64,
    pub sku_from_persisted: u64,
    pub sku_from_mssql: u64,
    pub sku_from_supabase: u64,
    pub sku_from_mongo: u64,
    pub sku_from_neo4j: u64,
    pub sku_generated: u64,
}

/// A resolved equivalence map plus the counts accumulated while building it.
#[derive(Debug)]
pub struct Resolution {
    pub map: EquivalenceMap,
    pub stats: ResolutionStats,
}

#[derive(Debug, Default)]
pub struct EquivalenceMap {
    /// Groups in first-sighting order; input order is extraction order,
    /// which is stable per run, so resolution is deterministic.
    products: Vec<CanonicalProduct>,
    by_key: HashMap<(String, String), usize>,
    by_source_code: HashMap<(SourceSystem, String), usize>,
}

impl EquivalenceMap {
    /// Group, deduplicate and assign authoritative SKUs in one pass over the
    /// records of every selected source. `sku_seed` is the highest SKU
    /// number already persisted; synthesized SKUs start above it.
    ///
    /// Records with an empty name or category are dropped and counted.
    pub fn resolve(
        records: Vec<ProductSourceRecord>,
        sku_seed: u32,
        persisted: &PersistedSkus,
    ) -> Resolution {
        let mut map = EquivalenceMap::default();
        let mut stats = ResolutionStats::default();
        let mut keys: Vec<(String, String)> = Vec::new();

        for record in records {
            if record.name.trim().is_empty() || record.category.trim().is_empty() {
                stats.dropped_missing_name += 1;
                tracing::warn!(
                    source = %record.source,
                    source_code = %record.source_code,
                    "dropping product record with empty name or category"
                );
                continue;
            }
            let key = (name_key(&record.name), name_key(&record.category));
            let index = match map.by_key.get(&key) {
                Some(index) => *index,
                None => {
                    let index = map.products.len();
                    map.products.push(CanonicalProduct {
                        name: record.name.trim().to_owned(),
                        category: record.category.trim().to_owned(),
                        sku: String::new(),
                        is_service: false,
                        sources: HashMap::new(),
                    });
                    map.by_key.insert(key.clone(), index);
                    keys.push(key.clone());
                    index
                }
            };
            map.by_source_code
                .entry((record.source, record.source_code.clone()))
                .or_insert(index);
            // Ties within a source keep the first record encountered.
            map.products[index]
                .sources
                .entry(record.source)
                .or_insert(record);
        }

        // Every SKU any source claims, so generation can never collide with
        // a code owned by a group processed later in the same batch.
        let mut reserved: HashSet<String> = map
            .products
            .iter()
            .flat_map(|p| p.sources.values())
            .filter_map(|r| r.sku.clone())
            .collect();
        let mut assigned: HashSet<String> = HashSet::new();
        let mut next_sku = sku_seed + 1;

        for (index, key) in keys.iter().enumerate() {
            let group = &map.products[index];

            let mut sku = persisted
                .get(key)
                .filter(|s| !assigned.contains(*s))
                .cloned();
            if sku.is_some() {
                stats.sku_from_persisted += 1;
            }

            if sku.is_none() {
                for source in SourceSystem::SKU_PRIORITY {
                    let candidate = group
                        .sources
                        .get(&source)
                        .and_then(|r| r.sku.as_deref())
                        .filter(|s| !s.is_empty());
                    // A SKU already claimed by an earlier group is a data
                    // conflict; the first group wins and this one falls
                    // through, ultimately to generation.
                    if let Some(candidate) = candidate.filter(|s| !assigned.contains(*s)) {
                        sku = Some(candidate.to_owned());
                        match source {
                            SourceSystem::Mssql => stats.sku_from_mssql += 1,
                            SourceSystem::Supabase => stats.sku_from_supabase += 1,
                            SourceSystem::Mongo => stats.sku_from_mongo += 1,
                            SourceSystem::Neo4j => stats.sku_from_neo4j += 1,
                            SourceSystem::Mysql => unreachable!("mysql carries no sku"),
                        }
                        break;
                    }
                }
            }

            let has_physical_code = group
                .sources
                .values()
                .any(|r| r.sku.as_deref().is_some_and(|s| !s.is_empty()));

            let sku = match sku {
                Some(sku) => sku,
                None => {
                    stats.sku_generated += 1;
                    loop {
                        let candidate = format!("SKU-{next_sku:04}");
                        next_sku += 1;
                        if !assigned.contains(&candidate) && !reserved.contains(&candidate) {
                            break candidate;
                        }
                    }
                }
            };

            assigned.insert(sku.clone());
            reserved.insert(sku.clone());

            let group = &mut map.products[index];
            group.is_service =
                group.sources.values().any(|r| r.is_service) || !has_physical_code;
            group.sku = sku;
        }

        stats.products = map.products.len() as u64;
        stats.services = map.products.iter().filter(|p| p.is_service).count() as u64;

        Resolution { map, stats }
    }

    /// The authoritative SKU for a product referenced by a source's own code.
    pub fn sku_for_source_code(&self, source: SourceSystem, code: &str) -> Option<&str> {
        self.by_source_code
            .get(&(source, code.to_owned()))
            .map(|&i| self.products[i].sku.as_str())
    }

    /// The authoritative SKU for a product referenced by name and category.
    pub fn sku_for_name(&self, name: &str, category: &str) -> Option<&str> {
        self.by_key
            .get(&(name_key(name), name_key(category)))
            .map(|&i| self.products[i].sku.as_str())
    }

    pub fn canonical_for_name(&self, name: &str, category: &str) -> Option<&CanonicalProduct> {
        self.by_key
            .get(&(name_key(name), name_key(category)))
            .map(|&i| &self.products[i])
    }

    pub fn is_service(&self, source: SourceSystem, code: &str) -> bool {
        self.by_source_code
            .get(&(source, code.to_owned()))
            .is_some_and(|&i| self.products[i].is_service)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalProduct> {
        self.products.iter()
    }

    /// One staging row per (source, source code): the durable form of the
    /// resolution, consulted as a fallback by later runs.
    pub fn product_map_rows(&self) -> Vec<StagingProductMap> {
        let mut rows = Vec::new();
        for product in &self.products {
            let mut sources: Vec<&ProductSourceRecord> = product.sources.values().collect();
            sources.sort_by_key(|r| r.source);
            for record in sources {
                rows.push(StagingProductMap {
                    source_system: record.source,
                    source_code: record.source_code.clone(),
                    sku: product.sku.clone(),
                    name: product.name.clone(),
                    category: product.category.clone(),
                    is_service: product.is_service,
                });
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        source: SourceSystem,
        code: &str,
        sku: Option<&str>,
        name: &str,
        category: &str,
    ) -> ProductSourceRecord {
        ProductSourceRecord {
            source,
            source_code: code.to_owned(),
            sku: sku.map(str::to_owned),
            name: name.to_owned(),
            category: category.to_owned(),
            is_service: false,
        }
    }

    #[test]
    fn mssql_sku_beats_document_store_sku() {
        let records = vec![
            record(
                SourceSystem::Mongo,
                "M-9",
                Some("SKU-0099"),
                "Wireless Mouse",
                "Electronics",
            ),
            record(
                SourceSystem::Mssql,
                "17",
                Some("SKU-0042"),
                "Wireless Mouse",
                "Electronics",
            ),
        ];
        let resolution = EquivalenceMap::resolve(records, 0, &PersistedSkus::default());
        assert_eq!(resolution.map.len(), 1);
        assert_eq!(
            resolution.map.sku_for_name("wireless mouse", "ELECTRONICS"),
            Some("SKU-0042")
        );
        assert_eq!(resolution.stats.sku_from_mssql, 1);
    }

    #[test]
    fn both_source_records_map_to_the_shared_sku() {
        // Source A supplies SKU-0042, source B supplies none; after
        // resolution both source codes resolve to SKU-0042 and the staging
        // map carries one row per source.
        let records = vec![
            record(
                SourceSystem::Mssql,
                "17",
                Some("SKU-0042"),
                "Wireless Mouse",
                "Electronics",
            ),
            record(SourceSystem::Mysql, "ALT-AB12", None, "Wireless Mouse", "Electronics"),
        ];
        let resolution = EquivalenceMap::resolve(records, 0, &PersistedSkus::default());
        let map = &resolution.map;
        assert_eq!(map.sku_for_source_code(SourceSystem::Mssql, "17"), Some("SKU-0042"));
        assert_eq!(
            map.sku_for_source_code(SourceSystem::Mysql, "ALT-AB12"),
            Some("SKU-0042")
        );

        let rows = map.product_map_rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.sku == "SKU-0042"));
    }

    #[test]
    fn generated_skus_start_above_the_seed() {
        let records = vec![record(SourceSystem::Mysql, "ALT-1", None, "Notebook", "Office")];
        let resolution = EquivalenceMap::resolve(records, 120, &PersistedSkus::default());
        assert_eq!(resolution.map.sku_for_name("Notebook", "Office"), Some("SKU-0121"));
        assert_eq!(resolution.stats.sku_generated, 1);
    }

    #[test]
    fn generation_skips_skus_reserved_by_later_groups() {
        let records = vec![
            record(SourceSystem::Mysql, "ALT-1", None, "Notebook", "Office"),
            record(
                SourceSystem::Mssql,
                "5",
                Some("SKU-0001"),
                "Stapler",
                "Office",
            ),
        ];
        let resolution = EquivalenceMap::resolve(records, 0, &PersistedSkus::default());
        // SKU-0001 belongs to the stapler even though the notebook group was
        // resolved first.
        assert_eq!(resolution.map.sku_for_name("Notebook", "Office"), Some("SKU-0002"));
        assert_eq!(resolution.map.sku_for_name("Stapler", "Office"), Some("SKU-0001"));
    }

    #[test]
    fn no_two_groups_share_a_sku() {
        // A genuine data conflict: two different products claim SKU-0007.
        // The first group encountered wins; the second falls through to
        // generation.
        let records = vec![
            record(SourceSystem::Mssql, "1", Some("SKU-0007"), "Desk Lamp", "Home"),
            record(SourceSystem::Mssql, "2", Some("SKU-0007"), "Floor Lamp", "Home"),
            record(SourceSystem::Mysql, "ALT-9", None, "Candle", "Home"),
        ];
        let resolution = EquivalenceMap::resolve(records, 0, &PersistedSkus::default());
        let mut skus: Vec<&str> = resolution
            .map
            .iter()
            .map(|p| p.sku.as_str())
            .collect();
        skus.sort_unstable();
        skus.dedup();
        assert_eq!(skus.len(), 3, "every group must hold a distinct sku");
        assert_eq!(resolution.map.sku_for_name("Desk Lamp", "Home"), Some("SKU-0007"));
        assert_ne!(resolution.map.sku_for_name("Floor Lamp", "Home"), Some("SKU-0007"));
    }

    #[test]
    fn records_without_name_or_category_are_dropped_and_counted() {
        let records = vec![
            record(SourceSystem::Mongo, "M-1", None, "", "Electronics"),
            record(SourceSystem::Mongo, "M-2", None, "Cable", "  "),
            record(SourceSystem::Mongo, "M-3", None, "Cable", "Electronics"),
        ];
        let resolution = EquivalenceMap::resolve(records, 0, &PersistedSkus::default());
        assert_eq!(resolution.map.len(), 1);
        assert_eq!(resolution.stats.dropped_missing_name, 2);
    }

    #[test]
    fn group_with_no_physical_code_is_a_service() {
        let records = vec![
            record(SourceSystem::Supabase, "301", None, "Extended Warranty", "Services"),
            record(SourceSystem::Mssql, "44", Some("SKU-0044"), "Mouse Pad", "Electronics"),
        ];
        let resolution = EquivalenceMap::resolve(records, 0, &PersistedSkus::default());
        let warranty = resolution
            .map
            .canonical_for_name("Extended Warranty", "Services")
            .unwrap();
        assert!(warranty.is_service);
        assert!(resolution.map.is_service(SourceSystem::Supabase, "301"));
        assert!(!resolution.map.is_service(SourceSystem::Mssql, "44"));
        assert_eq!(resolution.stats.services, 1);
    }

    #[test]
    fn grouping_is_case_and_accent_insensitive() {
        let records = vec![
            record(
                SourceSystem::Mssql,
                "7",
                Some("SKU-0007"),
                "Televisor LED 32",
                "Electrónica",
            ),
            record(SourceSystem::Mysql, "ALT-7", None, "TELEVISOR LED 32", "Electronica"),
        ];
        let resolution = EquivalenceMap::resolve(records, 0, &PersistedSkus::default());
        assert_eq!(resolution.map.len(), 1);
        assert_eq!(
            resolution.map.sku_for_source_code(SourceSystem::Mysql, "ALT-7"),
            Some("SKU-0007")
        );
    }

    #[test]
    fn persisted_sku_wins_over_generation_on_reruns() {
        let mut persisted = PersistedSkus::default();
        persisted.insert("Notebook", "Office", "SKU-0500".to_owned());

        let records = vec![record(SourceSystem::Mysql, "ALT-1", None, "Notebook", "Office")];
        let resolution = EquivalenceMap::resolve(records, 0, &persisted);
        assert_eq!(resolution.map.sku_for_name("Notebook", "Office"), Some("SKU-0500"));
        assert_eq!(resolution.stats.sku_from_persisted, 1);
        assert_eq!(resolution.stats.sku_generated, 0);
    }

    #[test]
    fn resolution_is_deterministic_for_identical_input() {
        let records = || {
            vec![
                record(SourceSystem::Mysql, "ALT-1", None, "Notebook", "Office"),
                record(SourceSystem::Mysql, "ALT-2", None, "Pen", "Office"),
                record(SourceSystem::Mongo, "M-1", None, "Eraser", "Office"),
            ]
        };
        let first = EquivalenceMap::resolve(records(), 10, &PersistedSkus::default());
        let second = EquivalenceMap::resolve(records(), 10, &PersistedSkus::default());
        for product in first.map.iter() {
            assert_eq!(
                second.map.sku_for_name(&product.name, &product.category),
                Some(product.sku.as_str())
            );
        }
    }
}
