//! Per-source record shapes and normalizers.
//!
//! Each module defines the native shape its extraction adapter hands to the
//! core, and pure functions mapping that shape onto the staging records. The
//! normalizers are the only code aware of a source's field layout.

pub mod mongo;
pub mod mssql;
pub mod mysql;
pub mod neo4j;
pub mod supabase;
