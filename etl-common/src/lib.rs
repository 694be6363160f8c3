//! Shared domain logic for the sales warehouse ETL: source taxonomy,
//! normalized record shapes, per-source normalizers and the product
//! equivalence resolver. Everything in this crate is pure (no I/O) so it can
//! be exercised without a database.

pub mod cancel;
pub mod error;
pub mod normalize;
pub mod records;
pub mod resolve;
pub mod source;
pub mod sources;
