pub mod loader;
pub mod report;

pub use loader::{reset_warehouse, LoadError, LoadResult, LoadRunner, WarehouseLoader};
pub use report::{LoadReport, SkipReason, StepCounts};
