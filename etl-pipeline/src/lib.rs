pub mod adapter;
pub mod config;
pub mod pipeline;

pub use adapter::{SourceAdapter, SourceExtract, SourceUnavailable};
pub use config::{Config, Mode};
pub use pipeline::{Pipeline, PipelineError, RunSummary, SourceRunSummary};
