pub mod writer;

pub use writer::{StagingError, StagingResult, StagingStats, StagingStore, StagingWriter};
