use thiserror::Error;

/// Record-level parse failures. The offending record is skipped and counted
/// by the caller; a parse failure never becomes a defaulted value, because
/// defaults silently corrupt the time dimension join and the fact measures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("could not parse '{0}' as a date")]
    Date(String),
    #[error("could not parse '{0}' as a numeric amount")]
    Amount(String),
}
