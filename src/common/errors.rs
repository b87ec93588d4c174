use thiserror::Error;

use crate::plugin::metadata::MetadataParseError;

/// Top-level error taxonomy. Each kind maps to one user-visible failure
/// class; transient HTTP errors are retried before being promoted to
/// `Plugin` or `Stream`.
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("No plugin can handle URL: {0}")]
    NoPlugin(String),

    #[error("{0}")]
    Plugin(String),

    #[error("No playable streams found on this URL: {0}")]
    NoStreams(String),

    #[error("{0}")]
    Stream(String),

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error("Failed to parse MPD manifest: {0}")]
    MpdParsing(String),

    #[error(transparent)]
    MetadataParse(#[from] MetadataParseError),
}

impl PipeError {
    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }
}

pub type PipeResult<T> = Result<T, PipeError>;
