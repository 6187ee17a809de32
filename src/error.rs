//! Error types shared across the fetch, cache and narrative layers.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single request against a candle source.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    /// HTTP 418/429. `retry_after` carries the ban expiry hint when the body
    /// included one.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Any other non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Connection, timeout or body transfer failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response arrived but could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether another attempt can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::RateLimited { .. } | SourceError::Transport(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SourceError::Decode(e.to_string())
        } else {
            SourceError::Transport(e.to_string())
        }
    }
}

/// Failures while reading or writing cached archive pages.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("archive holds no CSV entry")]
    EmptyArchive,
}

/// Failures of the narrative-generation call.
#[derive(Debug, Error)]
pub enum NarrativeError {
    #[error("completion request failed: {0}")]
    Request(#[from] SourceError),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: SourceError },

    #[error("unexpected completion response: {0}")]
    Malformed(String),
}

/// Fatal configuration problems; these end the process with a non-zero exit.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("input file not found: {0}")]
    MissingInput(PathBuf),

    #[error("missing credential: set {0} in the environment or a .env file")]
    MissingCredential(&'static str),

    #[error("invalid interval {0:?} (expected e.g. 15m, 4h, 1d)")]
    InvalidInterval(String),

    #[error("invalid date range: {0}")]
    InvalidRange(String),
}
