//! Error types shared by the reconstruction core, storage and the bridge.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No matching row. Kept apart from storage faults so callers can
    /// answer "not found" instead of failing.
    #[error("{0} not found")]
    NotFound(String),

    #[error("decode error in {context}: {reason}")]
    Decode { context: String, reason: String },

    #[error("no price sample at or before {at}")]
    PriceUnavailable { at: DateTime<Utc> },

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("upstream disconnected: {0}")]
    UpstreamDisconnect(String),

    #[error("subscriber {0} unresponsive")]
    SubscriberUnresponsive(u64),

    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool: {0}")]
    Pool(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub fn decode(context: impl Into<String>, reason: impl ToString) -> Self {
        Error::Decode {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// Prefix a decode error with the transaction hash and output index it
    /// came from. Other variants pass through untouched.
    pub fn in_output(self, tx_hash: &str, index: usize) -> Self {
        match self {
            Error::Decode { context, reason } => Error::Decode {
                context: format!("tx {tx_hash} output {index}: {context}"),
                reason,
            },
            other => other,
        }
    }

    /// Prefix a decode error with the transaction it belongs to.
    pub fn in_transaction(self, tx_hash: &str) -> Self {
        match self {
            Error::Decode { context, reason } => Error::Decode {
                context: format!("tx {tx_hash}: {context}"),
                reason,
            },
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Errors after which the bridge cannot keep running.
    pub fn is_fatal_upstream(&self) -> bool {
        !matches!(self, Error::Decode { .. } | Error::Json(_))
    }
}

impl From<bb8::RunError<tokio_postgres::Error>> for Error {
    fn from(err: bb8::RunError<tokio_postgres::Error>) -> Self {
        match err {
            bb8::RunError::User(e) => Error::Postgres(e),
            bb8::RunError::TimedOut => Error::Pool("timed out waiting for a connection".into()),
        }
    }
}
