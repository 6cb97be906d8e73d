//! Error taxonomy for the ingestion pipeline.
//!
//! Stage-level code never lets these escape as panics or raw `anyhow`
//! errors: the orchestrator turns them into per-stage outcomes. Only
//! unexpected setup failures travel as `anyhow::Error`.

use std::time::Duration;
use thiserror::Error;

/// Failure of an outbound HTTP exchange after the retry policy gave up.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection failure or per-attempt timeout on every attempt.
    #[error("network error after {attempts} attempt(s): {message}")]
    Network { attempts: u32, message: String },

    /// HTTP 429 on every attempt.
    #[error("rate limited after {attempts} attempt(s)")]
    RateLimited {
        attempts: u32,
        retry_after: Option<Duration>,
    },

    /// HTTP 5xx on every attempt; carries the last status seen.
    #[error("server error {status} after {attempts} attempt(s)")]
    Server { status: u16, attempts: u32 },

    /// Any other 4xx. Never retried.
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },

    /// A 2xx body that does not match the provider schema.
    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    /// HTTP status of the last provider answer, `None` for transport or decode failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Server { status, .. } | FetchError::Client { status, .. } => Some(*status),
            FetchError::RateLimited { .. } => Some(429),
            FetchError::Network { .. } | FetchError::Decode { .. } => None,
        }
    }
}

/// Failure of a persistent-store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Busy/locked database, pool exhaustion, or I/O hiccup. Worth retrying.
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("store error: {0}")]
    Database(String),

    /// A record that must never reach the store (e.g. non-finite coordinate).
    #[error("invalid record {key}: {reason}")]
    InvalidRecord { key: String, reason: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Transient(err.to_string()),
            sqlx::Error::Database(db_err) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
                let transient = db_err
                    .code()
                    .and_then(|c| c.parse::<i32>().ok())
                    .map(|c| matches!(c & 0xff, 5 | 6))
                    .unwrap_or(false);
                if transient {
                    StoreError::Transient(err.to_string())
                } else {
                    StoreError::Database(err.to_string())
                }
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Failure of the imagery fetch stage as a whole.
#[derive(Debug, Error)]
pub enum ImageryError {
    /// No page could be retrieved, so there is no partial result to keep.
    #[error("imagery page {page} failed before any data was retrieved: {source}")]
    PartialData {
        page: usize,
        #[source]
        source: FetchError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reports_provider_answers_only() {
        let server = FetchError::Server {
            status: 503,
            attempts: 5,
        };
        assert_eq!(server.status(), Some(503));

        let network = FetchError::Network {
            attempts: 2,
            message: "connection refused".to_string(),
        };
        assert_eq!(network.status(), None);
    }

    #[test]
    fn pool_timeout_is_transient() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transient());

        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_transient());
    }
}
