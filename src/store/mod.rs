//! Storage abstraction for ingested records.
//!
//! The [`HazardStore`] trait covers the keyed upserts the pipeline performs
//! (ways, points, the checkpoint singleton), the clustering trigger, and the
//! bounding-box read used by downstream consumers. Implementations must be
//! `Send + Sync` to work with async runtimes.
//!
//! | Implementation | Use |
//! |----------------|-----|
//! | [`sqlite::SqliteStore`] | Production, SQLite via `sqlx` |
//! | [`memory::InMemoryStore`] | Tests and dry experiments |

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;
use crate::models::{BoundingBox, ClusterParams, PointRecord, WayRecord};

/// Id of the single ingestion-state row.
pub const CHECKPOINT_ID: i64 = 1;

/// Abstract persistent store for the ingestion pipeline.
///
/// Every write is an upsert keyed on a stable id, so replaying a batch never
/// duplicates rows. A call to [`upsert_ways`](HazardStore::upsert_ways) or
/// [`upsert_points`](HazardStore::upsert_points) is atomic for the slice it
/// receives; nothing spans calls.
#[async_trait]
pub trait HazardStore: Send + Sync {
    /// Insert or update ways keyed by `way_id`.
    async fn upsert_ways(&self, ways: &[WayRecord]) -> Result<(), StoreError>;

    /// Insert or update points keyed by `point_key`.
    async fn upsert_points(&self, points: &[PointRecord]) -> Result<(), StoreError>;

    /// `last_run_at` of the singleton state row, if any.
    async fn read_checkpoint(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn write_checkpoint(&self, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Ask the external clustering procedure to group recent points.
    async fn cluster_recent_detections(&self, params: &ClusterParams) -> Result<(), StoreError>;

    /// Stored points inside `bbox` (inclusive), most recent capture first.
    async fn points_in_bbox(
        &self,
        bbox: &BoundingBox,
        limit: i64,
    ) -> Result<Vec<PointRecord>, StoreError>;
}

/// Run a store operation, retrying it as a whole on transient errors.
///
/// Non-transient errors return immediately. Backoff starts at `base_delay`
/// and doubles per attempt.
pub async fn retry_transient<F, Fut, T>(
    operation: &str,
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    let mut delay = base_delay;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "store operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient store error, retrying batch"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!(operation, attempt, error = %e, "store retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient("test", 3, Duration::from_millis(1), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(StoreError::Transient("database is locked".to_string()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_transient_error_is_returned() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient("test", 2, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Transient("busy".to_string()))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient("test", 5, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Database("constraint failed".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
