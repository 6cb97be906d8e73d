//! In-memory [`HazardStore`] implementation for testing.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Upserts follow the same
//! keying rules as the SQLite store, and cluster triggers are recorded so
//! tests can assert on them.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::HazardStore;
use crate::error::StoreError;
use crate::models::{BoundingBox, ClusterParams, PointRecord, WayRecord};

#[derive(Default)]
pub struct InMemoryStore {
    ways: RwLock<HashMap<i64, WayRecord>>,
    points: RwLock<HashMap<String, PointRecord>>,
    checkpoint: RwLock<Option<DateTime<Utc>>>,
    cluster_requests: RwLock<Vec<ClusterParams>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing checkpoint.
    pub fn with_checkpoint(at: DateTime<Utc>) -> Self {
        let store = Self::default();
        *store.checkpoint.write().unwrap_or_else(|e| e.into_inner()) = Some(at);
        store
    }

    pub fn way_count(&self) -> usize {
        self.ways.read().map(|w| w.len()).unwrap_or(0)
    }

    pub fn point_count(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn points(&self) -> Vec<PointRecord> {
        self.points
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn checkpoint(&self) -> Option<DateTime<Utc>> {
        self.checkpoint.read().ok().and_then(|c| *c)
    }

    pub fn cluster_requests(&self) -> Vec<ClusterParams> {
        self.cluster_requests
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl HazardStore for InMemoryStore {
    async fn upsert_ways(&self, ways: &[WayRecord]) -> Result<(), StoreError> {
        let mut map = self.ways.write().map_err(poisoned)?;
        for way in ways {
            map.insert(way.way_id, way.clone());
        }
        Ok(())
    }

    async fn upsert_points(&self, points: &[PointRecord]) -> Result<(), StoreError> {
        if let Some(bad) = points.iter().find(|p| !p.point().is_valid()) {
            return Err(StoreError::InvalidRecord {
                key: bad.point_key.clone(),
                reason: format!("invalid coordinate ({}, {})", bad.lat, bad.lon),
            });
        }
        let mut map = self.points.write().map_err(poisoned)?;
        for point in points {
            map.insert(point.point_key.clone(), point.clone());
        }
        Ok(())
    }

    async fn read_checkpoint(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(*self.checkpoint.read().map_err(poisoned)?)
    }

    async fn write_checkpoint(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        *self.checkpoint.write().map_err(poisoned)? = Some(at);
        Ok(())
    }

    async fn cluster_recent_detections(&self, params: &ClusterParams) -> Result<(), StoreError> {
        self.cluster_requests.write().map_err(poisoned)?.push(*params);
        Ok(())
    }

    async fn points_in_bbox(
        &self,
        bbox: &BoundingBox,
        limit: i64,
    ) -> Result<Vec<PointRecord>, StoreError> {
        let map = self.points.read().map_err(poisoned)?;
        let mut found: Vec<PointRecord> = map
            .values()
            .filter(|p| bbox.contains(&p.point()))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.captured_at
                .cmp(&a.captured_at)
                .then_with(|| a.point_key.cmp(&b.point_key))
        });
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }
}
