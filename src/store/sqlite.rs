//! SQLite-backed [`HazardStore`] implementation.
//!
//! Each upsert call runs in one transaction, so a batch is either fully
//! committed or not at all. The clustering trigger is realized as a row in
//! `cluster_requests`, which the external clustering worker drains.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use super::{HazardStore, CHECKPOINT_ID};
use crate::error::StoreError;
use crate::models::{BoundingBox, ClusterParams, PointRecord, WayRecord};

/// SQLite implementation of the [`HazardStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Database(format!("stored timestamp out of range: {}", ms)))
}

#[async_trait]
impl HazardStore for SqliteStore {
    async fn upsert_ways(&self, ways: &[WayRecord]) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for way in ways {
            sqlx::query(
                r#"
                INSERT INTO osm_ways (way_id, geometry_json, highway, tags_json, fetched_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(way_id) DO UPDATE SET
                    geometry_json = excluded.geometry_json,
                    highway = excluded.highway,
                    tags_json = excluded.tags_json,
                    fetched_at = excluded.fetched_at
                "#,
            )
            .bind(way.way_id)
            .bind(way.geometry_json())
            .bind(&way.highway)
            .bind(way.tags_json())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_points(&self, points: &[PointRecord]) -> Result<(), StoreError> {
        if let Some(bad) = points.iter().find(|p| !p.point().is_valid()) {
            return Err(StoreError::InvalidRecord {
                key: bad.point_key.clone(),
                reason: format!("invalid coordinate ({}, {})", bad.lat, bad.lon),
            });
        }

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for point in points {
            sqlx::query(
                r#"
                INSERT INTO hazard_points (point_key, image_id, lat, lon, geom, captured_at,
                                           feature_class, confidence, image_url, ingested_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(point_key) DO UPDATE SET
                    captured_at = excluded.captured_at,
                    confidence = excluded.confidence,
                    image_url = excluded.image_url,
                    ingested_at = excluded.ingested_at
                "#,
            )
            .bind(&point.point_key)
            .bind(&point.image_id)
            .bind(point.lat)
            .bind(point.lon)
            .bind(point.geometry_wkt())
            .bind(point.captured_at.timestamp_millis())
            .bind(&point.feature_class)
            .bind(point.confidence)
            .bind(&point.image_url)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn read_checkpoint(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let ms: Option<i64> =
            sqlx::query_scalar("SELECT last_run_at FROM ingestion_state WHERE id = ?")
                .bind(CHECKPOINT_ID)
                .fetch_optional(&self.pool)
                .await?;

        ms.map(millis_to_utc).transpose()
    }

    async fn write_checkpoint(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_state (id, last_run_at) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET last_run_at = excluded.last_run_at
            "#,
        )
        .bind(CHECKPOINT_ID)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cluster_recent_detections(&self, params: &ClusterParams) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cluster_requests (eps_meters, min_points, since, requested_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(params.eps_meters)
        .bind(params.min_samples as i64)
        .bind(params.since.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn points_in_bbox(
        &self,
        bbox: &BoundingBox,
        limit: i64,
    ) -> Result<Vec<PointRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT point_key, image_id, lat, lon, captured_at, feature_class, confidence, image_url
            FROM hazard_points
            WHERE lat >= ? AND lat <= ? AND lon >= ? AND lon <= ?
            ORDER BY captured_at DESC, point_key
            LIMIT ?
            "#,
        )
        .bind(bbox.lat_min)
        .bind(bbox.lat_max)
        .bind(bbox.lon_min)
        .bind(bbox.lon_max)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PointRecord {
                    point_key: row.get("point_key"),
                    image_id: row.get("image_id"),
                    lat: row.get("lat"),
                    lon: row.get("lon"),
                    captured_at: millis_to_utc(row.get("captured_at"))?,
                    feature_class: row.get("feature_class"),
                    confidence: row.get("confidence"),
                    image_url: row.get("image_url"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;
    use crate::models::{point_key, GeoPoint};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::BTreeMap;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn point(image: &str, class: &str, lat: f64, lon: f64) -> PointRecord {
        let p = GeoPoint::new(lat, lon);
        PointRecord {
            point_key: point_key(image, class, &p),
            image_id: image.to_string(),
            lat,
            lon,
            captured_at: Utc.timestamp_millis_opt(1_704_067_200_000).unwrap(),
            feature_class: class.to_string(),
            confidence: None,
            image_url: Some(format!("https://img.example/{}.jpg", image)),
        }
    }

    fn area() -> BoundingBox {
        BoundingBox {
            lat_min: 13.0,
            lon_min: 80.0,
            lat_max: 13.1,
            lon_max: 80.3,
        }
    }

    #[tokio::test]
    async fn point_upsert_is_idempotent() {
        let s = store().await;
        let batch = vec![
            point("a", "pothole", 13.05, 80.24),
            point("a", "manhole", 13.05, 80.24),
            point("b", "pothole", 13.06, 80.25),
        ];

        s.upsert_points(&batch).await.unwrap();
        s.upsert_points(&batch).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hazard_points")
            .fetch_one(s.pool())
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn invalid_point_rejects_whole_batch() {
        let s = store().await;
        let batch = vec![point("a", "pothole", 13.05, 80.24), point("b", "pothole", f64::NAN, 80.0)];

        let err = s.upsert_points(&batch).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));
        assert!(s.points_in_bbox(&area(), 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bbox_query_is_inclusive() {
        let s = store().await;
        s.upsert_points(&[
            point("edge", "pothole", 13.0, 80.0),
            point("inside", "pothole", 13.05, 80.1),
            point("outside", "pothole", 13.2, 80.1),
        ])
        .await
        .unwrap();

        let found = s.points_in_bbox(&area(), 100).await.unwrap();
        let mut ids: Vec<_> = found.iter().map(|p| p.image_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["edge", "inside"]);
        assert_eq!(found[0].captured_at.timestamp_millis(), 1_704_067_200_000);
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_keeps_single_row() {
        let s = store().await;
        assert!(s.read_checkpoint().await.unwrap().is_none());

        let first = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let second = Utc.timestamp_millis_opt(1_710_000_000_000).unwrap();
        s.write_checkpoint(first).await.unwrap();
        s.write_checkpoint(second).await.unwrap();

        assert_eq!(s.read_checkpoint().await.unwrap(), Some(second));
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingestion_state")
            .fetch_one(s.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn way_upsert_replaces_by_id() {
        let s = store().await;
        let mut tags = BTreeMap::new();
        tags.insert("highway".to_string(), "primary".to_string());
        let mut way = WayRecord {
            way_id: 42,
            vertices: vec![GeoPoint::new(13.05, 80.24), GeoPoint::new(13.051, 80.241)],
            highway: "primary".to_string(),
            tags,
        };
        s.upsert_ways(std::slice::from_ref(&way)).await.unwrap();
        way.highway = "secondary".to_string();
        s.upsert_ways(&[way]).await.unwrap();

        let row = sqlx::query("SELECT highway, geometry_json FROM osm_ways WHERE way_id = 42")
            .fetch_one(s.pool())
            .await
            .unwrap();
        let highway: String = row.get("highway");
        let geometry: String = row.get("geometry_json");
        assert_eq!(highway, "secondary");
        assert!(geometry.contains("LineString"));
    }

    #[tokio::test]
    async fn cluster_trigger_enqueues_request() {
        let s = store().await;
        let params = ClusterParams {
            eps_meters: 15.0,
            min_samples: 2,
            since: Utc.timestamp_millis_opt(1_704_067_200_000).unwrap(),
        };
        s.cluster_recent_detections(&params).await.unwrap();

        let row = sqlx::query("SELECT eps_meters, min_points, status FROM cluster_requests")
            .fetch_one(s.pool())
            .await
            .unwrap();
        let eps: f64 = row.get("eps_meters");
        let min_points: i64 = row.get("min_points");
        let status: String = row.get("status");
        assert_eq!(eps, 15.0);
        assert_eq!(min_points, 2);
        assert_eq!(status, "pending");
    }
}
