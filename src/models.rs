//! Core data types that flow through the ingestion pipeline.
//!
//! Provider-specific wire schemas live next to the fetcher that decodes
//! them; this module holds the normalized records plus the small geometry
//! and timestamp helpers they share.

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Axis-aligned area of interest, fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lon_min: f64,
    pub lat_max: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn validate(&self) -> Result<()> {
        let all = [self.lat_min, self.lon_min, self.lat_max, self.lon_max];
        if all.iter().any(|v| !v.is_finite()) {
            bail!("bounding box values must be finite");
        }
        if self.lat_min >= self.lat_max {
            bail!("lat_min must be < lat_max");
        }
        if self.lon_min >= self.lon_max {
            bail!("lon_min must be < lon_max");
        }
        if self.lat_min < -90.0 || self.lat_max > 90.0 {
            bail!("latitudes must be within [-90, 90]");
        }
        if self.lon_min < -180.0 || self.lon_max > 180.0 {
            bail!("longitudes must be within [-180, 180]");
        }
        Ok(())
    }

    /// Inclusive on every edge.
    pub fn contains(&self, p: &GeoPoint) -> bool {
        p.lat >= self.lat_min && p.lat <= self.lat_max && p.lon >= self.lon_min && p.lon <= self.lon_max
    }

    /// `south,west,north,east`, the order Overpass QL expects.
    pub fn to_overpass(&self) -> String {
        format!(
            "{},{},{},{}",
            self.lat_min, self.lon_min, self.lat_max, self.lon_max
        )
    }

    /// `west,south,east,north`, the order the imagery API expects.
    pub fn to_lon_lat(&self) -> String {
        format!(
            "{},{},{},{}",
            self.lon_min, self.lat_min, self.lon_max, self.lat_max
        )
    }
}

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    pub fn to_wkt(&self) -> String {
        format!("POINT({} {})", self.lon, self.lat)
    }
}

/// GeoJSON point as sent by the imagery provider (`[lon, lat]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum PointGeometry {
    Point { coordinates: [f64; 2] },
}

impl PointGeometry {
    pub fn to_point(&self) -> GeoPoint {
        match self {
            PointGeometry::Point { coordinates } => GeoPoint::new(coordinates[1], coordinates[0]),
        }
    }
}

/// Timestamp field that the provider sends either as epoch milliseconds or as
/// an ISO-8601 string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProviderTime {
    EpochMillis(i64),
    Iso(String),
}

impl ProviderTime {
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            ProviderTime::EpochMillis(ms) => Utc.timestamp_millis_opt(*ms).single(),
            ProviderTime::Iso(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// A road segment from the road-network provider.
#[derive(Debug, Clone, PartialEq)]
pub struct WayRecord {
    pub way_id: i64,
    /// Ordered vertices, at least two.
    pub vertices: Vec<GeoPoint>,
    /// Value of the `highway` tag, `"unknown"` when absent.
    pub highway: String,
    pub tags: BTreeMap<String, String>,
}

impl WayRecord {
    /// GeoJSON `LineString` with `[lon, lat]` positions.
    pub fn geometry_json(&self) -> String {
        let coords: Vec<[f64; 2]> = self.vertices.iter().map(|p| [p.lon, p.lat]).collect();
        serde_json::json!({ "type": "LineString", "coordinates": coords }).to_string()
    }

    pub fn tags_json(&self) -> String {
        serde_json::to_string(&self.tags).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Image metadata. Only used to drive detection lookups; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: String,
    pub point: GeoPoint,
    pub captured_at: DateTime<Utc>,
    pub sequence_id: Option<String>,
    pub thumbnail_url: Option<String>,
}

/// An object detection attached to an image.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub image_id: String,
    pub feature_class: Option<String>,
    pub point: Option<GeoPoint>,
    pub created_at: Option<DateTime<Utc>>,
}

/// A geotagged hazard observation, the unit of storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointRecord {
    /// Idempotency key, see [`point_key`].
    pub point_key: String,
    pub image_id: String,
    pub lat: f64,
    pub lon: f64,
    pub captured_at: DateTime<Utc>,
    pub feature_class: String,
    /// The detection provider reports no score, so this is always `None` today.
    pub confidence: Option<f64>,
    pub image_url: Option<String>,
}

impl PointRecord {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }

    pub fn geometry_wkt(&self) -> String {
        self.point().to_wkt()
    }
}

/// Stable upsert key for a point record.
///
/// Two detections of the same class on the same image that resolve to the
/// same coordinate (to 7 decimal places, ~1cm) are the same observation.
pub fn point_key(image_id: &str, feature_class: &str, point: &GeoPoint) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_id.as_bytes());
    hasher.update(b"|");
    hasher.update(feature_class.as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{:.7}|{:.7}", point.lat, point.lon).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parameters for the external clustering procedure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    pub eps_meters: f64,
    pub min_samples: u32,
    /// Rows captured at or after this instant are the "recent" ones.
    pub since: DateTime<Utc>,
}
