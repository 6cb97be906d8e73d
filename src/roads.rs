//! Road-network stage.
//!
//! Issues one Overpass QL query for the configured highway classes inside
//! the area, converts the returned ways into [`WayRecord`]s, and upserts
//! them in chunks. A failing chunk stops the stage; chunks committed before
//! it stay committed.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::Config;
use crate::error::{FetchError, StoreError};
use crate::http::{HttpClient, HttpRequest};
use crate::models::{BoundingBox, GeoPoint, WayRecord};
use crate::store::{retry_transient, HazardStore};

// ═══════════════════════════════════════════════════════════════════════
// Wire schema
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OverpassElement {
    Way(OverpassWay),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct OverpassWay {
    id: i64,
    #[serde(default)]
    geometry: Vec<Option<OverpassVertex>>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct OverpassVertex {
    lat: f64,
    lon: f64,
}

// ═══════════════════════════════════════════════════════════════════════
// Stage
// ═══════════════════════════════════════════════════════════════════════

/// Result of the road stage.
#[derive(Debug)]
pub enum RoadOutcome {
    Stored { ways: usize, discarded: usize },
    FetchFailed(FetchError),
    NoWays,
    StoreFailed {
        chunk: usize,
        committed: usize,
        error: StoreError,
    },
}

impl RoadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RoadOutcome::Stored { .. })
    }
}

/// Build the Overpass QL query for `classes` inside `bbox`.
pub fn build_query(bbox: &BoundingBox, classes: &[String], timeout_secs: u64) -> String {
    format!(
        "[out:json][timeout:{}];(way[\"highway\"~\"^({})$\"]({}););out geom;",
        timeout_secs,
        classes.join("|"),
        bbox.to_overpass()
    )
}

/// Decode an Overpass response body into way records.
///
/// Returns the usable ways and the number of ways discarded for having
/// fewer than two (valid) vertices.
pub fn parse_ways(body: &str) -> Result<(Vec<WayRecord>, usize), serde_json::Error> {
    let response: OverpassResponse = serde_json::from_str(body)?;
    Ok(to_records(response))
}

fn to_records(response: OverpassResponse) -> (Vec<WayRecord>, usize) {
    let mut discarded = 0;
    let mut records = Vec::new();

    for element in response.elements {
        let way = match element {
            OverpassElement::Way(way) => way,
            OverpassElement::Other => continue,
        };

        let vertices: Option<Vec<GeoPoint>> = way
            .geometry
            .iter()
            .map(|v| {
                v.as_ref()
                    .map(|v| GeoPoint::new(v.lat, v.lon))
                    .filter(GeoPoint::is_valid)
            })
            .collect();

        match vertices {
            Some(vertices) if vertices.len() >= 2 => {
                let highway = way
                    .tags
                    .get("highway")
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                records.push(WayRecord {
                    way_id: way.id,
                    vertices,
                    highway,
                    tags: way.tags,
                });
            }
            _ => discarded += 1,
        }
    }

    (records, discarded)
}

/// Fetch the road network for the configured area and store it.
pub async fn fetch_and_store_ways(
    config: &Config,
    http: &HttpClient,
    store: &dyn HazardStore,
) -> RoadOutcome {
    let query = build_query(
        &config.area,
        &config.roads.highway_classes,
        config.roads.query_timeout_secs,
    );
    let request = HttpRequest::post_text(&config.roads.overpass_url, query);

    tracing::info!(classes = config.roads.highway_classes.len(), "fetching road network");

    let response: OverpassResponse = match http
        .fetch_json(&request, config.roads.max_attempts)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "road network fetch failed");
            return RoadOutcome::FetchFailed(e);
        }
    };

    let (ways, discarded) = to_records(response);
    if discarded > 0 {
        tracing::debug!(discarded, "discarded ways with fewer than two vertices");
    }
    if ways.is_empty() {
        tracing::warn!("road network response contained no usable ways");
        return RoadOutcome::NoWays;
    }
    tracing::info!(ways = ways.len(), "road network fetched");

    let retry_delay = Duration::from_millis(config.store.retry_base_delay_ms);
    let mut committed = 0;

    for (index, chunk) in ways.chunks(config.roads.chunk_size).enumerate() {
        let result = retry_transient(
            "upsert ways",
            config.store.max_attempts,
            retry_delay,
            || store.upsert_ways(chunk),
        )
        .await;

        if let Err(error) = result {
            tracing::error!(
                chunk = index + 1,
                committed,
                error = %error,
                "road chunk upsert failed, aborting stage"
            );
            return RoadOutcome::StoreFailed {
                chunk: index + 1,
                committed,
                error,
            };
        }
        committed += chunk.len();
    }

    tracing::info!(ways = committed, "road network stored");
    RoadOutcome::Stored {
        ways: committed,
        discarded,
    }
}
