//! Per-image detection lookups.
//!
//! Images are processed in fixed-size batches: every image in a batch is
//! looked up concurrently, the whole batch is awaited, then the stage pauses
//! before starting the next one. A lookup that fails resolves to
//! [`DetectionLookup::Empty`] and never affects its siblings.

use futures::future::join_all;
use serde::de::IgnoredAny;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::Config;
use crate::http::{HttpClient, HttpRequest};
use crate::models::{DetectionRecord, ImageRecord, PointGeometry, ProviderTime};

const DETECTION_FIELDS: &str = "id,value,created_at,geometry";

// ═══════════════════════════════════════════════════════════════════════
// Wire schema
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct DetectionPage {
    #[serde(default)]
    data: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    geometry: Option<WireDetectionGeometry>,
    #[serde(default)]
    created_at: Option<ProviderTime>,
}

/// Detections either carry a GeoJSON point or some other shape (usually the
/// provider's encoded pixel-space mask). Only a point can place a detection
/// on the map; anything else is skipped without being decoded.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireDetectionGeometry {
    Point(PointGeometry),
    Other(IgnoredAny),
}

// ═══════════════════════════════════════════════════════════════════════
// Stage
// ═══════════════════════════════════════════════════════════════════════

/// Outcome of looking up one image.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionLookup {
    Detections(Vec<DetectionRecord>),
    Empty(EmptyReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmptyReason {
    /// The provider answered with no detections.
    NoneReported,
    /// The lookup failed; the message is kept for the debug log only.
    FetchFailed(String),
}

impl DetectionLookup {
    pub fn detections(&self) -> &[DetectionRecord] {
        match self {
            DetectionLookup::Detections(d) => d,
            DetectionLookup::Empty(_) => &[],
        }
    }
}

/// Counters for observability only; nothing branches on them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DetectionStats {
    pub images_processed: usize,
    pub images_with_detections: usize,
    pub total_detections: usize,
    pub images_failed: usize,
}

/// Detections for every input image, keyed by image id.
#[derive(Debug, Default)]
pub struct DetectionResults {
    pub by_image: HashMap<String, DetectionLookup>,
    pub stats: DetectionStats,
}

impl DetectionResults {
    pub fn for_image(&self, image_id: &str) -> &[DetectionRecord] {
        self.by_image
            .get(image_id)
            .map(DetectionLookup::detections)
            .unwrap_or(&[])
    }

    pub fn has_any(&self) -> bool {
        self.stats.total_detections > 0
    }
}

pub fn detections_url(config: &Config, image_id: &str) -> String {
    format!(
        "{}/{}/detections?fields={}&access_token={}",
        config.imagery.base_url.trim_end_matches('/'),
        image_id,
        DETECTION_FIELDS,
        config.imagery.token(),
    )
}

/// Look up detections for a single image. Never fails.
pub async fn fetch_image_detections(
    config: &Config,
    http: &HttpClient,
    image_id: &str,
) -> DetectionLookup {
    let request = HttpRequest::get(detections_url(config, image_id));
    match http
        .fetch_json::<DetectionPage>(&request, config.imagery.detection_attempts)
        .await
    {
        Ok(page) => {
            let detections: Vec<DetectionRecord> = page
                .data
                .into_iter()
                .map(|d| to_record(image_id, d))
                .collect();
            if detections.is_empty() {
                DetectionLookup::Empty(EmptyReason::NoneReported)
            } else {
                DetectionLookup::Detections(detections)
            }
        }
        Err(e) => {
            tracing::debug!(image_id, error = %e, "detection lookup failed");
            DetectionLookup::Empty(EmptyReason::FetchFailed(e.to_string()))
        }
    }
}

fn to_record(image_id: &str, wire: WireDetection) -> DetectionRecord {
    let point = match wire.geometry {
        Some(WireDetectionGeometry::Point(g)) => Some(g.to_point()),
        Some(WireDetectionGeometry::Other(_)) | None => None,
    };
    DetectionRecord {
        image_id: image_id.to_string(),
        feature_class: wire.value,
        point,
        created_at: wire.created_at.and_then(|t| t.to_utc()),
    }
}

/// Look up detections for all `images` in concurrency-bounded batches.
pub async fn fetch_all_detections(
    config: &Config,
    http: &HttpClient,
    images: &[ImageRecord],
) -> DetectionResults {
    let batch_size = config.imagery.detection_concurrency.max(1);
    let batch_delay = Duration::from_millis(config.imagery.detection_batch_delay_ms);
    let total_batches = images.len().div_ceil(batch_size);
    let mut results = DetectionResults::default();

    tracing::info!(
        images = images.len(),
        batch_size,
        "fetching detections"
    );

    for (index, batch) in images.chunks(batch_size).enumerate() {
        let lookups = join_all(batch.iter().map(|image| async move {
            let lookup = fetch_image_detections(config, http, &image.id).await;
            (image.id.clone(), lookup)
        }))
        .await;

        for (image_id, lookup) in lookups {
            let stats = &mut results.stats;
            stats.images_processed += 1;
            match &lookup {
                DetectionLookup::Detections(d) => {
                    stats.images_with_detections += 1;
                    stats.total_detections += d.len();
                }
                DetectionLookup::Empty(EmptyReason::FetchFailed(_)) => stats.images_failed += 1,
                DetectionLookup::Empty(EmptyReason::NoneReported) => {}
            }
            results.by_image.insert(image_id, lookup);
        }

        tracing::info!(
            batch = index + 1,
            total_batches,
            processed = results.stats.images_processed,
            with_detections = results.stats.images_with_detections,
            detections = results.stats.total_detections,
            "detection batch complete"
        );

        if index + 1 < total_batches && !batch_delay.is_zero() {
            tokio::time::sleep(batch_delay).await;
        }
    }

    let s = results.stats;
    let pct = if s.images_processed > 0 {
        s.images_with_detections * 100 / s.images_processed
    } else {
        0
    };
    tracing::info!(
        images = s.images_processed,
        with_detections = s.images_with_detections,
        with_detections_pct = pct,
        detections = s.total_detections,
        failed = s.images_failed,
        "detection summary"
    );

    results
}
