//! Point record building and storage.
//!
//! Turns detections into [`PointRecord`]s and upserts them in chunks. The
//! stage is at-least-once: a failing chunk stops it, chunks committed
//! before that stay in the store, and a re-run upserts the same keys again.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::Config;
use crate::detections::DetectionResults;
use crate::error::StoreError;
use crate::models::{point_key, BoundingBox, ImageRecord, PointRecord};
use crate::store::{retry_transient, HazardStore};

/// How many feature classes the histogram log line lists.
const TOP_CLASSES: usize = 15;

/// Records built from one run's detections.
#[derive(Debug, Default)]
pub struct BuiltRecords {
    pub records: Vec<PointRecord>,
    /// Detections without a feature class.
    pub unclassified: usize,
    /// Detections whose resolved point was invalid or outside the area.
    pub out_of_area: usize,
}

/// Result of the store stage.
#[derive(Debug)]
pub enum StoreOutcome {
    Stored { records: usize },
    /// Detections existed but none could become a record.
    NoQualifyingDetections,
    StoreFailed {
        chunk: usize,
        committed: usize,
        error: StoreError,
    },
}

/// Build point records for every classified detection.
///
/// A detection's own point wins; otherwise the parent image's point is
/// used. Images keep their input order, detections keep provider order.
pub fn build_records(
    images: &[ImageRecord],
    detections: &DetectionResults,
    area: &BoundingBox,
) -> BuiltRecords {
    let mut built = BuiltRecords::default();

    for image in images {
        for detection in detections.for_image(&image.id) {
            let feature_class = match detection.feature_class.as_deref() {
                Some(class) if !class.trim().is_empty() => class,
                _ => {
                    built.unclassified += 1;
                    continue;
                }
            };

            let point = detection.point.unwrap_or(image.point);
            if !point.is_valid() || !area.contains(&point) {
                built.out_of_area += 1;
                continue;
            }

            built.records.push(PointRecord {
                point_key: point_key(&image.id, feature_class, &point),
                image_id: image.id.clone(),
                lat: point.lat,
                lon: point.lon,
                captured_at: image.captured_at,
                feature_class: feature_class.to_string(),
                confidence: None,
                image_url: image.thumbnail_url.clone(),
            });
        }
    }

    built
}

/// Feature classes by descending count, ties broken by name.
pub fn class_histogram(records: &[PointRecord]) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for r in records {
        *counts.entry(r.feature_class.as_str()).or_insert(0) += 1;
    }
    let mut hist: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(class, n)| (class.to_string(), n))
        .collect();
    hist.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    hist
}

/// Build records from `detections` and upsert them in chunks.
pub async fn store_detections(
    config: &Config,
    store: &dyn HazardStore,
    images: &[ImageRecord],
    detections: &DetectionResults,
) -> StoreOutcome {
    let built = build_records(images, detections, &config.area);
    if built.unclassified > 0 || built.out_of_area > 0 {
        tracing::debug!(
            unclassified = built.unclassified,
            out_of_area = built.out_of_area,
            "skipped detections"
        );
    }

    if built.records.is_empty() {
        tracing::warn!("no qualifying detections to store");
        return StoreOutcome::NoQualifyingDetections;
    }

    let hist = class_histogram(&built.records);
    for (class, count) in hist.iter().take(TOP_CLASSES) {
        tracing::info!(feature_class = %class, count, "detection type");
    }
    if hist.len() > TOP_CLASSES {
        tracing::info!(more = hist.len() - TOP_CLASSES, "further detection types");
    }

    upsert_in_chunks(config, store, &built.records).await
}

/// Upsert `records` chunk by chunk, each chunk retried as a whole on
/// transient errors.
pub async fn upsert_in_chunks(
    config: &Config,
    store: &dyn HazardStore,
    records: &[PointRecord],
) -> StoreOutcome {
    let retry_delay = Duration::from_millis(config.store.retry_base_delay_ms);
    let mut committed = 0;

    tracing::info!(records = records.len(), "storing detections");

    for (index, chunk) in records.chunks(config.store.chunk_size).enumerate() {
        let result = retry_transient(
            "upsert points",
            config.store.max_attempts,
            retry_delay,
            || store.upsert_points(chunk),
        )
        .await;

        if let Err(error) = result {
            tracing::error!(
                chunk = index + 1,
                committed,
                error = %error,
                "point chunk upsert failed, aborting stage"
            );
            return StoreOutcome::StoreFailed {
                chunk: index + 1,
                committed,
                error,
            };
        }
        committed += chunk.len();
    }

    tracing::info!(records = committed, "detections stored");
    StoreOutcome::Stored { records: committed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detections::{DetectionLookup, EmptyReason};
    use crate::models::{DetectionRecord, GeoPoint};
    use chrono::{TimeZone, Utc};

    fn area() -> BoundingBox {
        BoundingBox {
            lat_min: 13.035,
            lon_min: 80.225,
            lat_max: 13.065,
            lon_max: 80.255,
        }
    }

    fn image(id: &str, lat: f64, lon: f64) -> ImageRecord {
        ImageRecord {
            id: id.to_string(),
            point: GeoPoint::new(lat, lon),
            captured_at: Utc.timestamp_millis_opt(1_704_067_200_000).unwrap(),
            sequence_id: None,
            thumbnail_url: Some(format!("https://thumbs.example/{}.jpg", id)),
        }
    }

    fn detection(image_id: &str, class: Option<&str>, point: Option<GeoPoint>) -> DetectionRecord {
        DetectionRecord {
            image_id: image_id.to_string(),
            feature_class: class.map(str::to_string),
            point,
            created_at: None,
        }
    }

    fn results(entries: Vec<(&str, DetectionLookup)>) -> DetectionResults {
        let mut r = DetectionResults::default();
        for (id, lookup) in entries {
            r.stats.total_detections += lookup.detections().len();
            r.by_image.insert(id.to_string(), lookup);
        }
        r
    }

    #[test]
    fn detection_point_wins_over_image_point() {
        let images = vec![image("a", 13.05, 80.24)];
        let own = GeoPoint::new(13.0501, 80.2402);
        let dets = results(vec![(
            "a",
            DetectionLookup::Detections(vec![
                detection("a", Some("pothole"), Some(own)),
                detection("a", Some("manhole"), None),
            ]),
        )]);

        let built = build_records(&images, &dets, &area());
        assert_eq!(built.records.len(), 2);
        assert_eq!(built.records[0].point(), own);
        assert_eq!(built.records[1].point(), GeoPoint::new(13.05, 80.24));
        assert_eq!(
            built.records[1].image_url.as_deref(),
            Some("https://thumbs.example/a.jpg")
        );
        assert!(built.records.iter().all(|r| r.confidence.is_none()));
    }

    #[test]
    fn unclassified_and_out_of_area_are_skipped() {
        let images = vec![image("a", 13.05, 80.24), image("b", 13.06, 80.25)];
        let dets = results(vec![
            (
                "a",
                DetectionLookup::Detections(vec![
                    detection("a", None, None),
                    detection("a", Some("  "), None),
                    detection("a", Some("pothole"), Some(GeoPoint::new(14.0, 80.24))),
                ]),
            ),
            ("b", DetectionLookup::Empty(EmptyReason::FetchFailed("timeout".to_string()))),
        ]);

        let built = build_records(&images, &dets, &area());
        assert!(built.records.is_empty());
        assert_eq!(built.unclassified, 2);
        assert_eq!(built.out_of_area, 1);
    }

    #[test]
    fn built_points_stay_inside_area() {
        let b = area();
        let images = vec![image("edge", b.lat_min, b.lon_min)];
        let dets = results(vec![(
            "edge",
            DetectionLookup::Detections(vec![
                detection("edge", Some("pothole"), None),
                detection("edge", Some("crack"), Some(GeoPoint::new(b.lat_max, b.lon_max))),
                detection("edge", Some("crack"), Some(GeoPoint::new(b.lat_max + 1e-6, b.lon_max))),
            ]),
        )]);

        let built = build_records(&images, &dets, &b);
        assert_eq!(built.records.len(), 2);
        assert!(built.records.iter().all(|r| b.contains(&r.point())));
    }

    #[test]
    fn same_class_same_point_shares_key() {
        let images = vec![image("a", 13.05, 80.24)];
        let dets = results(vec![(
            "a",
            DetectionLookup::Detections(vec![
                detection("a", Some("pothole"), None),
                detection("a", Some("pothole"), None),
                detection("a", Some("pothole"), Some(GeoPoint::new(13.051, 80.24))),
            ]),
        )]);

        let built = build_records(&images, &dets, &area());
        assert_eq!(built.records[0].point_key, built.records[1].point_key);
        assert_ne!(built.records[0].point_key, built.records[2].point_key);
    }

    #[test]
    fn histogram_orders_by_count() {
        let images = vec![image("a", 13.05, 80.24)];
        let dets = results(vec![(
            "a",
            DetectionLookup::Detections(vec![
                detection("a", Some("b-class"), Some(GeoPoint::new(13.051, 80.24))),
                detection("a", Some("a-class"), Some(GeoPoint::new(13.052, 80.24))),
                detection("a", Some("b-class"), Some(GeoPoint::new(13.053, 80.24))),
            ]),
        )]);
        let built = build_records(&images, &dets, &area());
        let hist = class_histogram(&built.records);
        assert_eq!(
            hist,
            vec![("b-class".to_string(), 2), ("a-class".to_string(), 1)]
        );
    }
}
