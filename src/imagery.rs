//! Imagery metadata stage.
//!
//! Walks the provider's `paging.next` cursor chain for images captured in
//! the area since a given instant. Pages are fetched one at a time with a
//! fixed pause between them.
//!
//! # Partial results
//!
//! A page that still fails after retries ends the walk. If at least one
//! page was already retrieved, the images gathered so far are returned as
//! a success; if the very first page fails there is nothing to keep and
//! the stage reports [`ImageryError::PartialData`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::config::Config;
use crate::error::ImageryError;
use crate::http::{HttpClient, HttpRequest};
use crate::models::{BoundingBox, ImageRecord, PointGeometry, ProviderTime};

const IMAGE_FIELDS: &str = "id,geometry,captured_at,sequence,thumb_256_url";

// ═══════════════════════════════════════════════════════════════════════
// Wire schema
// ═══════════════════════════════════════════════════════════════════════

/// Items stay raw here so one malformed image cannot fail its whole page;
/// each is decoded as a [`WireImage`] in [`accept_page`].
#[derive(Debug, Deserialize)]
pub(crate) struct ImagePage {
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireImage {
    id: String,
    geometry: PointGeometry,
    captured_at: ProviderTime,
    #[serde(default)]
    sequence: Option<String>,
    #[serde(default)]
    thumb_256_url: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Stage
// ═══════════════════════════════════════════════════════════════════════

/// Images gathered by [`fetch_images`].
#[derive(Debug, Default)]
pub struct ImageryFetch {
    /// In original page order.
    pub images: Vec<ImageRecord>,
    pub pages: usize,
    /// Set when a later page failed and the walk stopped early.
    pub truncated: bool,
    /// Images dropped at the boundary (bad timestamp, bad or out-of-area point).
    pub rejected: usize,
}

/// `start_captured_at` wants whole seconds with a `Z` suffix.
pub fn format_since(since: DateTime<Utc>) -> String {
    since.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// URL of the first page; later pages come from `paging.next`.
pub fn first_page_url(config: &Config, since: DateTime<Utc>) -> String {
    format!(
        "{}/images?fields={}&bbox={}&start_captured_at={}&limit={}&access_token={}",
        config.imagery.base_url.trim_end_matches('/'),
        IMAGE_FIELDS,
        config.area.to_lon_lat(),
        format_since(since),
        config.imagery.page_limit,
        config.imagery.token(),
    )
}

/// Fetch every image captured inside the area at or after `since`.
pub async fn fetch_images(
    config: &Config,
    http: &HttpClient,
    since: DateTime<Utc>,
) -> Result<ImageryFetch, ImageryError> {
    let page_delay = Duration::from_millis(config.imagery.page_delay_ms);
    let mut result = ImageryFetch::default();
    let mut next_url = Some(first_page_url(config, since));
    let mut page_number = 1;

    tracing::info!(
        bbox = %config.area.to_lon_lat(),
        since = %format_since(since),
        "fetching imagery"
    );

    while let Some(url) = next_url.take() {
        let page: ImagePage = match http
            .fetch_json(&HttpRequest::get(url), config.http.max_attempts)
            .await
        {
            Ok(page) => page,
            Err(e) if result.pages > 0 => {
                tracing::warn!(
                    page = page_number,
                    images = result.images.len(),
                    error = %e,
                    "imagery page failed, continuing with partial results"
                );
                result.truncated = true;
                break;
            }
            Err(e) => {
                return Err(ImageryError::PartialData {
                    page: page_number,
                    source: e,
                })
            }
        };

        let (images, rejected) = accept_page(page.data, &config.area);
        result.pages += 1;
        result.rejected += rejected;
        result.images.extend(images);

        tracing::info!(
            page = page_number,
            total = result.images.len(),
            "imagery page retrieved"
        );

        next_url = page.paging.and_then(|p| p.next).filter(|n| !n.is_empty());
        page_number += 1;

        if next_url.is_some() && !page_delay.is_zero() {
            tokio::time::sleep(page_delay).await;
        }
    }

    if result.rejected > 0 {
        tracing::info!(rejected = result.rejected, "dropped unusable or out-of-area images");
    }
    Ok(result)
}

/// Normalize one page, dropping images that cannot be placed in the area.
fn accept_page(data: Vec<serde_json::Value>, area: &BoundingBox) -> (Vec<ImageRecord>, usize) {
    let mut rejected = 0;
    let mut images = Vec::with_capacity(data.len());

    for item in data {
        let wire: WireImage = match serde_json::from_value(item) {
            Ok(w) => w,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed image");
                rejected += 1;
                continue;
            }
        };
        let point = wire.geometry.to_point();
        let captured_at = match wire.captured_at.to_utc() {
            Some(t) if point.is_valid() && area.contains(&point) => t,
            _ => {
                rejected += 1;
                continue;
            }
        };
        images.push(ImageRecord {
            id: wire.id,
            point,
            captured_at,
            sequence_id: wire.sequence,
            thumbnail_url: wire.thumb_256_url,
        });
    }

    (images, rejected)
}
