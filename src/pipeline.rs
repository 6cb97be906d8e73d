//! Ingestion run orchestration.
//!
//! One run walks these states in order:
//!
//! ```text
//! ReadCheckpoint → FetchRoads → FetchImages → FetchDetections
//!     → StoreDetections → TriggerClustering → WriteCheckpoint → Done
//! ```
//!
//! The road branch and the imagery branch share no data; either may fail on
//! its own. The run succeeds when at least one of them succeeds. Clustering
//! only follows a successful imagery branch, and the checkpoint is only
//! written outside forced-backfill mode.
//!
//! Stage failures are captured in the returned [`RunReport`]. An unexpected
//! error aborts the remaining stages but still produces a report.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::fmt;

use crate::config::Config;
use crate::detections::{fetch_all_detections, DetectionStats};
use crate::http::HttpClient;
use crate::imagery::{fetch_images, format_since};
use crate::models::ClusterParams;
use crate::records::{store_detections, StoreOutcome};
use crate::roads::{fetch_and_store_ways, RoadOutcome};
use crate::store::HazardStore;

/// Per-invocation overrides on top of the configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Forced backfill start; takes precedence over `ingest.force_start_date`.
    pub force_start_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Incremental,
    ForcedBackfill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    Failed,
    /// Deliberately not run (e.g. clustering after a failed imagery branch).
    Skipped,
    /// Not reached because the run aborted.
    NotRun,
}

impl StageStatus {
    fn from_success(ok: bool) -> Self {
        if ok {
            StageStatus::Succeeded
        } else {
            StageStatus::Failed
        }
    }

    fn label(&self) -> &'static str {
        match self {
            StageStatus::Succeeded => "ok",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::NotRun => "not run",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointStatus {
    Written(DateTime<Utc>),
    Failed(String),
    /// Forced backfill never moves the checkpoint.
    Suppressed,
    NotRun,
}

/// Terminal state of one ingestion run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: RunMode,
    /// Inclusive lower bound on image capture time.
    pub since: Option<DateTime<Utc>>,
    pub roads: StageStatus,
    pub imagery: StageStatus,
    pub clustering: StageStatus,
    pub checkpoint: CheckpointStatus,
    pub ways_stored: usize,
    pub images_found: usize,
    /// Page that ended the imagery walk early, if any.
    pub imagery_failed_page: Option<usize>,
    pub detections: DetectionStats,
    pub points_stored: usize,
    /// Set when an unexpected error aborted the run.
    pub fatal: Option<String>,
}

impl RunReport {
    fn new(mode: RunMode) -> Self {
        Self {
            mode,
            since: None,
            roads: StageStatus::NotRun,
            imagery: StageStatus::NotRun,
            clustering: StageStatus::NotRun,
            checkpoint: CheckpointStatus::NotRun,
            ways_stored: 0,
            images_found: 0,
            imagery_failed_page: None,
            detections: DetectionStats::default(),
            points_stored: 0,
            fatal: None,
        }
    }

    /// Roads or imagery succeeded, and nothing aborted the run.
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
            && (self.roads == StageStatus::Succeeded || self.imagery == StageStatus::Succeeded)
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            RunMode::Incremental => "incremental",
            RunMode::ForcedBackfill => "forced backfill",
        };
        writeln!(f, "ingest ({})", mode)?;
        if let Some(since) = self.since {
            writeln!(f, "  since: {}", format_since(since))?;
        }
        writeln!(f, "  roads: {} ({} ways)", self.roads.label(), self.ways_stored)?;
        write!(f, "  imagery: {} (", self.imagery.label())?;
        if let Some(page) = self.imagery_failed_page {
            write!(f, "partial: page {} failed; ", page)?;
        }
        write!(f, "{} images, ", self.images_found)?;
        if self.detections.images_failed > 0 {
            write!(f, "{} lookups failed, ", self.detections.images_failed)?;
        }
        writeln!(
            f,
            "{} with detections, {} points stored)",
            self.detections.images_with_detections, self.points_stored
        )?;
        writeln!(f, "  clustering: {}", self.clustering.label())?;
        let checkpoint = match &self.checkpoint {
            CheckpointStatus::Written(at) => format!("written {}", format_since(*at)),
            CheckpointStatus::Failed(e) => format!("failed ({})", e),
            CheckpointStatus::Suppressed => "unchanged (forced backfill)".to_string(),
            CheckpointStatus::NotRun => "not run".to_string(),
        };
        writeln!(f, "  checkpoint: {}", checkpoint)?;
        if let Some(ref fatal) = self.fatal {
            writeln!(f, "  fatal: {}", fatal)?;
        }
        write!(
            f,
            "{}",
            if self.is_success() {
                "ok"
            } else {
                "failed"
            }
        )
    }
}

/// Run one ingestion pass against `store`.
///
/// Always returns a report; the caller decides what a failure means for the
/// process.
pub async fn run(config: &Config, store: &dyn HazardStore, options: &RunOptions) -> RunReport {
    let forced = options.force_start_date.or(config.ingest.force_start_date);
    let mode = if forced.is_some() {
        RunMode::ForcedBackfill
    } else {
        RunMode::Incremental
    };
    let mut report = RunReport::new(mode);

    if let Err(e) = run_stages(config, store, forced, &mut report).await {
        let message = format!("{:#}", e);
        tracing::error!(error = %message, "ingestion aborted");
        report.fatal = Some(message);
    }

    tracing::info!(
        roads = report.roads.label(),
        imagery = report.imagery.label(),
        clustering = report.clustering.label(),
        success = report.is_success(),
        "ingestion finished"
    );
    report
}

async fn run_stages(
    config: &Config,
    store: &dyn HazardStore,
    forced: Option<DateTime<Utc>>,
    report: &mut RunReport,
) -> Result<()> {
    // ReadCheckpoint
    let since = match forced {
        Some(start) => {
            tracing::warn!(since = %format_since(start), "forced backfill, checkpoint ignored");
            start
        }
        None => resolve_since(config, store).await,
    };
    report.since = Some(since);

    let http = HttpClient::new(config.http.retry_policy())?;

    // FetchRoads
    let roads = fetch_and_store_ways(config, &http, store).await;
    if let RoadOutcome::Stored { ways, .. } = roads {
        report.ways_stored = ways;
    }
    report.roads = StageStatus::from_success(roads.is_success());

    // FetchImages → FetchDetections → StoreDetections
    let imagery_ok = run_imagery_branch(config, &http, store, since, report).await;
    report.imagery = StageStatus::from_success(imagery_ok);

    // TriggerClustering
    report.clustering = if imagery_ok {
        let params = ClusterParams {
            eps_meters: config.clustering.eps_meters,
            min_samples: config.clustering.min_samples,
            since,
        };
        tracing::info!(
            eps_meters = params.eps_meters,
            min_samples = params.min_samples,
            "triggering clustering"
        );
        match store.cluster_recent_detections(&params).await {
            Ok(()) => StageStatus::Succeeded,
            Err(e) => {
                tracing::error!(error = %e, "clustering trigger failed");
                StageStatus::Failed
            }
        }
    } else {
        tracing::info!("imagery branch failed, clustering skipped");
        StageStatus::Skipped
    };

    // WriteCheckpoint
    report.checkpoint = if forced.is_some() {
        CheckpointStatus::Suppressed
    } else {
        let now = Utc::now();
        match store.write_checkpoint(now).await {
            Ok(()) => CheckpointStatus::Written(now),
            Err(e) => {
                tracing::error!(error = %e, "checkpoint write failed");
                CheckpointStatus::Failed(e.to_string())
            }
        }
    };

    Ok(())
}

/// Stored checkpoint, or the default lookback when there is none.
async fn resolve_since(config: &Config, store: &dyn HazardStore) -> DateTime<Utc> {
    let fallback = || Utc::now() - Duration::days(config.ingest.default_lookback_days);
    match store.read_checkpoint().await {
        Ok(Some(at)) => {
            tracing::info!(since = %format_since(at), "incremental run from checkpoint");
            at
        }
        Ok(None) => {
            let at = fallback();
            tracing::info!(since = %format_since(at), "no checkpoint, using default lookback");
            at
        }
        Err(e) => {
            let at = fallback();
            tracing::warn!(error = %e, since = %format_since(at), "checkpoint unreadable, using default lookback");
            at
        }
    }
}

/// Images → detections → records. Returns the branch's success flag.
async fn run_imagery_branch(
    config: &Config,
    http: &HttpClient,
    store: &dyn HazardStore,
    since: DateTime<Utc>,
    report: &mut RunReport,
) -> bool {
    let fetched = match fetch_images(config, http, since).await {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(error = %e, "imagery fetch failed");
            return false;
        }
    };
    report.images_found = fetched.images.len();
    if fetched.truncated {
        report.imagery_failed_page = Some(fetched.pages + 1);
    }

    if fetched.images.is_empty() {
        tracing::info!("no new images in the area");
        return true;
    }

    let detections = fetch_all_detections(config, http, &fetched.images).await;
    report.detections = detections.stats;

    if !detections.has_any() {
        tracing::info!("no detections for any image yet");
        return true;
    }

    match store_detections(config, store, &fetched.images, &detections).await {
        StoreOutcome::Stored { records } => {
            report.points_stored = records;
            true
        }
        StoreOutcome::StoreFailed { committed, .. } => {
            report.points_stored = committed;
            false
        }
        StoreOutcome::NoQualifyingDetections => false,
    }
}
