//! Database statistics.
//!
//! Summarizes what previous runs left in the store: way and point counts,
//! the most frequent feature classes, the checkpoint, and clustering
//! requests still waiting for the external worker. Used by
//! `hazard-ingest stats`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Class rows shown in the breakdown.
const CLASS_LIMIT: i64 = 15;

/// Counts gathered from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub ways: i64,
    pub points: i64,
    pub images: i64,
    pub last_run_at_ms: Option<i64>,
    pub pending_cluster_requests: i64,
    /// `(feature_class, count)`, most frequent first.
    pub top_classes: Vec<(String, i64)>,
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<StoreStats> {
    let ways: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM osm_ways")
        .fetch_one(pool)
        .await?;

    let points: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hazard_points")
        .fetch_one(pool)
        .await?;

    let images: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT image_id) FROM hazard_points")
        .fetch_one(pool)
        .await?;

    let last_run_at_ms: Option<i64> =
        sqlx::query_scalar("SELECT last_run_at FROM ingestion_state WHERE id = 1")
            .fetch_optional(pool)
            .await?;

    let pending_cluster_requests: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM cluster_requests WHERE status = 'pending'")
            .fetch_one(pool)
            .await?;

    let class_rows = sqlx::query(
        r#"
        SELECT feature_class, COUNT(*) AS n
        FROM hazard_points
        GROUP BY feature_class
        ORDER BY n DESC, feature_class
        LIMIT ?
        "#,
    )
    .bind(CLASS_LIMIT)
    .fetch_all(pool)
    .await?;

    let top_classes = class_rows
        .iter()
        .map(|row| (row.get("feature_class"), row.get("n")))
        .collect();

    Ok(StoreStats {
        ways,
        points,
        images,
        last_run_at_ms,
        pending_cluster_requests,
        top_classes,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Hazard Ingest — Database Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Ways:        {}", stats.ways);
    println!("  Points:      {} (from {} images)", stats.points, stats.images);
    println!(
        "  Last run:    {}",
        match stats.last_run_at_ms {
            Some(ms) => format_ts_relative(ms / 1000),
            None => "never".to_string(),
        }
    );
    println!("  Clustering:  {} pending", stats.pending_cluster_requests);

    if !stats.top_classes.is_empty() {
        println!();
        println!("  By feature class:");
        println!("  {:<48} {:>8}", "CLASS", "POINTS");
        println!("  {}", "-".repeat(57));
        for (class, n) in &stats.top_classes {
            println!("  {:<48} {:>8}", class, n);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
