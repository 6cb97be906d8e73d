use anyhow::Result;
use sqlx::SqlitePool;

/// Create every table and index the pipeline writes to. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Road network, keyed by provider way id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS osm_ways (
            way_id INTEGER PRIMARY KEY,
            geometry_json TEXT NOT NULL,
            highway TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '{}',
            fetched_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Hazard observations, keyed by the point idempotency key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hazard_points (
            point_key TEXT PRIMARY KEY,
            image_id TEXT NOT NULL,
            lat REAL NOT NULL,
            lon REAL NOT NULL,
            geom TEXT NOT NULL,
            captured_at INTEGER NOT NULL,
            feature_class TEXT NOT NULL,
            confidence REAL,
            image_url TEXT,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Checkpoint singleton
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_run_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Clustering requests consumed by the external clustering worker
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            eps_meters REAL NOT NULL,
            min_points INTEGER NOT NULL,
            since INTEGER NOT NULL,
            requested_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_hazard_points_lat_lon ON hazard_points(lat, lon)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_hazard_points_captured_at ON hazard_points(captured_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_hazard_points_image_id ON hazard_points(image_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_osm_ways_highway ON osm_ways(highway)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cluster_requests_status ON cluster_requests(status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
