mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tempfile::TempDir;

use common::{config_toml, image_json, overpass_body, spawn_server};

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hazard-ingest"))
}

fn setup_test_env(base: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let db_path = root.join("data").join("hazards.sqlite");
    let config_path = config_dir.join("hazards.toml");
    fs::write(&config_path, config_toml(base, db_path.to_str().unwrap())).unwrap();

    (tmp, config_path)
}

fn run_cli(config_path: &Path, args: &[&str]) -> (String, String, i32) {
    let binary = binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("MAPILLARY_API_KEY")
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code().unwrap_or(-1))
}

async fn run_cli_async(config_path: PathBuf, args: Vec<&'static str>) -> (String, String, i32) {
    tokio::task::spawn_blocking(move || run_cli(&config_path, &args))
        .await
        .unwrap()
}

async fn mock_provider() -> String {
    let router = Router::new()
        .route("/api/interpreter", post(|| async { Json(overpass_body(2)) }))
        .route(
            "/images",
            get(|| async { Json(json!({ "data": [image_json("img-1", 1), image_json("img-2", 2)] })) }),
        )
        .route(
            "/{image_id}/detections",
            get(|| async {
                Json(json!({ "data": [{ "id": "d", "value": "construction--flat--pothole" }] }))
            }),
        );
    spawn_server(router).await
}

#[test]
fn init_creates_database() {
    let (tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (stdout, stderr, code) = run_cli(&config_path, &["init"]);
    assert_eq!(code, 0, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("hazards.sqlite").exists());
}

#[test]
fn init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (_, _, first) = run_cli(&config_path, &["init"]);
    assert_eq!(first, 0, "First init failed");
    let (_, _, second) = run_cli(&config_path, &["init"]);
    assert_eq!(second, 0, "Second init failed (not idempotent)");
}

#[test]
fn missing_access_token_is_a_config_error() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    let content = fs::read_to_string(&config_path)
        .unwrap()
        .replace("access_token = \"MLY|test\"\n", "");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, code) = run_cli(&config_path, &["run"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("MAPILLARY_API_KEY"), "stderr={}", stderr);
}

#[tokio::test(flavor = "multi_thread")]
async fn run_then_stats() {
    let base = mock_provider().await;
    let (_tmp, config_path) = setup_test_env(&base);

    let (stdout, stderr, code) = run_cli_async(config_path.clone(), vec!["run"]).await;
    assert_eq!(code, 0, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("roads: ok (2 ways)"), "stdout={}", stdout);
    assert!(stdout.contains("clustering: ok"));
    assert!(stdout.contains("checkpoint: written"));
    assert!(stdout.trim_end().ends_with("ok"));

    let (stdout, _, code) = run_cli_async(config_path, vec!["stats"]).await;
    assert_eq!(code, 0);
    assert!(stdout.contains("Ways:        2"), "stdout={}", stdout);
    assert!(stdout.contains("Points:      2 (from 2 images)"), "stdout={}", stdout);
    assert!(stdout.contains("construction--flat--pothole"));
    assert!(stdout.contains("1 pending"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_providers_exit_nonzero() {
    // Nothing listens on the discard port.
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (stdout, _, code) =
        run_cli_async(config_path, vec!["run", "--force-start-date", "2024-01-01T00:00:00Z"]).await;
    assert_eq!(code, 1, "stdout={}", stdout);
    assert!(stdout.contains("forced backfill"));
    assert!(stdout.contains("clustering: skipped"));
    assert!(stdout.contains("checkpoint: unchanged"));
}
