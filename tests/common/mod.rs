//! Shared helpers for the integration tests: a local mock provider and a
//! configuration pointed at it.

#![allow(dead_code)]

use axum::Router;
use hazard_ingest::config::{self, Config};

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A validated configuration with short delays, pointed at `base`.
///
/// Overpass is served at `{base}/api/interpreter`, the imagery API at `base`.
pub fn test_config(base: &str, db_path: &str) -> Config {
    let toml = config_toml(base, db_path);
    let cfg: Config = toml::from_str(&toml).unwrap();
    config::validate(&cfg).unwrap();
    cfg
}

pub fn config_toml(base: &str, db_path: &str) -> String {
    format!(
        r#"
[db]
path = "{db_path}"

[area]
lat_min = 13.035
lon_min = 80.225
lat_max = 13.065
lon_max = 80.255

[http]
max_attempts = 3
base_delay_ms = 10
max_delay_ms = 50
timeout_secs = 5

[roads]
overpass_url = "{base}/api/interpreter"
max_attempts = 2

[imagery]
base_url = "{base}"
access_token = "MLY|test"
page_delay_ms = 0
detection_attempts = 2
detection_concurrency = 4
detection_batch_delay_ms = 0

[store]
chunk_size = 2
retry_base_delay_ms = 1
"#
    )
}

/// Overpass response with `n` two-vertex residential ways inside the area.
pub fn overpass_body(n: usize) -> serde_json::Value {
    let elements: Vec<serde_json::Value> = (0..n)
        .map(|i| {
            serde_json::json!({
                "type": "way",
                "id": 1000 + i as i64,
                "geometry": [
                    {"lat": 13.04, "lon": 80.23},
                    {"lat": 13.041, "lon": 80.231 + i as f64 * 0.0001}
                ],
                "tags": {"highway": "residential", "name": format!("Street {}", i)}
            })
        })
        .collect();
    serde_json::json!({ "version": 0.6, "elements": elements })
}

/// One imagery record inside the area.
pub fn image_json(id: &str, i: usize) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "geometry": {"type": "Point", "coordinates": [80.23 + i as f64 * 0.0001, 13.04]},
        "captured_at": 1_704_067_200_000i64 + i as i64 * 1000,
        "sequence": "seq-1",
        "thumb_256_url": format!("https://thumbs.example/{}.jpg", id)
    })
}
