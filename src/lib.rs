//! # Hazard Ingest
//!
//! Scheduled ingestion of road geometry and street-level hazard detections
//! for one fixed geographic area.
//!
//! Each run pulls the drivable road network from an Overpass endpoint and
//! recent imagery with object detections from the Mapillary Graph API,
//! upserts both into SQLite, and then asks the store to cluster the new
//! detections. Runs are incremental: a checkpoint records when the last
//! run finished so the next one only asks for newer imagery.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐                     ┌──────────────┐
//! │ Overpass  │──▶ roads ──────────▶│              │
//! └───────────┘                     │    SQLite    │
//! ┌───────────┐                     │  ways/points │
//! │ Mapillary │──▶ imagery ──▶      │  checkpoint  │
//! │ Graph API │    detections ──▶   │  clustering  │
//! └───────────┘    records ────────▶│              │
//!                                   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! hazard-ingest init                 # create database
//! hazard-ingest run                  # incremental run
//! hazard-ingest run --force-start-date 2024-01-01T00:00:00Z
//! hazard-ingest stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Fetch and store error types |
//! | [`http`] | Retrying HTTP client |
//! | [`roads`] | Overpass road network stage |
//! | [`imagery`] | Paginated image metadata stage |
//! | [`detections`] | Batched per-image detection lookups |
//! | [`records`] | Point record building and storage |
//! | [`store`] | Store trait plus SQLite and in-memory backends |
//! | [`pipeline`] | Run orchestration and report |
//! | [`stats`] | Database statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod detections;
pub mod error;
pub mod http;
pub mod imagery;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod records;
pub mod roads;
pub mod stats;
pub mod store;
