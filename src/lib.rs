//! # metaloader
//!
//! Ingestion core for Metabolomics Workbench study files.
//!
//! Files are registered once per unique content (SHA-256 + size), mwTab
//! exports are parsed into studies, analyses, samples, sample factors,
//! features and measurements, and those entities are upserted into SQLite
//! idempotently: re-ingesting or re-parsing the same input changes nothing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────┐   ┌───────────┐   ┌────────┐
//! │ registry │──▶│  mwtab   │──▶│normalize│──▶│  upsert   │──▶│ SQLite │
//! │hash+dedup│   │ (parse)  │   │ (uids)  │   │ (chunks)  │   │        │
//! └──────────┘   └──────────┘   └─────────┘   └───────────┘   └────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! metaloader init
//! metaloader ingest-dir ./downloads --notes "ST000315 batch"
//! metaloader parse import <IMPORT_ID>
//! metaloader export --study ST000315 --output ./out/ST000315.json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error kinds, warnings and stage reports |
//! | [`hashing`] | Streaming content fingerprints |
//! | [`detect`] | File type detection |
//! | [`imports`] | Import batch records |
//! | [`registry`] | Content-addressed file registry |
//! | [`scan`] | Directory discovery |
//! | [`mwtab`] | mwTab parser |
//! | [`normalize`] | Document → entity rows |
//! | [`upsert`] | Chunked idempotent writes |
//! | [`pipeline`] | Per-file and per-batch orchestration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod config;
pub mod db;
pub mod detect;
pub mod error;
pub mod export;
pub mod hashing;
pub mod imports;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod mwtab;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod scan;
pub mod stats;
pub mod upsert;
