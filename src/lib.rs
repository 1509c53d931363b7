//! # scip-ingest
//!
//! Turns uploaded SCIP indexes into durable, de-duplicated code
//! intelligence data.
//!
//! The processing logic lives in [`scip_ingest_core`]; this crate supplies
//! the concrete collaborators and the process around it.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌──────────────────────────┐
//! │  enqueue  │──▶│ blob store │──▶│ worker                   │
//! │  (CLI)    │   │ + uploads  │   │ budget ▶ handler ▶ state │
//! └───────────┘   └────────────┘   └────────────┬─────────────┘
//!                                               │
//!                        ┌──────────────────────┤
//!                        ▼                      ▼
//!                 ┌─────────────┐        ┌─────────────┐
//!                 │  documents  │        │  packages   │
//!                 │  (SQLite)   │        │  (SQLite)   │
//!                 └─────────────┘        └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! scip-ingest init
//! scip-ingest enqueue index.scip --repository acme/api --commit <sha>
//! scip-ingest worker --once
//! scip-ingest status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite upload and document stores |
//! | [`blobstore`] | Filesystem blob store |
//! | [`git`] | Source control over local git clones |
//! | [`enqueue`] | Upload enqueueing |
//! | [`worker`] | Worker loop and single-upload processing |
//! | [`status`] | Upload listing |

pub mod blobstore;
pub mod config;
pub mod db;
pub mod enqueue;
pub mod git;
pub mod migrate;
pub mod sqlite_store;
pub mod status;
pub mod worker;
