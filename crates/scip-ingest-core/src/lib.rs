//! # SCIP Ingest Core
//!
//! Storage-agnostic logic for turning uploaded SCIP indexes into durable,
//! de-duplicated index state: wire types and a streaming reader, symbol and
//! package extraction, the memory budget, upload buffering, the two-pass
//! correlator, collaborator traits and the upload handler.
//!
//! Concrete stores, source control and process glue live in the
//! `scip-ingest` application crate. [`store::memory`] provides in-memory
//! collaborators for tests.

pub mod budget;
pub mod correlate;
pub mod error;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod handler;
pub mod models;
pub mod pathexistence;
pub mod reader;
pub mod scip;
pub mod store;
pub mod symbol;
