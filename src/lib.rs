//! Racing warehouse sync.
//!
//! Mirrors a third-party horse-racing REST API into a PostgreSQL warehouse
//! and maintains derived statistics tables: a rate-limited, retrying,
//! resumable ingestion pipeline (racecards, results, reference data), an
//! entity extraction and enrichment layer for the horse graph, a
//! checkpointed ten-year backfill engine, and a family of idempotent
//! statistics calculators.

pub mod config;
pub mod db;
pub mod errors;
pub mod helpers;
pub mod services;
pub mod stats;
