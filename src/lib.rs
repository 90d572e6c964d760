//! release-herald: aggregates anime/manga release events, deduplicates them
//! against persisted state, and delivers email + calendar notifications in
//! planned time-of-day batches without double-sending.

pub mod config;
pub mod db;
pub mod ingest;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod plan_store;
pub mod planner;
pub mod resilience;
