//! Road-hazard telemetry pipeline: jerk ingestion into a location
//! aggregate, per-region threshold rules, proximity feedback to devices
//! and alert history.

pub mod agent;
pub mod classify;
pub mod config;
pub mod consumer;
pub mod dedupe;
pub mod export;
pub mod history;
pub mod model;
pub mod rules;
pub mod store;
