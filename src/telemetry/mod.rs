//! # Telemetry Module
//!
//! Turns boiler snapshots into JSON lines.
//!
//! This module handles:
//! - Filtering snapshot fields by the enabled sensors
//! - Stamping each line with a UTC timestamp
//! - Emitting lines on the `telemetry` tracing target

pub mod reporter;

pub use reporter::SnapshotReporter;
