//! Propsd server: HTTP API over the composition pipeline.

pub mod api;
pub mod conqueso;
pub mod settings;
pub mod telemetry;
