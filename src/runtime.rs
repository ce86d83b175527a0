//! Runtime glue: supervisor configuration, the per-run context handed to the
//! payload, diagnostics hooks, and telemetry.

pub mod config;
pub mod context;
pub mod fault_dump;
pub mod telemetry;
