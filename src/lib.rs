//! Deployment Manager Library
//!
//! Orchestrates application deployments across local process, container,
//! cloud and static-site targets.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod logs;
pub mod logstream;
pub mod registry;
pub mod storage;
pub mod telemetry;
pub mod workers;
