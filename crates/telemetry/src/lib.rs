//! Structured logging and the shared Prometheus registry for all
//! Facewatch binaries.

pub mod logging;
pub mod metrics;
