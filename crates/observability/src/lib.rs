//! Tracing setup shared by the pipeline binaries.

/// Install the process-wide subscriber from `RUST_LOG` / `LOG_FORMAT`.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init();
}

pub mod tracing;

pub use crate::tracing::{LogFormat, TracingConfig};
