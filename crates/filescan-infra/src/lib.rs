//! Filescan Infrastructure Library
//!
//! Process-level plumbing shared by the worker and the CLI:
//! - Telemetry initialization (tracing subscriber, text or JSON output)
//! - Shutdown signal handling wired to a cancellation token

pub mod shutdown;
pub mod telemetry;

pub use shutdown::{cancel_on_shutdown_signal, shutdown_signal};
pub use telemetry::{init_telemetry, shutdown_telemetry, DEFAULT_LOG_FILTER};
