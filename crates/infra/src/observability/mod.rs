//! Observability setup
//!
//! The storage core logs through `tracing` only. Binaries and tests decide
//! whether and how those events are printed by calling
//! [`logging::init_logging`] once at startup.

pub mod logging;

pub use logging::{init_logging, LogFormat};
