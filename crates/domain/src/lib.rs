//! # HideSync Domain
//!
//! Configuration, error and constant definitions shared by the HideSync
//! storage stack.
//!
//! ## Architecture
//! - No dependencies on other HideSync crates
//! - Pure data structures, no I/O

pub mod macros;

pub mod config;
pub mod constants;
pub mod errors;

pub use config::*;
pub use errors::*;
