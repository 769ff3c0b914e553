//! Error conversions at the crate boundary

pub mod conversions;

pub use conversions::InfraError;
