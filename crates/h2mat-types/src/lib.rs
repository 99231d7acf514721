//! Shared configuration and error types for the `h2mat` engine.
//!
//! This crate is deliberately small: it holds the types that cross the
//! boundary between the engine and its embedders (configuration structs and
//! the error-reporting plumbing), so that tooling can depend on them without
//! pulling in the engine itself.

mod config;
mod error;

pub use config::{CompressionConfig, ConfigError, DistanceMetric, Topology};
pub use error::{DetailedError, ErrorDetail};
