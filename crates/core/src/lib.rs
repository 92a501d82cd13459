//! Core functionality shared by the tokensign crates.
//!
//! This crate provides the error taxonomy, configuration, logging and small
//! helper types used across the workspace. It has no cryptographic or I/O
//! behaviour of its own beyond reading the configuration file.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{
    Config, ConfigError, DecryptorConfig, KdfConfig, KeyConfig, MarkerCriteria, MediumConfig,
    MountRoot, TokenConfig,
};
pub use error::{Classify, CoreError, ErrorClass, Result};
pub use logging::AUDIT_TARGET;
pub use types::{current_timestamp_ms, TimestampMs};
