//! Common types, errors, and configuration for guestbox.
//!
//! This crate provides shared functionality used across the guestbox workspace:
//! - Error types using `thiserror`, normalized so that no engine-specific
//!   error type ever reaches a caller of the runtime facade
//! - Configuration structures for engine, execution, guest and handler settings
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    Backend, EngineConfig, ExecutionConfig, GuestConfig, HandlersConfig, RuntimeConfig,
};
pub use config_file::{ConfigFile, ConfigFileError, LoggingConfig};
pub use error::{HostFunctionError, RuntimeError};
