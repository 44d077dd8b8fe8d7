//! Configuration structures for guestbox.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, epochs, fuel)
//! - [`ExecutionConfig`]: Per-evaluation limits (timeout, memory, instructions)
//! - [`GuestConfig`]: Guest binary location and ABI fallbacks
//! - [`HandlersConfig`]: Settings for the built-in reference handlers

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for a runtime facade.
/// It can be loaded from TOML via [`crate::ConfigFile`] or built in code.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Which facade implementation to construct.
    #[serde(default)]
    pub backend: Backend,

    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-evaluation execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Guest module configuration.
    #[serde(default)]
    pub guest: GuestConfig,

    /// Built-in handler configuration.
    #[serde(default)]
    pub handlers: HandlersConfig,
}

/// Facade implementation selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Real Wasmtime-backed evaluation.
    #[default]
    Wasm,
    /// Test double that never touches Wasmtime.
    Mock,
}

/// Wasmtime engine configuration.
///
/// These settings affect the engine shared by every instance created from
/// the same runtime, including the allocation strategy and the
/// interruption mechanisms used to bound guest execution.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for faster instance creation.
    ///
    /// When enabled, memory is pre-allocated for a pool of instances.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// This is the authoritative mechanism for stopping a guest that does
    /// not return: stores yield back to the host every few epoch ticks so
    /// an elapsed deadline can drop the call.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch increments in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Enable fuel metering.
    ///
    /// When enabled, each store receives `max_instructions` fuel.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
            fuel_metering: defaults::fuel_metering(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }
}

/// Per-evaluation execution configuration.
///
/// These are the defaults applied when a caller does not override them
/// through the evaluation options.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Evaluation deadline in milliseconds. `0` disables the deadline.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum linear memory per instance in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Instruction budget per evaluation.
    ///
    /// Converted to fuel when the engine has fuel metering enabled.
    #[serde(default = "defaults::max_instructions")]
    pub max_instructions: u64,

    /// Number of epoch ticks between cooperative yields of a running guest.
    #[serde(default = "defaults::epoch_yield_ticks")]
    pub epoch_yield_ticks: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
            max_memory_mb: defaults::max_memory_mb(),
            max_instructions: defaults::max_instructions(),
            epoch_yield_ticks: defaults::epoch_yield_ticks(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`, or `None` if disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Get the memory ceiling in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Guest module configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuestConfig {
    /// Path to a guest binary that replaces the embedded one.
    #[serde(default)]
    pub path: Option<String>,

    /// Offset used to stage host responses for guests that do not export
    /// `malloc`.
    #[serde(default = "defaults::fallback_response_offset")]
    pub fallback_response_offset: u32,

    /// Trace each step of a guest call (input staged, status, response
    /// size) at `info`.
    #[serde(default)]
    pub debug: bool,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            path: None,
            fallback_response_offset: defaults::fallback_response_offset(),
            debug: false,
        }
    }
}

/// Settings for the built-in reference handlers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandlersConfig {
    /// Host patterns the fetch handler may contact.
    #[serde(default)]
    pub allowed_http_hosts: Vec<String>,

    /// Maximum fetch requests per evaluation.
    #[serde(default = "defaults::max_http_requests")]
    pub max_http_requests: u32,

    /// Register the in-memory key-value handlers.
    #[serde(default = "defaults::kv_enabled")]
    pub kv_enabled: bool,

    /// Static secrets exposed through the secret handler.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self {
            allowed_http_hosts: Vec::new(),
            max_http_requests: defaults::max_http_requests(),
            kv_enabled: defaults::kv_enabled(),
            secrets: BTreeMap::new(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        128
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        1
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn timeout_ms() -> u64 {
        5_000
    }

    pub const fn max_memory_mb() -> u32 {
        128
    }

    pub const fn max_instructions() -> u64 {
        1_000_000_000
    }

    pub const fn epoch_yield_ticks() -> u64 {
        10
    }

    pub const fn fallback_response_offset() -> u32 {
        0x1_0000
    }

    pub const fn max_http_requests() -> u32 {
        100
    }

    pub const fn kv_enabled() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert_eq!(config.backend, Backend::Wasm);
        assert!(!config.engine.pooling_allocator);
        assert!(config.engine.epoch_interruption);
        assert!(config.engine.fuel_metering);
        assert_eq!(config.engine.epoch_tick_ms, 1);

        assert_eq!(config.execution.max_memory_mb, 128);
        assert_eq!(config.execution.max_memory_bytes(), 128 * 1024 * 1024);
        assert_eq!(config.execution.max_instructions, 1_000_000_000);
        assert_eq!(config.execution.timeout_ms, 5_000);

        assert!(config.guest.path.is_none());
        assert!(!config.guest.debug);
        assert!(config.handlers.kv_enabled);
        assert!(config.handlers.allowed_http_hosts.is_empty());
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(
            config.execution.max_instructions,
            deserialized.execution.max_instructions
        );
        assert_eq!(
            config.guest.fallback_response_offset,
            deserialized.guest.fallback_response_offset
        );
    }

    #[test]
    fn test_execution_timeout() {
        let config = ExecutionConfig {
            timeout_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.timeout(), Some(Duration::from_millis(500)));

        let config = ExecutionConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_epoch_tick_never_zero() {
        let config = EngineConfig {
            epoch_tick_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.epoch_tick(), Duration::from_millis(1));
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"backend": "mock", "execution": {"timeout_ms": 50}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.backend, Backend::Mock);
        assert_eq!(config.execution.timeout_ms, 50);
        // Default values for unspecified fields
        assert_eq!(config.execution.max_memory_mb, 128);
        assert!(config.engine.epoch_interruption);
    }
}
