//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the runtime. It is:
//! - Thread-safe and shared by every instance of a runtime
//! - Configured for async host functions, so a `host_request` handler can
//!   await I/O without blocking the executor
//! - Set up with fuel metering and epoch interruption for bounding guests
//!
//! When epoch interruption is enabled, a background ticker thread advances
//! the engine epoch at a fixed interval for as long as any handle to the
//! engine is alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use guestbox_common::{EngineConfig, RuntimeError};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Thread-safe WebAssembly engine wrapper.
///
/// Each `WasmEngine` created through [`WasmEngine::new`] has a distinct
/// [`id`](WasmEngine::id); clones share it. Compiled modules are cached per
/// engine id because compiled artifacts are not portable across engines.
///
/// # Example
///
/// ```ignore
/// use guestbox_common::EngineConfig;
/// use guestbox_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
    id: u64,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    /// - The epoch ticker thread cannot be spawned
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);
        wasmtime_config.consume_fuel(config.fuel_metering);
        wasmtime_config.epoch_interruption(config.epoch_interruption);
        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        let engine = Arc::new(engine);
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);

        if config.epoch_interruption {
            spawn_epoch_ticker(Arc::downgrade(&engine), config.epoch_tick(), id)?;
        }

        info!(
            engine_id = id,
            fuel_metering = config.fuel_metering,
            epoch_interruption = config.epoch_interruption,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine,
            config: config.clone(),
            id,
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Identity of this engine, shared by its clones.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Increment the epoch counter.
    ///
    /// The background ticker does this automatically; calling it by hand
    /// only brings the next yield point forward.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if fuel metering is enabled.
    pub fn is_fuel_enabled(&self) -> bool {
        self.config.fuel_metering
    }

    /// Check if epoch interruption is enabled.
    pub fn is_epoch_enabled(&self) -> bool {
        self.config.epoch_interruption
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("id", &self.id)
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("fuel_metering", &self.config.fuel_metering)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .finish_non_exhaustive()
    }
}

/// Spawn the thread that advances the epoch of `engine` every `tick`.
///
/// The thread exits once the last [`WasmEngine`] handle is dropped.
fn spawn_epoch_ticker(
    engine: Weak<Engine>,
    tick: Duration,
    engine_id: u64,
) -> Result<(), RuntimeError> {
    std::thread::Builder::new()
        .name(format!("guestbox-epoch-{engine_id}"))
        .spawn(move || {
            while let Some(engine) = engine.upgrade() {
                engine.increment_epoch();
                drop(engine);
                std::thread::sleep(tick);
            }
            debug!(engine_id, "Epoch ticker stopped");
        })
        .map(|_| ())
        .map_err(|e| {
            warn!(engine_id, error = %e, "Failed to spawn epoch ticker");
            RuntimeError::Io(e)
        })
}
