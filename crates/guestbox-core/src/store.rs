//! Per-instance store state.
//!
//! This module provides:
//! - [`GuestState`]: Per-instance state accessible from host functions
//! - [`ResponseSlot`]: Where the host staged the last `host_request` response
//! - [`LogLevel`]: Console levels as encoded by the guest ABI
//! - [`ExecutionMetrics`]: Performance metrics for each evaluation

use std::time::{Duration, Instant};

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use guestbox_common::RuntimeError;

/// Per-instance execution state.
///
/// One `GuestState` lives inside the [`Store`] of exactly one instance.
/// Host functions reach it through [`wasmtime::Caller::data_mut`], which is
/// how the response slot stays owned by the calling instance rather than by
/// the bridge.
pub struct GuestState {
    /// WASI preview1 context. Guests get no preopens, env or args.
    wasi: WasiP1Ctx,

    /// Memory ceiling enforcement.
    limits: StoreLimits,

    /// Unique identifier for tracing.
    pub request_id: String,

    /// Location of the last staged `host_request` response.
    pub response: ResponseSlot,

    /// Staging offset for guests that do not export `malloc`.
    pub fallback_response_offset: u32,

    /// Execution metrics.
    pub metrics: ExecutionMetrics,

    start_time: Instant,
}

/// The response buffer of one instance.
///
/// `ptr` and `capacity` describe a buffer inside guest memory; `len` is the
/// byte length of the response currently staged there. `ptr == 0` means no
/// buffer has been allocated yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseSlot {
    /// Guest address of the buffer.
    pub ptr: u32,
    /// Allocated size of the buffer.
    pub capacity: u32,
    /// Length of the staged response.
    pub len: u32,
}

impl ResponseSlot {
    /// Returns `true` if a buffer of at least `len` bytes is already allocated.
    pub fn fits(&self, len: u32) -> bool {
        self.ptr != 0 && self.capacity >= len
    }
}

/// Console level as passed by the guest to `host_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LogLevel {
    /// `console.log`.
    Log = 0,
    /// `console.warn`.
    Warn = 1,
    /// `console.error`.
    Error = 2,
}

impl LogLevel {
    /// Convert the raw ABI value; unknown values are treated as `Log`.
    pub fn from_u32(level: u32) -> Self {
        match level {
            1 => Self::Warn,
            2 => Self::Error,
            _ => Self::Log,
        }
    }

    /// The raw ABI value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Log => write!(f, "log"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Execution performance metrics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Fuel consumed during execution.
    pub fuel_consumed: u64,

    /// Number of `host_request` calls the guest made.
    pub host_calls: u32,

    /// Total execution duration.
    pub duration: Option<Duration>,
}

/// Settings for one store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum linear memory in bytes.
    pub max_memory_bytes: usize,

    /// Fuel budget; ignored when the engine does not meter fuel.
    pub fuel: u64,

    /// Epoch ticks between cooperative yields.
    pub epoch_yield_ticks: u64,

    /// Staging offset for guests without `malloc`.
    pub fallback_response_offset: u32,
}

impl GuestState {
    /// Create new state with the given request ID.
    pub fn new(request_id: String, max_memory_bytes: usize, fallback_response_offset: u32) -> Self {
        let wasi = WasiCtxBuilder::new().build_p1();
        let limits = StoreLimitsBuilder::new()
            .memory_size(max_memory_bytes)
            .instances(1)
            .build();

        Self {
            wasi,
            limits,
            request_id,
            response: ResponseSlot::default(),
            fallback_response_offset,
            metrics: ExecutionMetrics::default(),
            start_time: Instant::now(),
        }
    }

    /// The WASI preview1 context, for linker registration.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Reset the per-evaluation counters before the next guest call.
    pub fn begin_call(&mut self) {
        self.metrics = ExecutionMetrics::default();
        self.start_time = Instant::now();
    }

    /// Get elapsed time since the current call started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finalize metrics after execution.
    pub fn finalize_metrics(&mut self) {
        self.metrics.duration = Some(self.start_time.elapsed());
    }
}

/// Create a new Wasmtime store with the given configuration.
///
/// The store is limited to `config.max_memory_bytes` of linear memory, given
/// `config.fuel` fuel when the engine meters fuel, and set to yield back to
/// the executor every `config.epoch_yield_ticks` epochs when the engine uses
/// epoch interruption.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &StoreConfig,
    request_id: String,
) -> Result<Store<GuestState>, RuntimeError> {
    let state = GuestState::new(
        request_id,
        config.max_memory_bytes,
        config.fallback_response_offset,
    );
    let mut store = Store::new(engine.inner(), state);
    store.limiter(|state| &mut state.limits);

    if engine.is_fuel_enabled() {
        store
            .set_fuel(config.fuel)
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
    }

    if engine.is_epoch_enabled() {
        store.epoch_deadline_async_yield_and_update(config.epoch_yield_ticks.max(1));
    }

    Ok(store)
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<GuestState>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<GuestState>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestbox_common::EngineConfig;

    fn store_config() -> StoreConfig {
        StoreConfig {
            max_memory_bytes: 1024 * 1024,
            fuel: 1000,
            epoch_yield_ticks: 10,
            fallback_response_offset: 0x1_0000,
        }
    }

    #[test]
    fn test_guest_state_creation() {
        let state = GuestState::new("test-request-123".into(), 1024, 64);

        assert_eq!(state.request_id, "test-request-123");
        assert_eq!(state.response, ResponseSlot::default());
        assert_eq!(state.fallback_response_offset, 64);
        assert_eq!(state.metrics.fuel_consumed, 0);
    }

    #[test]
    fn test_begin_call_resets_metrics() {
        let mut state = GuestState::new("test".into(), 1024, 64);
        state.metrics.host_calls = 3;
        state.metrics.fuel_consumed = 99;

        state.begin_call();

        assert_eq!(state.metrics.host_calls, 0);
        assert_eq!(state.metrics.fuel_consumed, 0);
    }

    #[test]
    fn test_response_slot_fits() {
        let empty = ResponseSlot::default();
        assert!(!empty.fits(0));

        let slot = ResponseSlot {
            ptr: 1024,
            capacity: 64,
            len: 0,
        };
        assert!(slot.fits(64));
        assert!(!slot.fits(65));
    }

    #[test]
    fn test_log_level_from_u32() {
        assert_eq!(LogLevel::from_u32(0), LogLevel::Log);
        assert_eq!(LogLevel::from_u32(1), LogLevel::Warn);
        assert_eq!(LogLevel::from_u32(2), LogLevel::Error);
        assert_eq!(LogLevel::from_u32(42), LogLevel::Log);
        assert_eq!(LogLevel::Error.as_u32(), 2);
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Log.to_string(), "log");
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert_eq!(LogLevel::Error.to_string(), "error");
    }

    #[test]
    fn test_store_fuel() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();

        let store = create_store(&engine, &store_config(), "test".into()).unwrap();

        assert_eq!(get_remaining_fuel(&store), Some(1000));
        assert_eq!(calculate_fuel_consumed(1000, &store), 0);
    }

    #[test]
    fn test_store_without_fuel_metering() {
        let engine_config = EngineConfig {
            fuel_metering: false,
            epoch_interruption: false,
            ..Default::default()
        };
        let engine = WasmEngine::new(&engine_config).unwrap();

        let store = create_store(&engine, &store_config(), "test".into()).unwrap();

        assert_eq!(get_remaining_fuel(&store), None);
    }
}
