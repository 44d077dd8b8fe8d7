//! Guest instance lifecycle and memory access.
//!
//! A [`GuestInstance`] is one instantiated, memory-isolated copy of a
//! [`CompiledModule`]. It owns its [`Store`], so nothing about one instance
//! is visible to another. The host only ever touches guest memory through
//! the bounds-checked [`read_bytes`](GuestInstance::read_bytes) and
//! [`write_bytes`](GuestInstance::write_bytes).
//!
//! Calls into the guest ABI exports (`malloc`, `run_handler`,
//! `get_response_ptr`, `get_response_len`) are async because the store is
//! configured to yield on epoch ticks; dropping the returned future drops
//! the guest call.

use std::sync::Arc;

use tracing::{debug, instrument, warn};
use wasmtime::{Instance, Linker, Memory, Store, Trap, WasmParams, WasmResults};

use crate::store::{GuestState, StoreConfig, calculate_fuel_consumed, create_store};
use crate::{CompiledModule, ExecutionMetrics, WasmEngine};
use guestbox_common::RuntimeError;

/// Guest export names.
pub mod exports {
    /// Linear memory.
    pub const MEMORY: &str = "memory";
    /// Guest allocator.
    pub const MALLOC: &str = "malloc";
    /// Guest deallocator.
    pub const FREE: &str = "free";
    /// Evaluation entry point.
    pub const RUN_HANDLER: &str = "run_handler";
    /// Address of the final result.
    pub const GET_RESPONSE_PTR: &str = "get_response_ptr";
    /// Length of the final result.
    pub const GET_RESPONSE_LEN: &str = "get_response_len";
}

/// Settings for [`GuestInstance::instantiate`].
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Name used in traces.
    pub name: String,

    /// Linear memory ceiling in bytes.
    pub max_memory_bytes: usize,

    /// Fuel budget for the instance.
    pub fuel: u64,

    /// Epoch ticks between cooperative yields.
    pub epoch_yield_ticks: u64,

    /// Response staging offset for guests without `malloc`.
    pub fallback_response_offset: u32,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: "guest".to_string(),
            max_memory_bytes: 128 * 1024 * 1024,
            fuel: 1_000_000_000,
            epoch_yield_ticks: 10,
            fallback_response_offset: 0x1_0000,
        }
    }
}

impl InstanceConfig {
    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_memory_bytes: self.max_memory_bytes,
            fuel: self.fuel,
            epoch_yield_ticks: self.epoch_yield_ticks,
            fallback_response_offset: self.fallback_response_offset,
        }
    }
}

struct Live {
    store: Store<GuestState>,
    instance: Instance,
    memory: Option<Memory>,
    module: Arc<CompiledModule>,
    initial_fuel: u64,
}

/// One live guest sandbox.
pub struct GuestInstance {
    name: String,
    live: Option<Live>,
}

impl GuestInstance {
    /// Instantiate a fresh, zero-state guest from `module`.
    ///
    /// `linker` must already carry the host ABI.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Instantiation`] if an import is unsatisfied,
    /// the start function traps, or the initial memory exceeds the ceiling.
    #[instrument(skip_all, fields(name = %config.name, content_hash = %module.content_hash()))]
    pub async fn instantiate(
        engine: &WasmEngine,
        module: Arc<CompiledModule>,
        linker: &Linker<GuestState>,
        config: &InstanceConfig,
    ) -> Result<Self, RuntimeError> {
        if module.engine_id() != engine.id() {
            return Err(RuntimeError::instantiation(
                "module was compiled by a different engine",
            ));
        }

        let mut store = create_store(engine, &config.store_config(), config.name.clone())?;

        let instance = linker
            .instantiate_async(&mut store, module.inner())
            .await
            .map_err(|e| RuntimeError::instantiation(format!("{e:#}")))?;

        let memory = instance.get_memory(&mut store, exports::MEMORY);
        if memory.is_none() {
            warn!("Guest does not export linear memory");
        }

        let initial_fuel = store.get_fuel().unwrap_or(0);

        debug!(
            memory_bytes = memory.map_or(0, |m| m.data_size(&store)),
            "Guest instantiated"
        );

        Ok(Self {
            name: config.name.clone(),
            live: Some(Live {
                store,
                instance,
                memory,
                module,
                initial_fuel,
            }),
        })
    }

    /// An instance with no module and no memory.
    ///
    /// Every memory access fails and every call returns
    /// [`RuntimeError::Closed`]; closing it is a no-op.
    pub fn detached(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            live: None,
        }
    }

    /// Name given at instantiation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.live.is_none()
    }

    /// The module this instance was created from.
    pub fn module(&self) -> Option<&Arc<CompiledModule>> {
        self.live.as_ref().map(|live| &live.module)
    }

    /// Current linear memory size in bytes, `0` if there is none.
    pub fn memory_size(&self) -> usize {
        self.live
            .as_ref()
            .and_then(|live| live.memory.map(|m| m.data_size(&live.store)))
            .unwrap_or(0)
    }

    /// Store state, for inspection.
    pub fn state(&self) -> Option<&GuestState> {
        self.live.as_ref().map(|live| live.store.data())
    }

    /// Mutable store state.
    pub fn state_mut(&mut self) -> Option<&mut GuestState> {
        self.live.as_mut().map(|live| live.store.data_mut())
    }

    /// Copy `len` bytes out of guest memory starting at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MemoryAccess`] if the range is outside the
    /// current memory, the guest has no memory, or the instance is closed.
    pub fn read_bytes(&self, ptr: u32, len: u32) -> Result<Vec<u8>, RuntimeError> {
        let (live, memory) = self.memory()?;
        let data = memory.data(&live.store);
        let range = checked_range(ptr, len, data.len())?;

        Ok(data[range].to_vec())
    }

    /// Copy `bytes` into guest memory starting at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MemoryAccess`] under the same conditions as
    /// [`read_bytes`](Self::read_bytes).
    pub fn write_bytes(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), RuntimeError> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| RuntimeError::memory_access("write larger than 4 GiB"))?;

        let live = self
            .live
            .as_mut()
            .ok_or_else(|| RuntimeError::memory_access("instance is closed"))?;
        let memory = live
            .memory
            .ok_or_else(|| RuntimeError::memory_access("guest has no linear memory"))?;

        let data = memory.data_mut(&mut live.store);
        let range = checked_range(ptr, len, data.len())?;
        data[range].copy_from_slice(bytes);

        Ok(())
    }

    /// Returns `true` if the guest exports a function called `name`.
    pub fn has_export(&mut self, name: &str) -> bool {
        self.live.as_mut().is_some_and(|live| {
            live.instance
                .get_export(&mut live.store, name)
                .and_then(wasmtime::Extern::into_func)
                .is_some()
        })
    }

    /// Allocate `size` bytes with the guest's own allocator.
    ///
    /// # Errors
    ///
    /// Fails if the guest does not export `malloc`, traps, or returns null.
    pub async fn malloc(&mut self, size: u32) -> Result<u32, RuntimeError> {
        let ptr: u32 = self.call(exports::MALLOC, size).await?;
        if ptr == 0 {
            return Err(RuntimeError::memory_access(format!(
                "guest malloc({size}) returned null"
            )));
        }
        Ok(ptr)
    }

    /// Allocate a guest buffer for `bytes` and copy them in.
    ///
    /// Returns the guest address and length.
    ///
    /// # Errors
    ///
    /// Fails if allocation fails or the write is out of bounds.
    pub async fn write_input(&mut self, bytes: &[u8]) -> Result<(u32, u32), RuntimeError> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| RuntimeError::memory_access("input larger than 4 GiB"))?;
        let ptr = self.malloc(len.max(1)).await?;
        self.write_bytes(ptr, bytes)?;
        Ok((ptr, len))
    }

    /// Invoke the guest entry point with the address and length of the code.
    ///
    /// # Errors
    ///
    /// Traps are mapped: fuel exhaustion to [`RuntimeError::FuelExhausted`],
    /// epoch interruption to [`RuntimeError::Timeout`], anything else to
    /// [`RuntimeError::GuestExecution`].
    pub async fn run_handler(&mut self, code_ptr: u32, code_len: u32) -> Result<i32, RuntimeError> {
        self.call(exports::RUN_HANDLER, (code_ptr, code_len)).await
    }

    /// Read the final result the guest left behind after `run_handler`.
    ///
    /// # Errors
    ///
    /// Fails if the response exports are missing or point outside memory.
    pub async fn read_response(&mut self) -> Result<Vec<u8>, RuntimeError> {
        let ptr: u32 = self.call(exports::GET_RESPONSE_PTR, ()).await?;
        let len: u32 = self.call(exports::GET_RESPONSE_LEN, ()).await?;

        if len == 0 {
            return Ok(Vec::new());
        }
        self.read_bytes(ptr, len)
    }

    /// Refill the fuel tank before reusing a warm instance.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Closed`] if the instance is closed.
    pub fn refuel(&mut self, fuel: u64) -> Result<(), RuntimeError> {
        let live = self.live.as_mut().ok_or(RuntimeError::Closed)?;
        if live.store.set_fuel(fuel).is_ok() {
            live.initial_fuel = fuel;
        }
        live.store.data_mut().begin_call();
        Ok(())
    }

    /// Finalize and return the metrics of the current call.
    pub fn finish_metrics(&mut self) -> ExecutionMetrics {
        let Some(live) = self.live.as_mut() else {
            return ExecutionMetrics::default();
        };

        let fuel_consumed = calculate_fuel_consumed(live.initial_fuel, &live.store);
        let state = live.store.data_mut();
        state.metrics.fuel_consumed = fuel_consumed;
        state.finalize_metrics();
        state.metrics.clone()
    }

    /// Release the instance. Calling it again is a no-op.
    pub fn close(&mut self) {
        if let Some(live) = self.live.take() {
            debug!(name = %self.name, content_hash = %live.module.content_hash(), "Guest instance closed");
        }
    }

    fn memory(&self) -> Result<(&Live, Memory), RuntimeError> {
        let live = self
            .live
            .as_ref()
            .ok_or_else(|| RuntimeError::memory_access("instance is closed"))?;
        let memory = live
            .memory
            .ok_or_else(|| RuntimeError::memory_access("guest has no linear memory"))?;
        Ok((live, memory))
    }

    async fn call<P, R>(&mut self, name: &str, params: P) -> Result<R, RuntimeError>
    where
        P: WasmParams + Send + Sync,
        R: WasmResults + Send + Sync,
    {
        let live = self.live.as_mut().ok_or(RuntimeError::Closed)?;

        let func = live
            .instance
            .get_typed_func::<P, R>(&mut live.store, name)
            .map_err(|e| RuntimeError::instantiation(format!("guest export `{name}`: {e}")))?;

        func.call_async(&mut live.store, params)
            .await
            .map_err(|e| map_trap(name, &e, live.store.data()))
    }
}

impl Drop for GuestInstance {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("memory_size", &self.memory_size())
            .finish()
    }
}

/// Bounds-check `ptr..ptr+len` against a memory of `size` bytes.
pub fn checked_range(ptr: u32, len: u32, size: usize) -> Result<std::ops::Range<usize>, RuntimeError> {
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| RuntimeError::memory_access("pointer + length overflow"))?;

    if end > size {
        return Err(RuntimeError::memory_access(format!(
            "range {start}..{end} outside memory of {size} bytes"
        )));
    }

    Ok(start..end)
}

/// Normalize a Wasmtime call error.
fn map_trap(export: &str, error: &wasmtime::Error, state: &GuestState) -> RuntimeError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => {
            warn!(export, request_id = %state.request_id, "Guest exhausted its fuel");
            RuntimeError::FuelExhausted
        }
        Some(Trap::Interrupt) => {
            let duration_ms = u64::try_from(state.elapsed().as_millis()).unwrap_or(u64::MAX);
            RuntimeError::Timeout { duration_ms }
        }
        _ => RuntimeError::guest_execution(format!("`{export}` trapped: {error:#}")),
    }
}
