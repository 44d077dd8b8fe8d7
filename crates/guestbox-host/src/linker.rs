//! Host ABI registration for Wasmtime linkers.
//!
//! Every guest import lives in the `env` module:
//!
//! | import                           | signature                 |
//! |----------------------------------|---------------------------|
//! | `host_request(op, ptr, len)`     | `(u32, u32, u32) -> u32`  |
//! | `host_response_len()`            | `() -> u32`               |
//! | `host_log(ptr, len, level)`      | `(u32, u32, u32)`         |
//! | `host_error(ptr, len)`           | `(u32, u32)`              |
//! | `host_alloc(size)`               | `(u32) -> u32`            |
//! | `host_free(ptr)`                 | `(u32)`                   |
//! | `console_{log,warn,error}(p, l)` | `(u32, u32)`              |
//!
//! WASI preview1 is linked alongside so guests built against it
//! instantiate, with no preopens, environment or arguments.

use std::sync::Arc;

use tracing::{debug, warn};
use wasmtime::{Caller, Extern, Linker, Memory};

use guestbox_common::RuntimeError;
use guestbox_core::instance::exports;
use guestbox_core::{GuestState, LogLevel, ResponseSlot, WasmEngine, checked_range};

use crate::hostfn::HostFunctions;
use crate::logging::{console_import_level, level_from_u32};

/// Import module every host function is registered under.
pub const HOST_MODULE: &str = "env";

/// Address returned by `host_alloc`.
///
/// Guests allocate with their own `malloc`; this import only exists so
/// older guest builds link.
pub const HOST_ALLOC_ADDR: u32 = 0x1000;

/// Build a linker carrying WASI preview1 and the full host ABI.
///
/// # Errors
///
/// Returns an error if any function fails to register.
pub fn build_linker(
    engine: &WasmEngine,
    host: Arc<HostFunctions>,
) -> Result<Linker<GuestState>, RuntimeError> {
    let mut linker = Linker::new(engine.inner());
    register_all(&mut linker, host)?;
    Ok(linker)
}

/// Register WASI preview1 and every `env` host function on `linker`.
///
/// # Errors
///
/// Returns an error if any function fails to register.
pub fn register_all(
    linker: &mut Linker<GuestState>,
    host: Arc<HostFunctions>,
) -> Result<(), RuntimeError> {
    wasmtime_wasi::preview1::add_to_linker_async(linker, GuestState::wasi_mut)
        .map_err(|e| registration_failed("wasi_snapshot_preview1", &e))?;

    register_request(linker, Arc::clone(&host))?;
    register_logging(linker, host)?;
    register_memory(linker)?;
    Ok(())
}

/// Register `host_request` and `host_response_len`.
///
/// `host_request` reads the JSON payload at `ptr..ptr+len`, dispatches it,
/// stages the response envelope in guest memory and returns its address.
/// `0` means no response: the payload was not JSON, no handler is
/// registered, the opcode is unknown, or staging failed. The guest then
/// reads the length with `host_response_len`.
pub fn register_request(
    linker: &mut Linker<GuestState>,
    host: Arc<HostFunctions>,
) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            HOST_MODULE,
            "host_request",
            move |mut caller: Caller<'_, GuestState>, (op, ptr, len): (u32, u32, u32)| {
                let host = Arc::clone(&host);
                Box::new(async move {
                    caller.data_mut().metrics.host_calls += 1;

                    let payload = match read_guest(&mut caller, ptr, len) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(op, ptr, len, error = %e, "host_request payload out of bounds");
                            caller.data_mut().response.len = 0;
                            return 0;
                        }
                    };

                    let Some(response) = host.dispatch(op, &payload).await else {
                        caller.data_mut().response.len = 0;
                        return 0;
                    };

                    match stage_response(&mut caller, &response).await {
                        Ok(addr) => addr,
                        Err(e) => {
                            warn!(op, error = %e, "Failed to stage host_request response");
                            caller.data_mut().response.len = 0;
                            0
                        }
                    }
                })
            },
        )
        .map_err(|e| registration_failed("host_request", &e))?;

    linker
        .func_wrap(
            HOST_MODULE,
            "host_response_len",
            |caller: Caller<'_, GuestState>| -> u32 { caller.data().response.len },
        )
        .map_err(|e| registration_failed("host_response_len", &e))?;

    Ok(())
}

/// Register `host_log`, `host_error` and the `console_*` aliases.
///
/// Log calls never fail toward the guest: bad pointers are dropped with a
/// warning.
pub fn register_logging(
    linker: &mut Linker<GuestState>,
    host: Arc<HostFunctions>,
) -> Result<(), RuntimeError> {
    let log_host = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "host_log",
            move |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32, level: u32| {
                if let Some(message) = read_guest_text(&mut caller, ptr, len) {
                    log_host.log(&caller.data().request_id, level_from_u32(level), &message);
                }
            },
        )
        .map_err(|e| registration_failed("host_log", &e))?;

    let error_host = Arc::clone(&host);
    linker
        .func_wrap(
            HOST_MODULE,
            "host_error",
            move |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| {
                if let Some(message) = read_guest_text(&mut caller, ptr, len) {
                    error_host.error(&caller.data().request_id, &message);
                }
            },
        )
        .map_err(|e| registration_failed("host_error", &e))?;

    for import in ["console_log", "console_warn", "console_error"] {
        let level = console_import_level(import).unwrap_or(LogLevel::Log);
        let console_host = Arc::clone(&host);
        linker
            .func_wrap(
                HOST_MODULE,
                import,
                move |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| {
                    if let Some(message) = read_guest_text(&mut caller, ptr, len) {
                        console_host.log(&caller.data().request_id, level, &message);
                    }
                },
            )
            .map_err(|e| registration_failed(import, &e))?;
    }

    Ok(())
}

/// Register the legacy `host_alloc` / `host_free` pair.
pub fn register_memory(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(HOST_MODULE, "host_alloc", |_size: u32| -> u32 {
            HOST_ALLOC_ADDR
        })
        .map_err(|e| registration_failed("host_alloc", &e))?;

    linker
        .func_wrap(HOST_MODULE, "host_free", |_ptr: u32| {})
        .map_err(|e| registration_failed("host_free", &e))?;

    Ok(())
}

fn registration_failed(name: &str, e: &wasmtime::Error) -> RuntimeError {
    RuntimeError::invalid_config(format!("Failed to register {name}: {e}"))
}

fn guest_memory(caller: &mut Caller<'_, GuestState>) -> Result<Memory, RuntimeError> {
    caller
        .get_export(exports::MEMORY)
        .and_then(Extern::into_memory)
        .ok_or_else(|| RuntimeError::memory_access("guest does not export memory"))
}

fn read_guest(
    caller: &mut Caller<'_, GuestState>,
    ptr: u32,
    len: u32,
) -> Result<Vec<u8>, RuntimeError> {
    let memory = guest_memory(caller)?;
    let data = memory.data(&*caller);
    let range = checked_range(ptr, len, data.len())?;
    Ok(data[range].to_vec())
}

fn read_guest_text(caller: &mut Caller<'_, GuestState>, ptr: u32, len: u32) -> Option<String> {
    match read_guest(caller, ptr, len) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!(ptr, len, error = %e, "Dropped guest log message");
            None
        }
    }
}

/// Copy `response` into guest memory and record it in the response slot.
///
/// The existing buffer is reused when it is large enough. Otherwise a new
/// one is taken from the guest's `malloc` and the old one handed to its
/// `free`. Guests without `malloc` get the response at the fixed fallback
/// offset.
async fn stage_response(
    caller: &mut Caller<'_, GuestState>,
    response: &[u8],
) -> Result<u32, RuntimeError> {
    let len = u32::try_from(response.len())
        .map_err(|_| RuntimeError::memory_access("response larger than 4 GiB"))?;
    let slot = caller.data().response;

    let slot = if slot.fits(len) {
        slot
    } else if let Some(ptr) = guest_malloc(caller, len.max(1)).await? {
        if slot.ptr != 0 {
            guest_free(caller, slot.ptr).await;
        }
        ResponseSlot {
            ptr,
            capacity: len.max(1),
            len: 0,
        }
    } else {
        let ptr = caller.data().fallback_response_offset;
        debug!(ptr, len, "Guest has no malloc, staging at fallback offset");
        ResponseSlot {
            ptr,
            capacity: len,
            len: 0,
        }
    };

    let memory = guest_memory(caller)?;
    let data = memory.data_mut(&mut *caller);
    let range = checked_range(slot.ptr, len, data.len())?;
    data[range].copy_from_slice(response);

    caller.data_mut().response = ResponseSlot { len, ..slot };
    Ok(slot.ptr)
}

/// Call the guest's `malloc`. `Ok(None)` if it does not export one.
async fn guest_malloc(
    caller: &mut Caller<'_, GuestState>,
    size: u32,
) -> Result<Option<u32>, RuntimeError> {
    let Some(malloc) = caller.get_export(exports::MALLOC).and_then(Extern::into_func) else {
        return Ok(None);
    };

    let malloc = malloc
        .typed::<u32, u32>(&*caller)
        .map_err(|e| RuntimeError::guest_execution(format!("malloc has the wrong type: {e}")))?;
    let ptr = malloc
        .call_async(&mut *caller, size)
        .await
        .map_err(|e| RuntimeError::guest_execution(format!("malloc trapped: {e}")))?;

    if ptr == 0 {
        return Err(RuntimeError::memory_access(format!(
            "guest malloc({size}) returned null"
        )));
    }
    Ok(Some(ptr))
}

async fn guest_free(caller: &mut Caller<'_, GuestState>, ptr: u32) {
    let Some(free) = caller
        .get_export(exports::FREE)
        .and_then(Extern::into_func)
        .and_then(|f| f.typed::<u32, ()>(&*caller).ok())
    else {
        return;
    };

    if let Err(e) = free.call_async(&mut *caller, ptr).await {
        warn!(ptr, error = %e, "Guest free trapped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestbox_common::EngineConfig;

    #[test]
    fn test_register_all() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let mut linker = Linker::new(engine.inner());

        tokio_test::assert_ok!(register_all(&mut linker, Arc::new(HostFunctions::new())));
    }

    #[test]
    fn test_build_linker_defines_env_imports() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let linker = build_linker(&engine, Arc::new(HostFunctions::new())).unwrap();

        let mut store = wasmtime::Store::new(
            engine.inner(),
            GuestState::new("test".into(), 1 << 20, 0x1_0000),
        );
        for name in [
            "host_request",
            "host_response_len",
            "host_log",
            "host_error",
            "host_alloc",
            "host_free",
            "console_log",
            "console_warn",
            "console_error",
        ] {
            assert!(
                linker.get(&mut store, HOST_MODULE, name).is_some(),
                "{name} missing"
            );
        }
        assert!(
            linker
                .get(&mut store, "wasi_snapshot_preview1", "fd_write")
                .is_some()
        );
    }
}
