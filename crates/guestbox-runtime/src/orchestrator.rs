//! Drives one evaluation end to end.
//!
//! ```text
//! Idle ──warm()──▶ Warming ──eval()──▶ Running ──▶ Completed
//!   │                                     │    ├──▶ Failed
//!   └────────────eval()───────────────────┘    └──▶ TimedOut
//!                         close() from any state ──▶ Closed
//! ```
//!
//! Every evaluation gets a fresh instance. The warm instance prepared by
//! [`Orchestrator::warm`] is the only one instantiated ahead of time, and it
//! is consumed by the next evaluation whose memory ceiling matches.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use wasmtime::Linker;

use guestbox_common::{ExecutionConfig, GuestConfig, RuntimeError};
use guestbox_core::{CompiledModule, GuestInstance, GuestState, InstanceConfig, WasmEngine};
use guestbox_host::{HostFunctions, build_linker};

use crate::options::{EvalOptions, EvalResult};

/// Lifecycle of an [`Orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// No instance prepared.
    Idle,
    /// A warm instance is ready for the next evaluation.
    Warming,
    /// An evaluation is in progress.
    Running,
    /// The last evaluation succeeded.
    Completed,
    /// The last evaluation failed.
    Failed,
    /// The last evaluation hit its deadline.
    TimedOut,
    /// Closed; every further evaluation fails.
    Closed,
}

/// Executes guest code against one compiled module.
pub struct Orchestrator {
    engine: WasmEngine,
    module: Arc<CompiledModule>,
    linker: Linker<GuestState>,
    host: Arc<HostFunctions>,
    execution: ExecutionConfig,
    fallback_response_offset: u32,
    /// Trace each step of the guest call at `info`.
    verbose: bool,
    warm: Option<GuestInstance>,
    state: ExecutionState,
}

impl Orchestrator {
    /// Create an orchestrator whose guests import `host`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host ABI cannot be linked.
    pub fn new(
        engine: WasmEngine,
        module: Arc<CompiledModule>,
        host: Arc<HostFunctions>,
        execution: ExecutionConfig,
        guest: &GuestConfig,
    ) -> Result<Self, RuntimeError> {
        let linker = build_linker(&engine, Arc::clone(&host))?;

        Ok(Self {
            engine,
            module,
            linker,
            host,
            execution,
            fallback_response_offset: guest.fallback_response_offset,
            verbose: guest.debug,
            warm: None,
            state: ExecutionState::Idle,
        })
    }

    /// Current state.
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Id of the engine the module was compiled on.
    pub fn engine_id(&self) -> u64 {
        self.engine.id()
    }

    /// Returns `true` if a warm instance is waiting.
    pub fn is_warm(&self) -> bool {
        self.warm.is_some()
    }

    /// Instantiate a spare instance for the next evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Closed`] after [`close`](Self::close), or the
    /// instantiation error.
    pub async fn warm(&mut self) -> Result<(), RuntimeError> {
        if self.state == ExecutionState::Closed {
            return Err(RuntimeError::Closed);
        }
        if self.warm.is_some() {
            return Ok(());
        }

        let config = self.instance_config(
            "warm".to_string(),
            self.execution.max_memory_bytes(),
            self.execution.max_instructions,
        );
        self.warm = Some(self.instantiate(&config).await?);
        self.state = ExecutionState::Warming;
        debug!("Warm instance ready");
        Ok(())
    }

    /// Drop the warm instance and prepare a new one.
    ///
    /// # Errors
    ///
    /// Same as [`warm`](Self::warm).
    pub async fn reset(&mut self) -> Result<(), RuntimeError> {
        if let Some(mut instance) = self.warm.take() {
            instance.close();
        }
        if self.state != ExecutionState::Closed {
            self.state = ExecutionState::Idle;
        }
        self.warm().await
    }

    /// Evaluate `code` in a fresh instance.
    ///
    /// The console callback and request handler in `options` are installed
    /// for this call only and removed on every exit path. The guest call
    /// races `options.timeout`; when the deadline fires the call future,
    /// and with it the instance, is dropped at the guest's next epoch
    /// yield.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Closed`] after [`close`](Self::close)
    /// - [`RuntimeError::Timeout`] if the deadline elapsed
    /// - [`RuntimeError::GuestExecution`] for a non-zero guest status or a
    ///   trap, carrying the guest's error message
    /// - [`RuntimeError::FuelExhausted`] past the instruction budget
    /// - instantiation and memory errors as reported by the instance
    #[instrument(skip_all, fields(request_id = tracing::field::Empty))]
    pub async fn eval(&mut self, code: &str, options: EvalOptions) -> Result<EvalResult, RuntimeError> {
        if self.state == ExecutionState::Closed {
            return Err(RuntimeError::Closed);
        }

        let request_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("request_id", request_id.as_str());

        let host = Arc::clone(&self.host);
        let _scope = host.enter_scope(options.on_console.clone(), options.host_handler.clone());

        let max_memory = options
            .max_memory
            .unwrap_or_else(|| self.execution.max_memory_bytes());
        let fuel = options
            .max_instructions
            .unwrap_or(self.execution.max_instructions);
        let timeout = options.timeout.or_else(|| self.execution.timeout());

        let start = Instant::now();
        let mut instance = match self.take_warm(max_memory) {
            Some(instance) => instance,
            None => {
                let config = self.instance_config(request_id.clone(), max_memory, fuel);
                match self.instantiate(&config).await {
                    Ok(instance) => instance,
                    Err(e) => {
                        self.state = ExecutionState::Failed;
                        return Err(e);
                    }
                }
            }
        };
        if let Some(state) = instance.state_mut() {
            state.request_id.clone_from(&request_id);
        }
        instance.refuel(fuel)?;

        self.state = ExecutionState::Running;
        let verbose = self.verbose;

        let outcome = match timeout {
            Some(deadline) => {
                match tokio::time::timeout(deadline, run(&mut instance, code, verbose)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RuntimeError::Timeout {
                        duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                    }),
                }
            }
            None => run(&mut instance, code, verbose).await,
        };

        let metrics = instance.finish_metrics();
        instance.close();

        match outcome {
            Ok(data) => {
                self.state = ExecutionState::Completed;
                info!(
                    request_id = %request_id,
                    duration_ms = start.elapsed().as_millis(),
                    fuel_consumed = metrics.fuel_consumed,
                    host_calls = metrics.host_calls,
                    "Eval completed"
                );
                Ok(EvalResult { data, metrics })
            }
            Err(e) => {
                self.state = if e.is_timeout() {
                    ExecutionState::TimedOut
                } else {
                    ExecutionState::Failed
                };
                warn!(
                    request_id = %request_id,
                    duration_ms = start.elapsed().as_millis(),
                    error = %e,
                    "Eval failed"
                );
                Err(e)
            }
        }
    }

    /// Release the warm instance. Further evaluations fail.
    pub fn close(&mut self) {
        if let Some(mut instance) = self.warm.take() {
            instance.close();
        }
        self.state = ExecutionState::Closed;
    }

    fn take_warm(&mut self, max_memory: usize) -> Option<GuestInstance> {
        if max_memory != self.execution.max_memory_bytes() {
            return None;
        }
        self.warm.take()
    }

    fn instance_config(&self, name: String, max_memory_bytes: usize, fuel: u64) -> InstanceConfig {
        InstanceConfig {
            name,
            max_memory_bytes,
            fuel,
            epoch_yield_ticks: self.execution.epoch_yield_ticks,
            fallback_response_offset: self.fallback_response_offset,
        }
    }

    /// `&mut self`: the warm instance is not `Sync`, and a shared borrow
    /// held across the await would make every eval future `!Send`.
    async fn instantiate(&mut self, config: &InstanceConfig) -> Result<GuestInstance, RuntimeError> {
        GuestInstance::instantiate(&self.engine, Arc::clone(&self.module), &self.linker, config).await
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("module", &self.module)
            .field("state", &self.state)
            .field("warm", &self.warm.is_some())
            .finish_non_exhaustive()
    }
}

/// Stage `code`, run the guest and decode what it left behind.
async fn run(
    instance: &mut GuestInstance,
    code: &str,
    verbose: bool,
) -> Result<Option<String>, RuntimeError> {
    let (ptr, len) = instance.write_input(code.as_bytes()).await?;
    if verbose {
        info!(ptr, len, "Guest input staged");
    }

    let status = instance.run_handler(ptr, len).await?;
    if verbose {
        info!(status, "Guest run_handler returned");
    }

    if status != 0 {
        let response = instance.read_response().await.unwrap_or_default();
        return Err(RuntimeError::guest_execution(failure_message(status, &response)));
    }

    let response = instance.read_response().await?;
    if verbose {
        info!(response_bytes = response.len(), "Guest response read");
    }
    decode_result(&response)
}

/// Decode the result of a successful call.
///
/// An envelope (a JSON object with `data` or `error`) yields the JSON text
/// of `data`, or fails with `error`. Anything else is returned as text.
/// Empty output and an envelope without `data` are `undefined`.
pub fn decode_result(bytes: &[u8]) -> Result<Option<String>, RuntimeError> {
    if bytes.is_empty() {
        return Ok(None);
    }

    let Ok(Value::Object(mut envelope)) = serde_json::from_slice::<Value>(bytes) else {
        return Ok(Some(String::from_utf8_lossy(bytes).into_owned()));
    };
    if !envelope.contains_key("data") && !envelope.contains_key("error") {
        return Ok(Some(String::from_utf8_lossy(bytes).into_owned()));
    }

    match envelope.remove("error") {
        Some(Value::String(message)) if !message.is_empty() => {
            return Err(RuntimeError::guest_execution(message));
        }
        Some(Value::Null | Value::String(_)) | None => {}
        Some(other) => return Err(RuntimeError::guest_execution(other.to_string())),
    }

    Ok(envelope.remove("data").map(|data| data.to_string()))
}

/// Human-readable message for a non-zero guest status.
fn failure_message(status: i32, response: &[u8]) -> String {
    if let Ok(Value::Object(envelope)) = serde_json::from_slice::<Value>(response) {
        if let Some(Value::String(message)) = envelope.get("error") {
            return message.clone();
        }
    }

    let text = String::from_utf8_lossy(response);
    if text.trim().is_empty() {
        format!("guest exited with status {status}")
    } else {
        text.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_envelope_data() {
        assert_eq!(
            decode_result(br#"{"data":{"result":"success"}}"#).unwrap(),
            Some(r#"{"result":"success"}"#.to_string())
        );
        assert_eq!(decode_result(br#"{"data":3}"#).unwrap(), Some("3".into()));
        assert_eq!(decode_result(br#"{"data":null}"#).unwrap(), Some("null".into()));
    }

    #[test]
    fn test_decode_envelope_error() {
        let err = decode_result(br#"{"error":"fetch failed"}"#).unwrap_err();
        assert_eq!(err.guest_message(), Some("fetch failed"));

        // An empty error is not a failure
        assert_eq!(decode_result(br#"{"data":1,"error":""}"#).unwrap(), Some("1".into()));
    }

    #[test]
    fn test_decode_raw_and_undefined() {
        assert_eq!(decode_result(b"3").unwrap(), Some("3".into()));
        assert_eq!(decode_result(b"hello").unwrap(), Some("hello".into()));
        assert_eq!(
            decode_result(br#"{"other":1}"#).unwrap(),
            Some(r#"{"other":1}"#.into())
        );
        assert_eq!(decode_result(b"").unwrap(), None);
        assert_eq!(decode_result(br#"{"error":null}"#).unwrap(), None);
    }

    #[test]
    fn test_failure_message() {
        assert_eq!(failure_message(1, br#"{"error":"boom"}"#), "boom");
        assert_eq!(failure_message(1, b"SyntaxError"), "SyntaxError");
        assert_eq!(failure_message(2, b""), "guest exited with status 2");
    }
}
