//! Per-call options and results.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use guestbox_core::{ExecutionMetrics, LogLevel};
use guestbox_host::{ConsoleCallback, RequestHandler};

/// Options for one evaluation.
///
/// Unset limits fall back to the runtime's
/// [`ExecutionConfig`](guestbox_common::ExecutionConfig).
#[derive(Clone, Default)]
pub struct EvalOptions {
    /// Deadline for the whole call.
    pub timeout: Option<Duration>,

    /// Linear memory ceiling in bytes.
    pub max_memory: Option<usize>,

    /// Instruction budget, charged as fuel.
    pub max_instructions: Option<u64>,

    /// Receives the guest's console output during this call only.
    pub on_console: Option<ConsoleCallback>,

    /// Request handler for this call only; takes precedence over the
    /// runtime's long-lived handler.
    pub host_handler: Option<Arc<dyn RequestHandler>>,
}

impl EvalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_max_instructions(mut self, instructions: u64) -> Self {
        self.max_instructions = Some(instructions);
        self
    }

    #[must_use]
    pub fn on_console<F>(mut self, callback: F) -> Self
    where
        F: Fn(LogLevel, &str, &[Value]) + Send + Sync + 'static,
    {
        self.on_console = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn with_host_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.host_handler = Some(handler);
        self
    }
}

impl fmt::Debug for EvalOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalOptions")
            .field("timeout", &self.timeout)
            .field("max_memory", &self.max_memory)
            .field("max_instructions", &self.max_instructions)
            .field("on_console", &self.on_console.is_some())
            .field("host_handler", &self.host_handler.is_some())
            .finish()
    }
}

/// Outcome of a successful evaluation.
#[derive(Debug, Clone, Default)]
pub struct EvalResult {
    /// The result as text: the JSON of the guest's `data`, or its raw output
    /// when that was not a response envelope. `None` is `undefined`.
    pub data: Option<String>,

    pub metrics: ExecutionMetrics,
}

impl EvalResult {
    /// A result with `data` and empty metrics.
    pub fn new(data: Option<String>) -> Self {
        Self {
            data,
            metrics: ExecutionMetrics::default(),
        }
    }

    /// Returns `true` if the guest produced no value.
    pub fn is_undefined(&self) -> bool {
        self.data.is_none()
    }

    /// The result parsed as JSON, if it is JSON.
    pub fn json(&self) -> Option<Value> {
        self.data
            .as_deref()
            .and_then(|data| serde_json::from_str(data).ok())
    }
}

impl fmt::Display for EvalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.data.as_deref().unwrap_or("undefined"))
    }
}
