//! Host-side callback registry shared by every import of one runtime.
//!
//! [`HostFunctions`] holds the handler slots the guest imports dispatch to:
//! - a long-lived request handler (`SetHostHandler`) and log/error handlers
//! - a per-evaluation scope ([`EvalScope`]) carrying the console callback and
//!   an optional request handler override
//!
//! Guest imports may run on whichever thread the executor polls the guest
//! call on, so every slot sits behind a `parking_lot::RwLock`. Guards are
//! never held across an `.await`.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::IgnoredAny;
use serde_json::Value;
use tracing::{debug, warn};

use guestbox_common::HostFunctionError;
use guestbox_core::LogLevel;

use crate::logging::LoggingHost;
use crate::payload::{ResponsePayload, marshal_response};

/// Console callback for one evaluation: `(level, message, args)`.
pub type ConsoleCallback = Arc<dyn Fn(LogLevel, &str, &[Value]) + Send + Sync>;

/// Long-lived log handler: `(level, message)`.
pub type LogHandler = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Long-lived error handler.
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Handles `host_request` calls.
///
/// The returned bytes are the *value* of a successful call; the host wraps
/// them as `{"data": ...}`. An error is delivered to the guest as
/// `{"error": ...}`, except for fail-closed errors (see
/// [`HostFunctionError::is_fail_closed`]) which make `host_request` return
/// `0`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request. `payload` is the raw JSON the guest wrote.
    async fn handle(&self, op: u32, payload: &[u8]) -> Result<Vec<u8>, HostFunctionError>;

    /// Called before each evaluation that uses this handler.
    fn begin_eval(&self) {}
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(u32, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HostFunctionError>> + Send + 'static,
{
    async fn handle(&self, op: u32, payload: &[u8]) -> Result<Vec<u8>, HostFunctionError> {
        (self.0)(op, payload.to_vec()).await
    }
}

/// Wrap an async closure as a [`RequestHandler`].
///
/// ```ignore
/// let handler = handler_fn(|_op, _payload| async {
///     Ok(br#"{"result":"success"}"#.to_vec())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(u32, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HostFunctionError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Callback slots reached from the guest imports.
#[derive(Default)]
pub struct HostFunctions {
    request_handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    log_handler: RwLock<Option<LogHandler>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    scoped_handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    console: RwLock<Option<ConsoleCallback>>,
}

impl HostFunctions {
    /// Create a registry with every slot empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the long-lived request handler. `None` clears it.
    pub fn set_request_handler(&self, handler: Option<Arc<dyn RequestHandler>>) {
        *self.request_handler.write() = handler;
    }

    /// Replace the long-lived log handler. `None` clears it.
    pub fn set_log_handler(&self, handler: Option<LogHandler>) {
        *self.log_handler.write() = handler;
    }

    /// Replace the long-lived error handler. `None` clears it.
    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) {
        *self.error_handler.write() = handler;
    }

    /// Install per-evaluation callbacks until the returned guard drops.
    ///
    /// `handler`, when given, takes precedence over the long-lived request
    /// handler for the lifetime of the scope. The active handler is told a
    /// new evaluation is starting.
    pub fn enter_scope(
        &self,
        console: Option<ConsoleCallback>,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> EvalScope<'_> {
        *self.console.write() = console;
        *self.scoped_handler.write() = handler;

        if let Some(active) = self.active_handler() {
            active.begin_eval();
        }

        EvalScope { host: self }
    }

    /// Returns `true` while an [`EvalScope`] has callbacks installed.
    pub fn has_scoped_callbacks(&self) -> bool {
        self.console.read().is_some() || self.scoped_handler.read().is_some()
    }

    /// Returns `true` if any request handler would receive a request.
    pub fn has_request_handler(&self) -> bool {
        self.active_handler().is_some()
    }

    fn active_handler(&self) -> Option<Arc<dyn RequestHandler>> {
        let scoped = self.scoped_handler.read().clone();
        scoped.or_else(|| self.request_handler.read().clone())
    }

    /// Run a `host_request` against the active handler.
    ///
    /// Returns the response envelope to stage in guest memory, or `None`
    /// when the call fails closed: the payload is not JSON, no handler is
    /// active, or the handler reported a bridge-level failure.
    pub async fn dispatch(&self, op: u32, payload: &[u8]) -> Option<Vec<u8>> {
        if let Err(e) = serde_json::from_slice::<IgnoredAny>(payload) {
            warn!(op, error = %e, "host_request payload is not valid JSON");
            return None;
        }

        let Some(handler) = self.active_handler() else {
            debug!(op, "host_request with no handler registered");
            return None;
        };

        match handler.handle(op, payload).await {
            Ok(bytes) => Some(ResponsePayload::ok(decode_value(&bytes)).to_bytes()),
            Err(e) if e.is_fail_closed() => {
                debug!(op, error = %e, "host_request failed closed");
                None
            }
            Err(e) => {
                debug!(op, error = %e, "host_request handler returned an error");
                Some(marshal_response::<HostFunctionError>(Err(e)))
            }
        }
    }

    /// Forward a guest console message.
    ///
    /// Reaches the scoped console callback and the long-lived log handler,
    /// and is emitted as a `tracing` event. Never fails.
    pub fn log(&self, request_id: &str, level: LogLevel, message: &str) {
        LoggingHost::emit(request_id, level, message);

        let console = self.console.read().clone();
        if let Some(console) = console {
            console(level, message, &[]);
        }

        let handler = self.log_handler.read().clone();
        if let Some(handler) = handler {
            handler(level, message);
        }
    }

    /// Forward a guest error report. Never fails.
    pub fn error(&self, request_id: &str, message: &str) {
        LoggingHost::emit(request_id, LogLevel::Error, message);

        let handler = self.error_handler.read().clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    fn clear_scope(&self) {
        *self.console.write() = None;
        *self.scoped_handler.write() = None;
    }
}

impl std::fmt::Debug for HostFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunctions")
            .field("request_handler", &self.request_handler.read().is_some())
            .field("log_handler", &self.log_handler.read().is_some())
            .field("error_handler", &self.error_handler.read().is_some())
            .field("scoped", &self.has_scoped_callbacks())
            .finish()
    }
}

/// Per-evaluation callback scope; clears the scoped slots on drop.
#[must_use = "the scope is cleared as soon as the guard is dropped"]
pub struct EvalScope<'a> {
    host: &'a HostFunctions,
}

impl Drop for EvalScope<'_> {
    fn drop(&mut self) {
        self.host.clear_scope();
    }
}

/// Interpret handler output as a JSON value.
///
/// Empty output is `null`; bytes that are not JSON are passed as a string.
fn decode_value(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
