//! The runtime facade.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use guestbox_common::{Backend, RuntimeConfig, RuntimeError};
use guestbox_host::{LogHandler, RequestHandler, standard_bridge};

use crate::mock::MockRuntime;
use crate::options::{EvalOptions, EvalResult};
use crate::wasm::WasmRuntime;

/// Stable interface for evaluating guest code.
///
/// Implementations behave identically for this surface:
/// - `init` is idempotent
/// - `close` is idempotent, and every other operation fails with
///   [`RuntimeError::Closed`] once it has been called
/// - `eval` initializes on first use
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Prepare the runtime.
    async fn init(&self) -> Result<(), RuntimeError>;

    /// Evaluate `code` with default options.
    async fn eval(&self, code: &str) -> Result<EvalResult, RuntimeError> {
        self.eval_with(code, EvalOptions::default()).await
    }

    /// Evaluate `code`.
    async fn eval_with(&self, code: &str, options: EvalOptions) -> Result<EvalResult, RuntimeError>;

    /// Replace the long-lived request handler. `None` clears it.
    fn set_host_handler(&self, handler: Option<Arc<dyn RequestHandler>>);

    /// Replace the long-lived log handler. `None` clears it.
    fn set_log_handler(&self, handler: Option<LogHandler>);

    /// Discard guest-side state without tearing down the engine or module.
    async fn reset(&self) -> Result<(), RuntimeError>;

    /// Release the runtime.
    async fn close(&self) -> Result<(), RuntimeError>;

    /// Returns `true` once [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;
}

/// Create the runtime selected by `config.backend`.
///
/// The reference handlers enabled by `config.handlers` are installed as the
/// long-lived request handler.
///
/// # Errors
///
/// Returns an error if the guest cannot be loaded or the handlers cannot be
/// built.
pub fn create_runtime(config: &RuntimeConfig) -> Result<Box<dyn Runtime>, RuntimeError> {
    let runtime: Box<dyn Runtime> = match config.backend {
        Backend::Wasm => Box::new(WasmRuntime::new(config.clone())?),
        Backend::Mock => Box::new(MockRuntime::new(config.clone())),
    };

    let bridge = standard_bridge(&config.handlers)?;
    runtime.set_host_handler(Some(bridge.to_request_handler()));

    info!(backend = ?config.backend, "Runtime created");
    Ok(runtime)
}
