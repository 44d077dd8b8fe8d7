//! Wasmtime-backed runtime.
//!
//! Evaluations on one [`WasmRuntime`] are serialized: the host callback
//! slots are per runtime, so two calls in flight would see each other's
//! console callback. Separate runtimes run in parallel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use guestbox_common::{RuntimeConfig, RuntimeError};
use guestbox_core::{ModuleCache, WasmEngine};
use guestbox_host::{HostFunctions, LogHandler, RequestHandler};

use crate::guest;
use crate::options::{EvalOptions, EvalResult};
use crate::orchestrator::{ExecutionState, Orchestrator};
use crate::runtime::Runtime;
use crate::stub;

enum Inner {
    Uninit,
    /// No real guest: evaluations go to the stub evaluator.
    Degraded,
    Ready(Box<Orchestrator>),
    Closed,
}

/// Runtime that executes a guest module under Wasmtime.
pub struct WasmRuntime {
    config: RuntimeConfig,
    guest: Arc<[u8]>,
    host: Arc<HostFunctions>,
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl WasmRuntime {
    /// Create a runtime for the guest selected by `config.guest`.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured guest file cannot be read.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let guest = guest::load(&config.guest)?;
        Ok(Self::with_guest(config, guest))
    }

    /// Create a runtime for an explicit guest module (binary or WAT).
    pub fn with_guest(config: RuntimeConfig, guest: impl Into<Arc<[u8]>>) -> Self {
        Self {
            config,
            guest: guest.into(),
            host: Arc::new(HostFunctions::new()),
            inner: Mutex::new(Inner::Uninit),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns `true` if no real guest is available and evaluations use the
    /// stub evaluator.
    pub fn is_degraded(&self) -> bool {
        guest::is_placeholder(&self.guest)
    }

    /// The callback registry the guest imports dispatch to.
    pub fn host_functions(&self) -> &Arc<HostFunctions> {
        &self.host
    }

    /// Orchestrator state, `None` before init or in degraded mode.
    pub async fn execution_state(&self) -> Option<ExecutionState> {
        match &*self.inner.lock().await {
            Inner::Ready(orchestrator) => Some(orchestrator.state()),
            Inner::Closed => Some(ExecutionState::Closed),
            Inner::Uninit | Inner::Degraded => None,
        }
    }

    async fn ensure_init(&self, inner: &mut Inner) -> Result<(), RuntimeError> {
        match inner {
            Inner::Closed => Err(RuntimeError::Closed),
            Inner::Ready(_) | Inner::Degraded => Ok(()),
            Inner::Uninit => {
                *inner = self.start().await?;
                Ok(())
            }
        }
    }

    #[instrument(skip(self), fields(guest_bytes = self.guest.len()))]
    async fn start(&self) -> Result<Inner, RuntimeError> {
        if self.is_degraded() {
            warn!("No guest module available, running degraded");
            return Ok(Inner::Degraded);
        }

        let engine = WasmEngine::new(&self.config.engine)?;
        let module = ModuleCache::global().compile(&engine, &self.guest)?;

        let mut orchestrator = Orchestrator::new(
            engine,
            module,
            Arc::clone(&self.host),
            self.config.execution.clone(),
            &self.config.guest,
        )?;
        orchestrator.warm().await?;

        info!("Runtime initialized");
        Ok(Inner::Ready(Box::new(orchestrator)))
    }

    async fn eval_degraded(&self, code: &str, options: &EvalOptions) -> Result<EvalResult, RuntimeError> {
        let evaluate = async { stub::evaluate(code).map(EvalResult::new) };

        match options.timeout.or_else(|| self.config.execution.timeout()) {
            Some(deadline) => tokio::time::timeout(deadline, evaluate)
                .await
                .map_err(|_| RuntimeError::Timeout {
                    duration_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                })?,
            None => evaluate.await,
        }
    }
}

#[async_trait]
impl Runtime for WasmRuntime {
    async fn init(&self) -> Result<(), RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::Closed);
        }
        let mut inner = self.inner.lock().await;
        self.ensure_init(&mut inner).await
    }

    async fn eval_with(&self, code: &str, options: EvalOptions) -> Result<EvalResult, RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::Closed);
        }
        let mut inner = self.inner.lock().await;
        self.ensure_init(&mut inner).await?;

        match &mut *inner {
            Inner::Ready(orchestrator) => orchestrator.eval(code, options).await,
            Inner::Degraded => self.eval_degraded(code, &options).await,
            Inner::Closed | Inner::Uninit => Err(RuntimeError::Closed),
        }
    }

    fn set_host_handler(&self, handler: Option<Arc<dyn RequestHandler>>) {
        self.host.set_request_handler(handler);
    }

    fn set_log_handler(&self, handler: Option<LogHandler>) {
        self.host.set_log_handler(handler);
    }

    async fn reset(&self) -> Result<(), RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::Closed);
        }
        match &mut *self.inner.lock().await {
            Inner::Ready(orchestrator) => orchestrator.reset().await,
            Inner::Closed => Err(RuntimeError::Closed),
            Inner::Uninit | Inner::Degraded => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        if let Inner::Ready(orchestrator) = &mut *inner {
            orchestrator.close();
            ModuleCache::global().evict_engine(orchestrator.engine_id());
        }
        *inner = Inner::Closed;

        self.host.set_request_handler(None);
        self.host.set_log_handler(None);
        self.host.set_error_handler(None);

        info!("Runtime closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WasmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmRuntime")
            .field("guest_bytes", &self.guest.len())
            .field("degraded", &self.is_degraded())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
