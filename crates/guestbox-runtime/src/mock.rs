//! In-process test double for [`Runtime`].
//!
//! [`MockRuntime`] never touches Wasmtime. It evaluates with a replaceable
//! function (arithmetic by default) and lets tests drive the registered
//! host handlers directly.
//!
//! A custom evaluator runs on the blocking pool under the same deadline a
//! real guest would get. While it runs, [`MockRuntime::invoke_log_handler`]
//! also reaches the call's console callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use guestbox_common::{RuntimeConfig, RuntimeError};
use guestbox_core::LogLevel;
use guestbox_host::{ConsoleCallback, LogHandler, OpCode, RequestHandler};

use crate::options::{EvalOptions, EvalResult};
use crate::runtime::Runtime;
use crate::stub;

/// Replacement evaluator for [`MockRuntime::set_eval_fn`].
pub type EvalFn = Arc<dyn Fn(&str) -> Result<EvalResult, RuntimeError> + Send + Sync>;

/// Runtime that evaluates in-process.
pub struct MockRuntime {
    config: RuntimeConfig,
    eval_fn: RwLock<Option<EvalFn>>,
    host_handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    log_handler: RwLock<Option<LogHandler>>,
    console: RwLock<Option<ConsoleCallback>>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl MockRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            eval_fn: RwLock::new(None),
            host_handler: RwLock::new(None),
            log_handler: RwLock::new(None),
            console: RwLock::new(None),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// The configuration this runtime was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Returns `true` once [`init`](Runtime::init) or an evaluation ran.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Replace the evaluator. `None` restores the arithmetic default.
    pub fn set_eval_fn(&self, eval_fn: Option<EvalFn>) {
        *self.eval_fn.write() = eval_fn;
    }

    /// Call the registered host handler as a guest `host_request` would.
    ///
    /// Returns the handler's raw output, without the response envelope.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Closed`] after [`close`](Runtime::close)
    /// - [`RuntimeError::HandlerNotRegistered`] if no handler is set
    /// - the handler's own error
    pub async fn invoke_host_handler(&self, op: OpCode, payload: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::Closed);
        }

        let handler = self.host_handler.read().clone();
        let Some(handler) = handler else {
            return Err(RuntimeError::HandlerNotRegistered { op: op.as_u32() });
        };

        debug!(op = op.name(), "Mock invoking host handler");
        Ok(handler.handle(op.as_u32(), payload).await?)
    }

    /// Call the registered log handler and the in-flight evaluation's
    /// console callback, if any.
    pub fn invoke_log_handler(&self, level: LogLevel, message: &str) {
        let console = self.console.read().clone();
        if let Some(console) = console {
            console(level, message, &[]);
        }

        let handler = self.log_handler.read().clone();
        if let Some(handler) = handler {
            handler(level, message);
        }
    }
}

/// Clears the per-call console callback on drop.
struct ConsoleScope<'a>(&'a RwLock<Option<ConsoleCallback>>);

impl Drop for ConsoleScope<'_> {
    fn drop(&mut self) {
        *self.0.write() = None;
    }
}

impl std::fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRuntime")
            .field("custom_eval", &self.eval_fn.read().is_some())
            .field("host_handler", &self.host_handler.read().is_some())
            .field("initialized", &self.is_initialized())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn init(&self) -> Result<(), RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::Closed);
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn eval_with(&self, code: &str, options: EvalOptions) -> Result<EvalResult, RuntimeError> {
        self.init().await?;

        if let Some(handler) = &options.host_handler {
            handler.begin_eval();
        }

        *self.console.write() = options.on_console.clone();
        let _scope = ConsoleScope(&self.console);

        let eval_fn = self.eval_fn.read().clone();
        let code = code.to_string();
        let evaluate = async move {
            match eval_fn {
                Some(eval_fn) => match tokio::task::spawn_blocking(move || eval_fn(&code)).await {
                    Ok(result) => result,
                    Err(e) => Err(RuntimeError::guest_execution(format!("evaluator failed: {e}"))),
                },
                None => stub::evaluate(&code).map(EvalResult::new),
            }
        };

        match options.timeout.or_else(|| self.config.execution.timeout()) {
            Some(deadline) => tokio::time::timeout(deadline, evaluate)
                .await
                .map_err(|_| RuntimeError::Timeout {
                    duration_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                })?,
            None => evaluate.await,
        }
    }

    fn set_host_handler(&self, handler: Option<Arc<dyn RequestHandler>>) {
        *self.host_handler.write() = handler;
    }

    fn set_log_handler(&self, handler: Option<LogHandler>) {
        *self.log_handler.write() = handler;
    }

    async fn reset(&self) -> Result<(), RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::Closed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.host_handler.write() = None;
        *self.log_handler.write() = None;
        *self.console.write() = None;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestbox_common::HostFunctionError;
    use guestbox_host::handler_fn;
    use parking_lot::Mutex;
    use tokio_test::{assert_err, assert_ok};

    fn mock() -> MockRuntime {
        MockRuntime::new(RuntimeConfig::default())
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let runtime = mock();
        assert!(!runtime.is_initialized());

        assert_ok!(runtime.init().await);
        assert_ok!(runtime.init().await);
        assert!(runtime.is_initialized());
    }

    #[tokio::test]
    async fn test_default_eval() {
        let runtime = mock();

        assert_eq!(runtime.eval("1 + 1").await.unwrap().to_string(), "2");
        assert!(runtime.eval("").await.unwrap().is_undefined());
        assert!(runtime.is_initialized());
    }

    #[tokio::test]
    async fn test_custom_eval_fn() {
        let runtime = mock();
        runtime.set_eval_fn(Some(Arc::new(
            |code: &str| -> Result<EvalResult, RuntimeError> {
                Ok(EvalResult::new(Some(format!("\"{code}\""))))
            },
        )));

        let result = runtime.eval("anything").await.unwrap();
        assert_eq!(result.data.as_deref(), Some("\"anything\""));

        runtime.set_eval_fn(None);
        assert_eq!(runtime.eval("2 * 3").await.unwrap().to_string(), "6");
    }

    #[tokio::test]
    async fn test_timeout_applies_to_custom_eval_fn() {
        let runtime = mock();
        runtime.set_eval_fn(Some(Arc::new(
            |_: &str| -> Result<EvalResult, RuntimeError> {
                std::thread::sleep(std::time::Duration::from_millis(500));
                Ok(EvalResult::new(Some("late".into())))
            },
        )));

        let options = EvalOptions::new().with_timeout(std::time::Duration::from_millis(20));
        let result = runtime.eval_with("slow", options).await;
        assert!(matches!(result, Err(RuntimeError::Timeout { duration_ms: 20 })));

        runtime.set_eval_fn(None);
        let options = EvalOptions::new().with_timeout(std::time::Duration::from_secs(5));
        assert_eq!(assert_ok!(runtime.eval_with("2 + 2", options).await).to_string(), "4");
    }

    #[tokio::test]
    async fn test_console_callback_is_scoped_to_the_call() {
        let runtime = Arc::new(mock());
        let seen: Arc<Mutex<Vec<(LogLevel, String)>>> = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&runtime);
        runtime.set_eval_fn(Some(Arc::new(
            move |code: &str| -> Result<EvalResult, RuntimeError> {
                if let Some(runtime) = weak.upgrade() {
                    runtime.invoke_log_handler(LogLevel::Warn, code);
                }
                Ok(EvalResult::new(None))
            },
        )));

        let sink = Arc::clone(&seen);
        let options = EvalOptions::new().on_console(move |level, message, _| {
            sink.lock().push((level, message.to_string()));
        });
        assert_ok!(runtime.eval_with("captured", options).await);
        assert_ok!(runtime.eval("not captured").await);

        assert_eq!(*seen.lock(), vec![(LogLevel::Warn, "captured".to_string())]);
    }

    #[tokio::test]
    async fn test_invoke_host_handler() {
        let runtime = mock();

        let missing = runtime.invoke_host_handler(OpCode::Fetch, b"{}").await;
        assert!(matches!(
            missing,
            Err(RuntimeError::HandlerNotRegistered { op: 1 })
        ));

        runtime.set_host_handler(Some(handler_fn(|op, payload| async move {
            assert_eq!(op, 3);
            Ok::<_, HostFunctionError>(payload)
        })));

        let raw = runtime
            .invoke_host_handler(OpCode::KvGet, br#"{"key":"k"}"#)
            .await
            .unwrap();
        assert_eq!(raw, br#"{"key":"k"}"#);
    }

    #[tokio::test]
    async fn test_invoke_log_handler() {
        let runtime = mock();
        let seen: Arc<Mutex<Vec<(LogLevel, String)>>> = Arc::new(Mutex::new(Vec::new()));

        runtime.invoke_log_handler(LogLevel::Log, "dropped");

        let sink = Arc::clone(&seen);
        runtime.set_log_handler(Some(Arc::new(move |level: LogLevel, message: &str| {
            sink.lock().push((level, message.to_string()));
        })));
        runtime.invoke_log_handler(LogLevel::Warn, "careful");

        assert_eq!(*seen.lock(), vec![(LogLevel::Warn, "careful".to_string())]);
    }

    #[tokio::test]
    async fn test_closed() {
        let runtime = mock();
        runtime.set_host_handler(Some(handler_fn(|_, _| async { Ok(Vec::new()) })));

        assert_ok!(runtime.close().await);
        assert_ok!(runtime.close().await);

        assert_err!(runtime.reset().await);
        assert!(matches!(runtime.init().await, Err(RuntimeError::Closed)));
        assert!(matches!(runtime.eval("1").await, Err(RuntimeError::Closed)));
        assert!(matches!(
            runtime.invoke_host_handler(OpCode::Utils, b"{}").await,
            Err(RuntimeError::Closed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_eval() {
        let runtime = Arc::new(mock());

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move { runtime.eval(&format!("{i} + 1")).await })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result.to_string(), (i + 1).to_string());
        }
    }
}
