//! Opcode-keyed handler registry.
//!
//! A [`Bridge`] maps each [`OpCode`] to an [`OpHandler`] that receives the
//! decoded [`RequestPayload`]. [`Bridge::handle`] is the complete
//! request/response cycle: bridge-level failures (unknown opcode, malformed
//! JSON) are errors, handler failures are `{"error": ...}` envelopes.
//!
//! [`Bridge::to_request_handler`] adapts the bridge to the single-callback
//! [`RequestHandler`] shape installed on [`crate::HostFunctions`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, instrument};

use guestbox_common::{HostFunctionError, RuntimeError};

use crate::hostfn::RequestHandler;
use crate::opcode::OpCode;
use crate::payload::{RequestPayload, marshal_response};

/// Business handler for one opcode.
#[async_trait]
pub trait OpHandler: Send + Sync {
    /// Handle a decoded request and return the response `data`.
    async fn call(&self, payload: RequestPayload) -> Result<Value, HostFunctionError>;

    /// Called before each evaluation that routes through the bridge.
    fn begin_eval(&self) {}
}

struct FnOpHandler<F>(F);

#[async_trait]
impl<F, Fut> OpHandler for FnOpHandler<F>
where
    F: Fn(RequestPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HostFunctionError>> + Send + 'static,
{
    async fn call(&self, payload: RequestPayload) -> Result<Value, HostFunctionError> {
        (self.0)(payload).await
    }
}

/// Wrap an async closure as an [`OpHandler`].
pub fn op_fn<F, Fut>(f: F) -> Arc<dyn OpHandler>
where
    F: Fn(RequestPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HostFunctionError>> + Send + 'static,
{
    Arc::new(FnOpHandler(f))
}

/// Opcode → handler registry.
#[derive(Default)]
pub struct Bridge {
    handlers: RwLock<HashMap<OpCode, Arc<dyn OpHandler>>>,
}

impl Bridge {
    /// Create an empty bridge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `op`, replacing any previous one.
    pub fn register_handler(&self, op: OpCode, handler: Arc<dyn OpHandler>) {
        if self.handlers.write().insert(op, handler).is_some() {
            debug!(%op, "Replaced bridge handler");
        }
    }

    /// Remove the handler for `op`.
    pub fn unregister_handler(&self, op: OpCode) -> bool {
        self.handlers.write().remove(&op).is_some()
    }

    /// Returns `true` if `op` has a handler.
    pub fn has_handler(&self, op: OpCode) -> bool {
        self.handlers.read().contains_key(&op)
    }

    /// Registered opcodes, in numeric order.
    pub fn opcodes(&self) -> Vec<OpCode> {
        let mut ops: Vec<_> = self.handlers.read().keys().copied().collect();
        ops.sort();
        ops
    }

    /// Run one request through the bridge and return the response envelope.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::HandlerNotRegistered`] for an unknown or unhandled
    ///   opcode
    /// - [`RuntimeError::PayloadDecode`] if `payload` is not a JSON object
    ///
    /// A handler error is not an error here: it is returned as the bytes of
    /// `{"error": ...}`.
    pub async fn handle(&self, op: u32, payload: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        match self.invoke(op, payload).await {
            Err(e) if e.is_fail_closed() => Err(e.into()),
            result => Ok(marshal_response(result)),
        }
    }

    /// Adapt the bridge into a [`RequestHandler`].
    pub fn to_request_handler(self: &Arc<Self>) -> Arc<dyn RequestHandler> {
        Arc::new(BridgeRequestHandler {
            bridge: Arc::clone(self),
        })
    }

    /// Dispatch to the handler for `op`.
    ///
    /// Bridge-level failures come back as fail-closed errors; a handler that
    /// itself reports a fail-closed kind is demoted to `InvalidArgument` so
    /// the guest still sees it as data.
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    async fn invoke(&self, op: u32, payload: &[u8]) -> Result<Value, HostFunctionError> {
        let opcode = OpCode::try_from(op)?;
        let handler = self
            .handlers
            .read()
            .get(&opcode)
            .cloned()
            .ok_or(HostFunctionError::HandlerNotRegistered { op })?;

        let request = RequestPayload::parse(payload)?;

        handler.call(request).await.map_err(|e| {
            if e.is_fail_closed() {
                HostFunctionError::invalid_argument(e.to_string())
            } else {
                e
            }
        })
    }

    fn begin_eval(&self) {
        let handlers: Vec<_> = self.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler.begin_eval();
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("opcodes", &self.opcodes())
            .finish()
    }
}

struct BridgeRequestHandler {
    bridge: Arc<Bridge>,
}

#[async_trait]
impl RequestHandler for BridgeRequestHandler {
    async fn handle(&self, op: u32, payload: &[u8]) -> Result<Vec<u8>, HostFunctionError> {
        let value = self.bridge.invoke(op, payload).await?;
        Ok(serde_json::to_vec(&value)?)
    }

    fn begin_eval(&self) {
        self.bridge.begin_eval();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::ResponsePayload;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bridge_with_handlers() -> Bridge {
        let bridge = Bridge::new();
        bridge.register_handler(
            OpCode::DbQuery,
            op_fn(|payload| async move {
                Ok(json!({"op": payload.op, "col": payload.col, "items": []}))
            }),
        );
        bridge.register_handler(
            OpCode::Fetch,
            op_fn(|_| async { Err(HostFunctionError::handler("fetch failed")) }),
        );
        bridge
    }

    #[tokio::test]
    async fn test_handle_success() {
        let bridge = bridge_with_handlers();

        let bytes = bridge
            .handle(2, br#"{"op":"list","col":"users"}"#)
            .await
            .unwrap();
        let response = ResponsePayload::parse(&bytes).unwrap();

        assert_eq!(response.error, None);
        assert_eq!(
            response.data,
            Some(json!({"op": "list", "col": "users", "items": []}))
        );
    }

    #[tokio::test]
    async fn test_handler_error_is_data() {
        let bridge = bridge_with_handlers();

        let bytes = bridge
            .handle(1, br#"{"url":"https://example.com"}"#)
            .await
            .unwrap();
        let response = ResponsePayload::parse(&bytes).unwrap();

        assert_eq!(response.error.as_deref(), Some("fetch failed"));
    }

    #[tokio::test]
    async fn test_unknown_opcode() {
        let bridge = bridge_with_handlers();

        let result = bridge.handle(999, b"{}").await;
        assert!(matches!(
            result,
            Err(RuntimeError::HandlerNotRegistered { op: 999 })
        ));

        // Known opcode, no handler
        let result = bridge.handle(OpCode::KvGet.as_u32(), b"{}").await;
        assert!(matches!(
            result,
            Err(RuntimeError::HandlerNotRegistered { op: 3 })
        ));
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let bridge = bridge_with_handlers();

        let result = bridge.handle(2, b"{invalid}").await;
        assert!(matches!(result, Err(RuntimeError::PayloadDecode { .. })));
    }

    #[tokio::test]
    async fn test_handler_decode_error_stays_data() {
        let bridge = Bridge::new();
        bridge.register_handler(
            OpCode::Fetch,
            op_fn(|payload| async move {
                let fetch: crate::payload::FetchPayload = payload.parse_as()?;
                Ok::<Value, HostFunctionError>(json!(fetch.url))
            }),
        );

        let bytes = bridge.handle(1, b"{}").await.unwrap();
        let response = ResponsePayload::parse(&bytes).unwrap();
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_register_replaces() {
        let bridge = Bridge::new();
        bridge.register_handler(OpCode::Utils, op_fn(|_| async { Ok(json!("a")) }));
        bridge.register_handler(OpCode::Utils, op_fn(|_| async { Ok(json!("b")) }));

        let bytes = bridge.handle(13, b"{}").await.unwrap();
        assert_eq!(bytes, br#"{"data":"b"}"#);
        assert_eq!(bridge.opcodes(), vec![OpCode::Utils]);

        assert!(bridge.unregister_handler(OpCode::Utils));
        assert!(!bridge.has_handler(OpCode::Utils));
    }

    #[tokio::test]
    async fn test_to_request_handler() {
        let bridge = Arc::new(Bridge::new());
        bridge.register_handler(
            OpCode::KvGet,
            op_fn(|payload| async move { Ok(json!({"key": payload.key})) }),
        );

        let handler = bridge.to_request_handler();

        let result = handler.handle(3, br#"{"key":"mykey"}"#).await.unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&result).unwrap(),
            json!({"key": "mykey"})
        );

        let err = handler.handle(4, b"{}").await.unwrap_err();
        assert!(err.is_fail_closed());
    }

    #[tokio::test]
    async fn test_begin_eval_reaches_handlers() {
        struct Counting(AtomicUsize);

        #[async_trait]
        impl OpHandler for Counting {
            async fn call(&self, _: RequestPayload) -> Result<Value, HostFunctionError> {
                Ok(Value::Null)
            }

            fn begin_eval(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let bridge = Arc::new(Bridge::new());
        bridge.register_handler(OpCode::Utils, counting.clone());

        let handler = bridge.to_request_handler();
        handler.begin_eval();
        handler.begin_eval();

        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }
}
