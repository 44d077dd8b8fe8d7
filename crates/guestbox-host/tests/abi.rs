//! Host ABI tests against small WAT guests.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};

use guestbox_common::{EngineConfig, HostFunctionError};
use guestbox_core::{CompiledModule, GuestInstance, InstanceConfig, LogLevel, WasmEngine};
use guestbox_host::linker::HOST_ALLOC_ADDR;
use guestbox_host::{
    ConsoleCallback, HostFunctions, OpCode, ResponsePayload, build_linker, handler_fn,
    standard_bridge,
};

/// Guest whose `run_handler` forwards its input to `host_request(op, ..)`
/// and exposes the staged response as its result.
fn forwarding_guest(op: u32, with_malloc: bool) -> String {
    let allocator = if with_malloc {
        r#"
  (func (export "malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $size)))
    (local.get $ptr))
  (func (export "free") (param i32))"#
    } else {
        ""
    };

    format!(
        r#"(module
  (import "env" "host_request" (func $host_request (param i32 i32 i32) (result i32)))
  (import "env" "host_response_len" (func $host_response_len (result i32)))
  (import "env" "host_log" (func $host_log (param i32 i32 i32)))
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 0x2000))
  (global $resp_ptr (mut i32) (i32.const 0))
  (global $resp_len (mut i32) (i32.const 0))
  {allocator}
  (func (export "run_handler") (param $ptr i32) (param $len i32) (result i32)
    (call $host_log (local.get $ptr) (local.get $len) (i32.const 1))
    (global.set $resp_ptr (call $host_request (i32.const {op}) (local.get $ptr) (local.get $len)))
    (global.set $resp_len (call $host_response_len))
    (i32.const 0))
  (func (export "get_response_ptr") (result i32) (global.get $resp_ptr))
  (func (export "get_response_len") (result i32) (global.get $resp_len)))"#
    )
}

/// Guest whose `run_handler` exercises every non-request import with its
/// input, then makes one good and one out-of-bounds `host_request`.
///
/// Results land at `0x10` as five little-endian `u32`s: the `host_alloc`
/// address, then `(addr, host_response_len)` for each request.
fn import_surface_guest(op: u32) -> String {
    format!(
        r#"(module
  (import "env" "host_request" (func $host_request (param i32 i32 i32) (result i32)))
  (import "env" "host_response_len" (func $host_response_len (result i32)))
  (import "env" "host_error" (func $host_error (param i32 i32)))
  (import "env" "host_alloc" (func $host_alloc (param i32) (result i32)))
  (import "env" "host_free" (func $host_free (param i32)))
  (import "env" "console_log" (func $console_log (param i32 i32)))
  (import "env" "console_warn" (func $console_warn (param i32 i32)))
  (import "env" "console_error" (func $console_error (param i32 i32)))
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 0x2000))
  (func (export "malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $size)))
    (local.get $ptr))
  (func (export "free") (param i32))
  (func (export "run_handler") (param $ptr i32) (param $len i32) (result i32)
    (local $block i32)
    (call $host_error (local.get $ptr) (local.get $len))
    (call $console_log (local.get $ptr) (local.get $len))
    (call $console_warn (local.get $ptr) (local.get $len))
    (call $console_error (local.get $ptr) (local.get $len))
    (local.set $block (call $host_alloc (i32.const 64)))
    (call $host_free (local.get $block))
    (i32.store (i32.const 0x10) (local.get $block))
    (i32.store (i32.const 0x14) (call $host_request (i32.const {op}) (local.get $ptr) (local.get $len)))
    (i32.store (i32.const 0x18) (call $host_response_len))
    (i32.store (i32.const 0x1c) (call $host_request (i32.const {op}) (i32.const -16) (i32.const 64)))
    (i32.store (i32.const 0x20) (call $host_response_len))
    (i32.const 0))
  (func (export "get_response_ptr") (result i32) (i32.const 0))
  (func (export "get_response_len") (result i32) (i32.const 0)))"#
    )
}

struct Harness {
    instance: GuestInstance,
}

impl Harness {
    async fn new(host: Arc<HostFunctions>, op: OpCode, with_malloc: bool) -> Self {
        Self::with_wat(host, &forwarding_guest(op.as_u32(), with_malloc)).await
    }

    async fn with_wat(host: Arc<HostFunctions>, wat: &str) -> Self {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let module = Arc::new(CompiledModule::from_wat(&engine, wat).unwrap());
        let linker = build_linker(&engine, host).unwrap();

        let instance = GuestInstance::instantiate(
            &engine,
            module,
            &linker,
            &InstanceConfig {
                name: "abi-test".into(),
                ..InstanceConfig::default()
            },
        )
        .await
        .unwrap();

        Self { instance }
    }

    /// Send `payload` through the guest and return the staged response.
    async fn request(&mut self, payload: &[u8]) -> Vec<u8> {
        let (ptr, len) = if self.instance.has_export("malloc") {
            self.instance.write_input(payload).await.unwrap()
        } else {
            self.instance.write_bytes(0x100, payload).unwrap();
            (0x100, u32::try_from(payload.len()).unwrap())
        };

        let status = self.instance.run_handler(ptr, len).await.unwrap();
        assert_eq!(status, 0);
        self.instance.read_response().await.unwrap()
    }
}

#[tokio::test]
async fn test_round_trip_with_request_handler() {
    let host = Arc::new(HostFunctions::new());
    host.set_request_handler(Some(handler_fn(|op, payload| async move {
        assert_eq!(op, 2);
        let request: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(request["col"], "users");
        Ok(br#"{"result":"success"}"#.to_vec())
    })));

    let mut harness = Harness::new(host, OpCode::DbQuery, true).await;
    let response = harness.request(br#"{"op":"list","col":"users"}"#).await;

    let response = ResponsePayload::parse(&response).unwrap();
    assert_eq!(response.data, Some(json!({"result": "success"})));
    assert_eq!(response.error, None);

    let state = harness.instance.state().unwrap();
    assert_eq!(state.metrics.host_calls, 1);
}

#[tokio::test]
async fn test_handler_error_reaches_guest_as_data() {
    let host = Arc::new(HostFunctions::new());
    host.set_request_handler(Some(handler_fn(|_, _| async {
        Err(HostFunctionError::handler("test error"))
    })));

    let mut harness = Harness::new(host, OpCode::Fetch, true).await;
    let response = harness.request(b"{}").await;

    assert_eq!(response, br#"{"error":"test error"}"#);
}

#[tokio::test]
async fn test_no_handler_returns_zero() {
    let host = Arc::new(HostFunctions::new());

    let mut harness = Harness::new(host, OpCode::Fetch, true).await;
    let response = harness.request(b"{}").await;

    assert!(response.is_empty());
    assert_eq!(harness.instance.state().unwrap().response.len, 0);
}

#[tokio::test]
async fn test_invalid_json_returns_zero() {
    let host = Arc::new(HostFunctions::new());
    host.set_request_handler(Some(handler_fn(|_, _| async { Ok(b"1".to_vec()) })));

    let mut harness = Harness::new(host, OpCode::DbQuery, true).await;
    let response = harness.request(b"{invalid}").await;

    assert!(response.is_empty());
}

#[tokio::test]
async fn test_response_buffer_is_reused() {
    let host = Arc::new(HostFunctions::new());
    host.set_request_handler(Some(handler_fn(|_, payload| async move { Ok(payload) })));

    let mut harness = Harness::new(host, OpCode::DbQuery, true).await;

    harness.request(br#"{"op":"a long enough payload"}"#).await;
    let first = harness.instance.state().unwrap().response;

    let response = harness.request(br#"{"op":"b"}"#).await;
    let second = harness.instance.state().unwrap().response;

    assert_eq!(first.ptr, second.ptr);
    assert!(second.len < first.len);
    assert_eq!(response, br#"{"data":{"op":"b"}}"#);
}

#[tokio::test]
async fn test_guest_without_malloc_uses_fallback_offset() {
    let host = Arc::new(HostFunctions::new());
    host.set_request_handler(Some(handler_fn(|_, _| async { Ok(b"42".to_vec()) })));

    let mut harness = Harness::new(host, OpCode::Utils, false).await;
    let response = harness.request(br#"{"func":"uuid"}"#).await;

    assert_eq!(response, br#"{"data":42}"#);
    assert_eq!(
        harness.instance.state().unwrap().response.ptr,
        InstanceConfig::default().fallback_response_offset
    );
}

#[tokio::test]
async fn test_guest_log_reaches_console_callback() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let console: ConsoleCallback = Arc::new(move |level: LogLevel, msg: &str, _: &[Value]| {
        sink.lock().push((level, msg.to_string()));
    });

    let host = Arc::new(HostFunctions::new());
    let mut harness = Harness::new(Arc::clone(&host), OpCode::Utils, true).await;

    {
        let _scope = host.enter_scope(Some(console), None);
        harness.request(br#"{"hello":"world"}"#).await;
    }

    assert_eq!(
        *seen.lock(),
        vec![(LogLevel::Warn, r#"{"hello":"world"}"#.to_string())]
    );
}

#[tokio::test]
async fn test_error_alloc_and_console_imports() {
    let console_seen = Arc::new(Mutex::new(Vec::new()));
    let console_sink = Arc::clone(&console_seen);
    let console: ConsoleCallback = Arc::new(move |level: LogLevel, msg: &str, _: &[Value]| {
        console_sink.lock().push((level, msg.to_string()));
    });

    let errors_seen = Arc::new(Mutex::new(Vec::new()));
    let errors_sink = Arc::clone(&errors_seen);

    let host = Arc::new(HostFunctions::new());
    host.set_error_handler(Some(Arc::new(move |msg: &str| {
        errors_sink.lock().push(msg.to_string());
    })));
    host.set_request_handler(Some(handler_fn(|_, _| async { Ok(b"1".to_vec()) })));

    let mut harness =
        Harness::with_wat(Arc::clone(&host), &import_surface_guest(OpCode::Utils.as_u32())).await;

    let payload = br#"{"msg":"hello"}"#;
    {
        let _scope = host.enter_scope(Some(console), None);
        let response = harness.request(payload).await;
        assert!(response.is_empty());
    }

    let message = String::from_utf8_lossy(payload).into_owned();
    assert_eq!(*errors_seen.lock(), vec![message.clone()]);
    assert_eq!(
        *console_seen.lock(),
        vec![
            (LogLevel::Log, message.clone()),
            (LogLevel::Warn, message.clone()),
            (LogLevel::Error, message),
        ]
    );

    let results: Vec<u32> = harness
        .instance
        .read_bytes(0x10, 20)
        .unwrap()
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect();

    assert_eq!(results[0], HOST_ALLOC_ADDR);
    assert_ne!(results[1], 0);
    assert_eq!(results[2], br#"{"data":1}"#.len() as u32);
    assert_eq!(results[3], 0);
    assert_eq!(results[4], 0);

    let state = harness.instance.state().unwrap();
    assert_eq!(state.response.len, 0);
    assert_eq!(state.metrics.host_calls, 2);
}

#[tokio::test]
async fn test_out_of_bounds_payload_clears_previous_response() {
    let host = Arc::new(HostFunctions::new());
    host.set_request_handler(Some(handler_fn(|_, payload| async move { Ok(payload) })));

    let mut harness = Harness::new(Arc::clone(&host), OpCode::DbQuery, true).await;
    let response = harness.request(br#"{"op":"list"}"#).await;
    assert_eq!(response, br#"{"data":{"op":"list"}}"#);
    assert_ne!(harness.instance.state().unwrap().response.len, 0);

    let status = harness.instance.run_handler(u32::MAX - 8, 64).await.unwrap();
    assert_eq!(status, 0);

    assert!(harness.instance.read_response().await.unwrap().is_empty());
    assert_eq!(harness.instance.state().unwrap().response.len, 0);
}

#[tokio::test]
async fn test_standard_bridge_utils() {
    let bridge = standard_bridge(&guestbox_common::HandlersConfig::default()).unwrap();
    let host = Arc::new(HostFunctions::new());
    host.set_request_handler(Some(bridge.to_request_handler()));

    let mut harness = Harness::new(host, OpCode::Utils, true).await;
    let response = harness
        .request(br#"{"func":"hash","input":"hello"}"#)
        .await;

    let response = ResponsePayload::parse(&response).unwrap();
    assert_eq!(
        response.data,
        Some(json!(
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        ))
    );
}

#[tokio::test]
async fn test_missing_import_fails_instantiation() {
    let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
    let module = Arc::new(
        CompiledModule::from_wat(
            &engine,
            r#"(module (import "env" "not_a_host_fn" (func)) (memory (export "memory") 1))"#,
        )
        .unwrap(),
    );
    let linker = build_linker(&engine, Arc::new(HostFunctions::new())).unwrap();

    let result =
        GuestInstance::instantiate(&engine, module, &linker, &InstanceConfig::default()).await;
    assert!(matches!(
        result,
        Err(guestbox_common::RuntimeError::Instantiation { .. })
    ));
}
