//! Host side of the guestbox ABI.
//!
//! Guest code reaches the host through a small set of `env` imports (see
//! [`linker`]). This crate provides:
//!
//! - [`hostfn`]: The callback registry every import dispatches to
//! - [`linker`]: Registration of the imports and WASI preview1
//! - [`opcode`] / [`payload`]: The request/response wire format
//! - [`bridge`]: Opcode-keyed handler routing
//! - [`handlers`]: Reference handlers for fetch, key-value, secrets and utils
//! - [`permissions`]: Capability checks for the reference handlers
//! - [`logging`]: Guest console output as `tracing` events
//!
//! # Request cycle
//!
//! ```text
//! guest ──host_request(op, ptr, len)──▶ HostFunctions::dispatch
//!                                           │
//!                                           ▼
//!                                  RequestHandler / Bridge
//!                                           │
//!       ◀──ptr of {"data": ...} or {"error": ...}, or 0──┘
//! ```

pub mod bridge;
pub mod handlers;
pub mod hostfn;
pub mod linker;
pub mod logging;
pub mod opcode;
pub mod payload;
pub mod permissions;

pub use bridge::{Bridge, OpHandler, op_fn};
pub use handlers::standard_bridge;
pub use hostfn::{
    ConsoleCallback, ErrorHandler, EvalScope, HostFunctions, LogHandler, RequestHandler,
    handler_fn,
};
pub use linker::{build_linker, register_all};
pub use logging::LoggingHost;
pub use opcode::OpCode;
pub use payload::{RequestPayload, ResponsePayload, marshal_response};
pub use permissions::Permissions;
