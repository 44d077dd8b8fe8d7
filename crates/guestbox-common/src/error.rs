//! Error types for guestbox.
//!
//! This module defines the error taxonomy using `thiserror`:
//! - [`RuntimeError`]: Errors surfaced to callers of the runtime facade
//! - [`HostFunctionError`]: Errors raised by host-side request handlers
//!
//! Engine errors (Wasmtime traps, linker failures) are converted into
//! [`RuntimeError`] where they occur and never cross the facade boundary.

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// These errors represent failures that can occur during the lifecycle of
/// a sandboxed evaluation, from compiling the guest module to decoding the
/// guest's final response.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The guest binary is not a valid module for this engine.
    #[error("Compilation failed: {reason}")]
    Compile {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The guest could not be instantiated (unsatisfied imports, memory
    /// ceiling exceeded, missing exports).
    #[error("Instantiation failed: {reason}")]
    Instantiation {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// A read or write fell outside the guest's linear memory, or the
    /// instance has no memory at all.
    #[error("Memory access error: {reason}")]
    MemoryAccess {
        /// Description of the bounds violation.
        reason: String,
    },

    /// The guest entry point reported failure (non-zero status or trap).
    #[error("Guest execution failed: {message}")]
    GuestExecution {
        /// Human-readable message decoded from the guest response.
        message: String,
    },

    /// The evaluation deadline elapsed before the guest completed.
    #[error("Execution timeout after {duration_ms}ms")]
    Timeout {
        /// The deadline in milliseconds.
        duration_ms: u64,
    },

    /// The runtime has been closed.
    #[error("Runtime is closed")]
    Closed,

    /// An opcode was dispatched with no active handler.
    #[error("No handler registered for opcode {op}")]
    HandlerNotRegistered {
        /// The raw opcode value.
        op: u32,
    },

    /// Bytes crossing the guest boundary were not valid JSON.
    #[error("Payload decode failed: {reason}")]
    PayloadDecode {
        /// Description of the decode failure.
        reason: String,
    },

    /// The guest exhausted its instruction (fuel) budget.
    #[error("Fuel exhausted: instruction budget exceeded")]
    FuelExhausted,

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[source] HostFunctionError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Errors from host-side request handlers.
///
/// Most variants are *data* from the guest's point of view: the bridge
/// marshals them into the `error` field of a normal response envelope.
/// The variants for which [`HostFunctionError::is_fail_closed`] returns
/// `true` are bridge-level failures and produce the sentinel `0` response
/// instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostFunctionError {
    /// The handler itself failed; the message is passed through verbatim.
    #[error("{0}")]
    Handler(String),

    /// No handler is registered for the requested opcode.
    #[error("No handler registered for opcode {op}")]
    HandlerNotRegistered {
        /// The raw opcode value.
        op: u32,
    },

    /// The request payload was not valid JSON for the operation.
    #[error("Payload decode failed: {reason}")]
    PayloadDecode {
        /// Description of the decode failure.
        reason: String,
    },

    /// An HTTP request made on behalf of the guest failed.
    #[error("HTTP request failed: {url} (status: {status})")]
    HttpRequestFailed {
        /// The URL that was requested.
        url: String,
        /// The HTTP status code (0 if connection failed).
        status: u16,
    },

    /// The requested operation was denied by the permission system.
    #[error("Permission denied: {resource}")]
    PermissionDenied {
        /// Description of the resource that access was denied to.
        resource: String,
    },

    /// Key-value store operation failed.
    #[error("KV store error: {0}")]
    KvStore(String),

    /// Rate limit for host function calls was exceeded.
    #[error("Rate limit exceeded: {operation}")]
    RateLimitExceeded {
        /// The operation that was rate-limited.
        operation: String,
    },

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },
}

impl RuntimeError {
    /// Create a new `Compile` error.
    pub fn compile(reason: impl Into<String>) -> Self {
        Self::Compile {
            reason: reason.into(),
        }
    }

    /// Create a new `Instantiation` error.
    pub fn instantiation(reason: impl Into<String>) -> Self {
        Self::Instantiation {
            reason: reason.into(),
        }
    }

    /// Create a new `MemoryAccess` error.
    pub fn memory_access(reason: impl Into<String>) -> Self {
        Self::MemoryAccess {
            reason: reason.into(),
        }
    }

    /// Create a new `GuestExecution` error.
    pub fn guest_execution(message: impl Into<String>) -> Self {
        Self::GuestExecution {
            message: message.into(),
        }
    }

    /// Create a new `PayloadDecode` error.
    pub fn payload_decode(reason: impl Into<String>) -> Self {
        Self::PayloadDecode {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the evaluation deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if the operation was attempted after close.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::FuelExhausted | Self::Timeout { .. })
    }

    /// The guest-provided message, if this is a guest execution failure.
    pub fn guest_message(&self) -> Option<&str> {
        match self {
            Self::GuestExecution { message } => Some(message),
            _ => None,
        }
    }
}

impl From<HostFunctionError> for RuntimeError {
    fn from(err: HostFunctionError) -> Self {
        match err {
            HostFunctionError::HandlerNotRegistered { op } => Self::HandlerNotRegistered { op },
            HostFunctionError::PayloadDecode { reason } => Self::PayloadDecode { reason },
            other => Self::HostFunction(other),
        }
    }
}

impl HostFunctionError {
    /// Create a new `Handler` error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Create a new `PayloadDecode` error.
    pub fn payload_decode(reason: impl Into<String>) -> Self {
        Self::PayloadDecode {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Returns `true` for bridge-level failures that must not be delivered
    /// to the guest as an `error` envelope.
    pub fn is_fail_closed(&self) -> bool {
        matches!(
            self,
            Self::HandlerNotRegistered { .. } | Self::PayloadDecode { .. }
        )
    }
}

impl From<serde_json::Error> for HostFunctionError {
    fn from(err: serde_json::Error) -> Self {
        Self::payload_decode(err.to_string())
    }
}
