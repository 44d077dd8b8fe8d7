//! Core Wasmtime runtime for guestbox.
//!
//! This crate provides the fundamental WebAssembly execution capabilities:
//! - [`WasmEngine`]: Configured Wasmtime engine with an epoch ticker
//! - [`ModuleCache`] / [`CompiledModule`]: Compile-once module cache
//! - [`GuestState`]: Per-instance store state reachable from host functions
//! - [`GuestInstance`]: Instance lifecycle and bounds-checked memory access
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared by a runtime, thread-safe)                     │
//! │  - Fuel metering, epoch ticker                          │
//! │  - Optional pooling allocator                           │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │           ModuleCache → Arc<CompiledModule>             │
//! │  (Keyed by engine id + content hash)                    │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        GuestInstance (Store<GuestState> + Instance)     │
//! │  (One per evaluation, isolated)                         │
//! │  - Linear memory, response slot                         │
//! │  - Fuel, memory ceiling, epoch yields                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod instance;
pub mod module;
pub mod store;

pub use engine::WasmEngine;
pub use instance::{GuestInstance, InstanceConfig, checked_range};
pub use module::{CompiledModule, ModuleCache, clear_cache};
pub use store::{ExecutionMetrics, GuestState, LogLevel, ResponseSlot};
