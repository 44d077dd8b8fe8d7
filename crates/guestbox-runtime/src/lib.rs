//! Execution orchestration and the runtime facade.
//!
//! - [`Runtime`]: The stable interface applications evaluate through
//! - [`WasmRuntime`]: Wasmtime-backed implementation
//! - [`MockRuntime`]: In-process test double
//! - [`Orchestrator`]: Drives one evaluation against a compiled module
//!
//! ```ignore
//! let runtime = create_runtime(&RuntimeConfig::default())?;
//! runtime.init().await?;
//!
//! let result = runtime.eval("1 + 2").await?;
//! println!("{result}");
//!
//! runtime.close().await?;
//! ```

pub mod guest;
pub mod mock;
pub mod options;
pub mod orchestrator;
pub mod runtime;
pub mod stub;
pub mod wasm;

pub use mock::{EvalFn, MockRuntime};
pub use options::{EvalOptions, EvalResult};
pub use orchestrator::{ExecutionState, Orchestrator, decode_result};
pub use runtime::{Runtime, create_runtime};
pub use wasm::WasmRuntime;
