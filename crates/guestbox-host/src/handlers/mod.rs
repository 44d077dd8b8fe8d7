//! Reference handlers for the standard opcodes.
//!
//! [`standard_bridge`] wires a [`Bridge`] from [`HandlersConfig`]:
//!
//! | opcode                  | handler            | enabled when                |
//! |-------------------------|--------------------|-----------------------------|
//! | `Fetch`                 | [`FetchHandler`]   | `allowed_http_hosts` is set |
//! | `KvGet` / `KvSet`       | [`KvGetHandler`] / [`KvSetHandler`] | `kv_enabled` |
//! | `SecretGet`             | [`SecretsHandler`] | `secrets` is not empty      |
//! | `Utils`                 | [`UtilsHandler`]   | always                      |
//!
//! Database, job, file, vector and transaction opcodes have no reference
//! implementation; embedders register their own handlers on the bridge.

pub mod fetch;
pub mod kv;
pub mod secrets;
pub mod utils;

use std::sync::Arc;

use tracing::info;

use guestbox_common::{HandlersConfig, HostFunctionError};

use crate::bridge::Bridge;
use crate::opcode::OpCode;
use crate::permissions::Permissions;

pub use fetch::{FetchHandler, FetchResponse};
pub use kv::{KvGetHandler, KvSetHandler, KvStore};
pub use secrets::SecretsHandler;
pub use utils::UtilsHandler;

/// Build a bridge with the reference handlers `config` enables.
///
/// # Errors
///
/// Returns an error if the HTTP client for the fetch handler cannot be
/// built.
pub fn standard_bridge(config: &HandlersConfig) -> Result<Arc<Bridge>, HostFunctionError> {
    let permissions = Permissions::from_config(config);
    let bridge = Arc::new(Bridge::new());

    if permissions.allows_op(OpCode::Fetch) {
        bridge.register_handler(
            OpCode::Fetch,
            Arc::new(FetchHandler::new(permissions.clone())?),
        );
    }

    if permissions.allows_op(OpCode::KvGet) || permissions.allows_op(OpCode::KvSet) {
        let store = Arc::new(KvStore::new());
        bridge.register_handler(OpCode::KvGet, Arc::new(KvGetHandler::new(Arc::clone(&store))));
        bridge.register_handler(OpCode::KvSet, Arc::new(KvSetHandler::new(store)));
    }

    if permissions.allows_op(OpCode::SecretGet) {
        bridge.register_handler(
            OpCode::SecretGet,
            Arc::new(SecretsHandler::new(config.secrets.clone())),
        );
    }

    if permissions.allows_op(OpCode::Utils) {
        bridge.register_handler(OpCode::Utils, Arc::new(UtilsHandler));
    }

    info!(opcodes = ?bridge.opcodes(), "Standard handlers registered");
    Ok(bridge)
}
