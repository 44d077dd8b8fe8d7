//! Utility functions for `OpCode::Utils`.
//!
//! | `func`         | result                                   |
//! |----------------|------------------------------------------|
//! | `uuid`         | random v4 UUID                           |
//! | `hash`         | SHA-256 of `input`, lowercase hex        |
//! | `randomString` | `len` alphanumeric characters (def. 16)  |

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use sha2::{Digest, Sha256};

use guestbox_common::HostFunctionError;

use crate::bridge::OpHandler;
use crate::payload::{RequestPayload, UtilsPayload};

const DEFAULT_RANDOM_LEN: usize = 16;
const MAX_RANDOM_LEN: usize = 4096;

/// Stateless utility handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct UtilsHandler;

/// A random v4 UUID.
pub fn uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// SHA-256 of `input` as lowercase hex.
pub fn hash(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// `len` random ASCII alphanumeric characters.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[async_trait]
impl OpHandler for UtilsHandler {
    async fn call(&self, payload: RequestPayload) -> Result<Value, HostFunctionError> {
        let request: UtilsPayload = payload.parse_as()?;

        let result = match request.func.as_str() {
            "uuid" => uuid(),
            "hash" => {
                let input = request
                    .input
                    .ok_or_else(|| HostFunctionError::invalid_argument("hash requires `input`"))?;
                hash(&input)
            }
            "randomString" => {
                let len = request.len.unwrap_or(DEFAULT_RANDOM_LEN);
                if len > MAX_RANDOM_LEN {
                    return Err(HostFunctionError::invalid_argument(format!(
                        "len {len} exceeds {MAX_RANDOM_LEN}"
                    )));
                }
                random_string(len)
            }
            other => {
                return Err(HostFunctionError::invalid_argument(format!(
                    "unknown utils func `{other}`"
                )));
            }
        };

        Ok(Value::String(result))
    }
}
