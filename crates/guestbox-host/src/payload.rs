//! Request/response envelope codec.
//!
//! The guest writes a JSON [`RequestPayload`] into its memory before calling
//! `host_request`; the host answers with a [`ResponsePayload`] holding either
//! `data` or `error`. The codec only checks that the bytes are JSON. The
//! operation-specific shapes (`FetchPayload`, `KvPayload`, ...) are parsed by
//! the handlers that own them.

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use guestbox_common::HostFunctionError;

/// Generic request envelope.
///
/// Well-known fields are lifted out; anything else the guest sent is kept in
/// [`extra`](Self::extra) and is still visible to [`parse_as`](Self::parse_as).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Operation name within the opcode, e.g. `"list"` for a DB query.
    #[serde(default)]
    pub op: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Operation-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestPayload {
    /// Decode an envelope from guest bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HostFunctionError::PayloadDecode`] if the bytes are not a
    /// JSON object.
    pub fn parse(bytes: &[u8]) -> Result<Self, HostFunctionError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Re-read the whole envelope as an operation-specific shape.
    ///
    /// # Errors
    ///
    /// Returns [`HostFunctionError::PayloadDecode`] if the envelope does not
    /// fit `T`.
    pub fn parse_as<T: DeserializeOwned>(&self) -> Result<T, HostFunctionError> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Look up an operation-specific field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }
}

/// Response envelope.
///
/// `data` and `error` are mutually exclusive. `data: Some(Value::Null)` is a
/// successful response whose value is `null`, which is distinct from an
/// absent `data` field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    /// A successful response carrying `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    /// A failed response carrying a human-readable message.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(message.into()),
        }
    }

    /// Decode a response envelope.
    ///
    /// # Errors
    ///
    /// Returns [`HostFunctionError::PayloadDecode`] for non-JSON bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, HostFunctionError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Returns `true` if the `error` field is set and non-empty.
    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// Split into the success value or the error message.
    ///
    /// # Errors
    ///
    /// Returns the `error` field if it is set and non-empty.
    pub fn into_result(self) -> Result<Option<Value>, String> {
        match self.error {
            Some(error) if !error.is_empty() => Err(error),
            _ => Ok(self.data),
        }
    }

    /// Encode to JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self)
            .unwrap_or_else(|_| br#"{"error":"response encoding failed"}"#.to_vec())
    }
}

/// Keep an explicit `null` as `Some(Value::Null)`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Encode a handler outcome as a response envelope.
///
/// `Ok(value)` becomes `{"data": value}`, `Err(e)` becomes
/// `{"error": e.to_string()}`.
pub fn marshal_response<E: Display>(result: Result<Value, E>) -> Vec<u8> {
    match result {
        Ok(data) => ResponsePayload::ok(data),
        Err(error) => ResponsePayload::err(error.to_string()),
    }
    .to_bytes()
}

/// Database query (`OpCode::DbQuery`, `OpCode::VectorSearch`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DbQueryPayload {
    pub op: String,
    pub col: String,
    pub id: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub expand: Option<String>,
    pub data: Option<Value>,
    pub vector: Vec<f32>,
    pub field: Option<String>,
    pub top: Option<u32>,
}

/// Outbound HTTP request (`OpCode::Fetch`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchPayload {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub body: Option<String>,

    /// Request timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Key-value access (`OpCode::KvGet`, `OpCode::KvSet`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvPayload {
    pub key: String,
    pub value: Option<Value>,
    /// Expiry in seconds; `None` or `0` never expires.
    pub ttl: Option<u64>,
}

/// Secret lookup (`OpCode::SecretGet`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretPayload {
    pub key: String,
}

/// Background job (`OpCode::JobEnqueue`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPayload {
    pub topic: String,
    pub payload: Option<Value>,
}

/// File access (`OpCode::FileRead`, `OpCode::FileSave`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilePayload {
    pub collection: String,
    pub record_id: String,
    pub filename: String,
    pub data: Option<String>,
}

/// Transaction control (`OpCode::TxBegin`, `OpCode::TxCommit`, `OpCode::TxRollback`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TxPayload {
    pub tx_id: String,
}

/// Utility call (`OpCode::Utils`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UtilsPayload {
    pub func: String,
    pub input: Option<String>,
    pub len: Option<usize>,
}

fn parse_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, HostFunctionError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Parse a [`DbQueryPayload`].
///
/// # Errors
///
/// Returns [`HostFunctionError::PayloadDecode`] on malformed JSON.
pub fn parse_db_query_payload(bytes: &[u8]) -> Result<DbQueryPayload, HostFunctionError> {
    parse_payload(bytes)
}

/// Parse a [`FetchPayload`].
///
/// # Errors
///
/// Returns [`HostFunctionError::PayloadDecode`] on malformed JSON or a
/// missing `url`.
pub fn parse_fetch_payload(bytes: &[u8]) -> Result<FetchPayload, HostFunctionError> {
    parse_payload(bytes)
}

/// Parse a [`KvPayload`].
///
/// # Errors
///
/// Returns [`HostFunctionError::PayloadDecode`] on malformed JSON.
pub fn parse_kv_payload(bytes: &[u8]) -> Result<KvPayload, HostFunctionError> {
    parse_payload(bytes)
}

/// Parse a [`SecretPayload`].
///
/// # Errors
///
/// Returns [`HostFunctionError::PayloadDecode`] on malformed JSON.
pub fn parse_secret_payload(bytes: &[u8]) -> Result<SecretPayload, HostFunctionError> {
    parse_payload(bytes)
}

/// Parse a [`JobPayload`].
///
/// # Errors
///
/// Returns [`HostFunctionError::PayloadDecode`] on malformed JSON.
pub fn parse_job_payload(bytes: &[u8]) -> Result<JobPayload, HostFunctionError> {
    parse_payload(bytes)
}

/// Parse a [`FilePayload`].
///
/// # Errors
///
/// Returns [`HostFunctionError::PayloadDecode`] on malformed JSON.
pub fn parse_file_payload(bytes: &[u8]) -> Result<FilePayload, HostFunctionError> {
    parse_payload(bytes)
}

/// Parse a [`TxPayload`].
///
/// # Errors
///
/// Returns [`HostFunctionError::PayloadDecode`] on malformed JSON.
pub fn parse_tx_payload(bytes: &[u8]) -> Result<TxPayload, HostFunctionError> {
    parse_payload(bytes)
}

/// Parse a [`UtilsPayload`].
///
/// # Errors
///
/// Returns [`HostFunctionError::PayloadDecode`] on malformed JSON.
pub fn parse_utils_payload(bytes: &[u8]) -> Result<UtilsPayload, HostFunctionError> {
    parse_payload(bytes)
}
