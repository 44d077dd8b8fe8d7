//! Static secrets for `OpCode::SecretGet`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use guestbox_common::HostFunctionError;

use crate::bridge::OpHandler;
use crate::payload::{RequestPayload, SecretPayload};

/// Serves secrets from a fixed map.
///
/// Values never appear in logs; only the key that was looked up does.
pub struct SecretsHandler {
    secrets: BTreeMap<String, String>,
}

impl SecretsHandler {
    pub fn new(secrets: BTreeMap<String, String>) -> Self {
        Self { secrets }
    }
}

impl std::fmt::Debug for SecretsHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsHandler")
            .field("keys", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl OpHandler for SecretsHandler {
    async fn call(&self, payload: RequestPayload) -> Result<Value, HostFunctionError> {
        let SecretPayload { key } = payload.parse_as()?;
        debug!(%key, "Secret lookup");

        self.secrets
            .get(&key)
            .map(|value| Value::String(value.clone()))
            .ok_or_else(|| HostFunctionError::PermissionDenied {
                resource: format!("secret {key}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> SecretsHandler {
        SecretsHandler::new(BTreeMap::from([(
            "OPENAI_API_KEY".to_string(),
            "sk-test".to_string(),
        )]))
    }

    #[tokio::test]
    async fn test_known_secret() {
        let payload = RequestPayload::parse(br#"{"key":"OPENAI_API_KEY"}"#).unwrap();
        let value = handler().call(payload).await.unwrap();
        assert_eq!(value, Value::String("sk-test".into()));
    }

    #[tokio::test]
    async fn test_unknown_secret() {
        let payload = RequestPayload::parse(br#"{"key":"MISSING"}"#).unwrap();
        let result = handler().call(payload).await;
        assert!(matches!(
            result,
            Err(HostFunctionError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_debug_hides_values() {
        let debug = format!("{:?}", handler());
        assert!(debug.contains("OPENAI_API_KEY"));
        assert!(!debug.contains("sk-test"));
    }
}
