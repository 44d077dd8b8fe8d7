//! Outbound HTTP for `OpCode::Fetch`.
//!
//! Every request is checked before it leaves the host:
//! 1. Per-evaluation request cap
//! 2. Allow-listed host
//! 3. SSRF protection (private and internal addresses are blocked)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use guestbox_common::HostFunctionError;

use crate::bridge::OpHandler;
use crate::payload::{FetchPayload, RequestPayload};
use crate::permissions::Permissions;

/// Largest response body handed back to the guest.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Response shape returned to the guest as `data`.
#[derive(Debug, Clone, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub ok: bool,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Response body accumulator that refuses to grow past `limit`.
#[derive(Debug)]
struct CappedBody {
    limit: usize,
    buf: Vec<u8>,
}

impl CappedBody {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<(), HostFunctionError> {
        let len = self.buf.len().saturating_add(chunk.len());
        if len > self.limit {
            return Err(HostFunctionError::invalid_argument(format!(
                "response body exceeds {} bytes",
                self.limit
            )));
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// HTTP handler with permission checks and a request cap.
pub struct FetchHandler {
    /// HTTP client (shared, connection pooled).
    client: Client,

    permissions: Permissions,

    /// Requests made in the current evaluation.
    request_count: AtomicU32,
}

impl FetchHandler {
    /// Create a handler with a default client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed (for
    /// example, no TLS backend is available).
    pub fn new(permissions: Permissions) -> Result<Self, HostFunctionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("guestbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HostFunctionError::handler(format!("HTTP client init failed: {e}")))?;

        Ok(Self::with_client(client, permissions))
    }

    /// Create with a custom HTTP client.
    pub fn with_client(client: Client, permissions: Permissions) -> Self {
        Self {
            client,
            permissions,
            request_count: AtomicU32::new(0),
        }
    }

    /// Perform one guest HTTP request.
    ///
    /// Non-2xx responses are returned as data with `ok: false`; only
    /// transport failures and policy violations are errors.
    ///
    /// # Errors
    ///
    /// - [`HostFunctionError::RateLimitExceeded`] past the request cap
    /// - [`HostFunctionError::PermissionDenied`] for a host that is not
    ///   allow-listed or resolves to a private address
    /// - [`HostFunctionError::InvalidArgument`] for an unknown method
    /// - [`HostFunctionError::HttpRequestFailed`] on transport errors
    pub async fn fetch(&self, request: FetchPayload) -> Result<FetchResponse, HostFunctionError> {
        let count = self.request_count.fetch_add(1, Ordering::SeqCst);
        if count >= self.permissions.max_http_requests {
            warn!(
                url = %request.url,
                count,
                max = self.permissions.max_http_requests,
                "HTTP rate limit exceeded"
            );
            return Err(HostFunctionError::RateLimitExceeded {
                operation: "fetch".into(),
            });
        }

        if !self.permissions.is_http_allowed(&request.url) {
            warn!(url = %request.url, "HTTP request blocked: not in allowed hosts");
            return Err(HostFunctionError::PermissionDenied {
                resource: format!("HTTP access to {}", request.url),
            });
        }

        if Permissions::is_private_address(&request.url) {
            warn!(url = %request.url, "HTTP request blocked: private address");
            return Err(HostFunctionError::PermissionDenied {
                resource: format!("HTTP access to {}", request.url),
            });
        }

        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| HostFunctionError::invalid_argument(format!("method {}", request.method)))?;

        debug!(%method, url = %request.url, "Executing HTTP request");

        let mut builder = self.client.request(method, &request.url);
        if let Some(timeout) = request.timeout.filter(|t| *t > 0) {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let failed = |status: u16| HostFunctionError::HttpRequestFailed {
            url: request.url.clone(),
            status,
        };

        let mut response = builder.send().await.map_err(|e| {
            warn!(url = %request.url, error = %e, "HTTP request failed");
            failed(e.status().map_or(0, |s| s.as_u16()))
        })?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut body = CappedBody::new(MAX_BODY_BYTES);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|_| failed(status.as_u16()))?
        {
            body.push(&chunk)?;
        }
        let body = body.into_inner();

        info!(
            url = %request.url,
            status = status.as_u16(),
            body_size = body.len(),
            "HTTP request completed"
        );

        Ok(FetchResponse {
            status: status.as_u16(),
            ok: status.is_success(),
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    /// Requests made in the current evaluation.
    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Reset the request counter.
    pub fn reset_count(&self) {
        self.request_count.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl OpHandler for FetchHandler {
    async fn call(&self, payload: RequestPayload) -> Result<Value, HostFunctionError> {
        let request: FetchPayload = payload.parse_as()?;
        let response = self.fetch(request).await?;
        Ok(serde_json::to_value(response)?)
    }

    fn begin_eval(&self) {
        self.reset_count();
    }
}
