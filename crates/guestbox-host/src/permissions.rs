//! Capability checks for the reference handlers.
//!
//! [`Permissions`] decides which opcodes the standard handler set serves
//! and which hosts the fetch handler may contact.

use std::collections::{BTreeSet, HashSet};

use guestbox_common::HandlersConfig;

use crate::opcode::OpCode;

/// Capabilities granted to guest code.
///
/// Nothing is allowed by default: every opcode and every HTTP host must be
/// granted explicitly.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    /// Allowed HTTP hosts (domain patterns).
    ///
    /// Patterns can be:
    /// - Exact match: `api.example.com`
    /// - Wildcard subdomain: `*.example.com` (matches `api.example.com` and `example.com`)
    /// - All hosts: `*`
    pub allowed_http_hosts: HashSet<String>,

    /// Maximum HTTP requests per evaluation.
    pub max_http_requests: u32,

    /// Opcodes the guest may use.
    pub allowed_ops: BTreeSet<OpCode>,
}

impl Permissions {
    /// Create a permission set with all capabilities disabled.
    pub fn none() -> Self {
        Self::default()
    }

    /// Create a permission set with every opcode and every HTTP host allowed.
    ///
    /// For tests and local development.
    pub fn all() -> Self {
        Self {
            allowed_http_hosts: HashSet::from(["*".to_string()]),
            max_http_requests: 100,
            allowed_ops: OpCode::ALL.into_iter().collect(),
        }
    }

    /// Derive permissions from handler configuration.
    ///
    /// Utils is always allowed. Fetch is allowed when at least one host is
    /// listed, key-value ops when `kv_enabled`, secrets when any are defined.
    pub fn from_config(config: &HandlersConfig) -> Self {
        let mut builder = Self::builder()
            .allow_op(OpCode::Utils)
            .max_http_requests(config.max_http_requests);

        if !config.allowed_http_hosts.is_empty() {
            builder = builder.allow_http_hosts(config.allowed_http_hosts.iter().cloned());
        }
        if config.kv_enabled {
            builder = builder.allow_op(OpCode::KvGet).allow_op(OpCode::KvSet);
        }
        if !config.secrets.is_empty() {
            builder = builder.allow_op(OpCode::SecretGet);
        }

        builder.build()
    }

    /// Create a builder for constructing permissions.
    pub fn builder() -> PermissionsBuilder {
        PermissionsBuilder::default()
    }

    /// Returns `true` if the guest may use `op`.
    pub fn allows_op(&self, op: OpCode) -> bool {
        self.allowed_ops.contains(&op)
    }

    /// Check if HTTP access to the given URL is allowed.
    ///
    /// Requires the fetch opcode and a host matching one of the patterns.
    /// Private addresses are checked separately by
    /// [`is_private_address`](Self::is_private_address).
    pub fn is_http_allowed(&self, url: &str) -> bool {
        if !self.allows_op(OpCode::Fetch) {
            return false;
        }

        if self.allowed_http_hosts.contains("*") {
            return true;
        }

        let Some(host) = url::Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_lowercase))
        else {
            return false;
        };

        self.allowed_http_hosts
            .iter()
            .any(|pattern| Self::matches_pattern(pattern, &host))
    }

    /// Check if a host matches a permission pattern.
    fn matches_pattern(pattern: &str, host: &str) -> bool {
        let pattern = pattern.to_lowercase();

        match pattern.strip_prefix("*.") {
            Some(domain) => host == domain || host.ends_with(&format!(".{domain}")),
            None => pattern == host,
        }
    }

    /// Check if the URL targets a private or internal address.
    ///
    /// Blocks loopback, RFC 1918 ranges, link-local (including the cloud
    /// metadata endpoint), broadcast, documentation and unspecified
    /// addresses. Unparseable URLs count as private.
    pub fn is_private_address(url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return true;
        };

        match parsed.host() {
            Some(url::Host::Domain(domain)) => {
                let domain = domain.to_lowercase();
                domain == "localhost"
                    || domain.ends_with(".localhost")
                    || domain == "metadata.google.internal"
            }
            Some(url::Host::Ipv4(v4)) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_documentation()
                    || v4.is_unspecified()
            }
            Some(url::Host::Ipv6(v6)) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.to_ipv4_mapped().is_some_and(|v4| {
                        v4.is_private() || v4.is_loopback() || v4.is_link_local()
                    })
            }
            None => true,
        }
    }
}

/// Builder for [`Permissions`].
#[derive(Debug, Default)]
pub struct PermissionsBuilder {
    inner: Permissions,
}

impl PermissionsBuilder {
    /// Allow HTTP access to specific hosts; also grants the fetch opcode.
    #[must_use]
    pub fn allow_http_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.allowed_ops.insert(OpCode::Fetch);
        self.inner
            .allowed_http_hosts
            .extend(hosts.into_iter().map(Into::into));
        self
    }

    /// Set the maximum number of HTTP requests per evaluation.
    #[must_use]
    pub fn max_http_requests(mut self, max: u32) -> Self {
        self.inner.max_http_requests = max;
        self
    }

    /// Allow one opcode.
    #[must_use]
    pub fn allow_op(mut self, op: OpCode) -> Self {
        self.inner.allowed_ops.insert(op);
        self
    }

    /// Build the permissions.
    #[must_use]
    pub fn build(self) -> Permissions {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_permissions_none() {
        let perms = Permissions::none();
        assert!(perms.allowed_ops.is_empty());
        assert!(perms.allowed_http_hosts.is_empty());
        assert!(!perms.is_http_allowed("https://api.example.com/path"));
    }

    #[test]
    fn test_permissions_all() {
        let perms = Permissions::all();
        assert!(OpCode::ALL.iter().all(|op| perms.allows_op(*op)));
        assert!(perms.is_http_allowed("https://evil.com/path"));
    }

    #[test]
    fn test_http_allowed_exact_match() {
        let perms = Permissions::builder()
            .allow_http_hosts(["api.example.com"])
            .build();

        assert!(perms.is_http_allowed("https://api.example.com/path"));
        assert!(perms.is_http_allowed("https://API.example.com/path"));
        assert!(!perms.is_http_allowed("https://other.example.com/path"));
        assert!(!perms.is_http_allowed("not a url"));
    }

    #[test]
    fn test_http_allowed_wildcard() {
        let perms = Permissions::builder()
            .allow_http_hosts(["*.example.com"])
            .build();

        assert!(perms.is_http_allowed("https://api.example.com/path"));
        assert!(perms.is_http_allowed("https://example.com/path"));
        assert!(!perms.is_http_allowed("https://badexample.com/path"));
        assert!(!perms.is_http_allowed("https://evil.com/path"));
    }

    #[test]
    fn test_private_address_localhost() {
        assert!(Permissions::is_private_address("http://localhost:8080/"));
        assert!(Permissions::is_private_address("http://127.0.0.1:8080/"));
        assert!(Permissions::is_private_address("http://[::1]:8080/"));
        assert!(Permissions::is_private_address("http://[::ffff:10.0.0.1]/"));
    }

    #[test]
    fn test_private_address_private_ranges() {
        assert!(Permissions::is_private_address("http://10.0.0.1/"));
        assert!(Permissions::is_private_address("http://172.16.0.1/"));
        assert!(Permissions::is_private_address("http://192.168.1.1/"));
        assert!(Permissions::is_private_address("http://169.254.169.254/"));
        assert!(Permissions::is_private_address(
            "http://metadata.google.internal/"
        ));
    }

    #[test]
    fn test_private_address_public() {
        assert!(!Permissions::is_private_address("https://api.example.com/"));
        assert!(!Permissions::is_private_address("https://8.8.8.8/"));
    }

    #[test]
    fn test_from_config() {
        let config = HandlersConfig {
            allowed_http_hosts: vec!["api.example.com".into()],
            max_http_requests: 5,
            kv_enabled: false,
            secrets: BTreeMap::from([("TOKEN".to_string(), "t".to_string())]),
        };

        let perms = Permissions::from_config(&config);

        assert!(perms.allows_op(OpCode::Fetch));
        assert!(perms.allows_op(OpCode::SecretGet));
        assert!(perms.allows_op(OpCode::Utils));
        assert!(!perms.allows_op(OpCode::KvGet));
        assert!(!perms.allows_op(OpCode::DbQuery));
        assert_eq!(perms.max_http_requests, 5);
    }

    #[test]
    fn test_from_default_config() {
        let perms = Permissions::from_config(&HandlersConfig::default());

        assert!(!perms.allows_op(OpCode::Fetch));
        assert!(perms.allows_op(OpCode::KvGet));
        assert!(perms.allows_op(OpCode::KvSet));
        assert!(!perms.allows_op(OpCode::SecretGet));
    }
}
