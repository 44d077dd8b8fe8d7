//! The guest module blob.

use std::sync::Arc;

use tracing::{info, warn};

use guestbox_common::{GuestConfig, RuntimeError};

/// Guest module bundled with the build.
pub static EMBEDDED_GUEST: &[u8] = include_bytes!("../guest/runtime.wasm");

/// Blobs shorter than this are placeholders: no real guest is available.
pub const DEGRADED_THRESHOLD: usize = 100;

/// Returns `true` if `bytes` is a placeholder rather than a real guest.
pub fn is_placeholder(bytes: &[u8]) -> bool {
    bytes.len() < DEGRADED_THRESHOLD
}

/// Load the guest configured by `config`.
///
/// `config.path` overrides the embedded blob and may name a binary or WAT
/// module.
///
/// # Errors
///
/// Returns [`RuntimeError::Io`] if the configured file cannot be read.
pub fn load(config: &GuestConfig) -> Result<Arc<[u8]>, RuntimeError> {
    let bytes: Arc<[u8]> = match &config.path {
        Some(path) => {
            let bytes = std::fs::read(path)?;
            info!(path = %path, bytes = bytes.len(), "Loaded guest module from file");
            bytes.into()
        }
        None => EMBEDDED_GUEST.into(),
    };

    if is_placeholder(&bytes) {
        warn!(
            bytes = bytes.len(),
            threshold = DEGRADED_THRESHOLD,
            "Guest module is a placeholder, runtime will run degraded"
        );
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_guest_is_placeholder() {
        assert!(is_placeholder(EMBEDDED_GUEST));
        assert_eq!(&EMBEDDED_GUEST[..4], b"\0asm");
    }

    #[test]
    fn test_threshold() {
        assert!(is_placeholder(&[0; 99]));
        assert!(!is_placeholder(&[0; 100]));
    }

    #[test]
    fn test_load_default_is_embedded() {
        let bytes = load(&GuestConfig::default()).unwrap();
        assert_eq!(&*bytes, EMBEDDED_GUEST);
    }

    #[test]
    fn test_load_missing_file() {
        let config = GuestConfig {
            path: Some("/nonexistent/guest.wasm".into()),
            ..GuestConfig::default()
        };
        assert!(matches!(load(&config), Err(RuntimeError::Io(_))));
    }
}
