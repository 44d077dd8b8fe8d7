//! Guest console output as `tracing` events.
//!
//! Every message a guest prints through `host_log`, `host_error` or the
//! `console_*` aliases is emitted here with `guest_log = true`, so it can be
//! filtered apart from the runtime's own logs.

use guestbox_core::LogLevel;
use tracing::{error, info, warn};

/// Host implementation of guest console logging.
pub struct LoggingHost;

impl LoggingHost {
    /// Emit a guest message at the matching `tracing` level.
    ///
    /// `console.log` maps to `INFO`, `console.warn` to `WARN` and
    /// `console.error` to `ERROR`.
    pub fn emit(request_id: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Log => info!(request_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(request_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(request_id, guest_log = true, "{}", message),
        }
    }
}

/// Convert a numeric log level from the guest ABI.
///
/// `0` is log, `1` warn, `2` error; unknown values are treated as log.
pub fn level_from_u32(level: u32) -> LogLevel {
    LogLevel::from_u32(level)
}

/// Level used by each legacy `console_*` import.
pub fn console_import_level(import: &str) -> Option<LogLevel> {
    match import {
        "console_log" => Some(LogLevel::Log),
        "console_warn" => Some(LogLevel::Warn),
        "console_error" => Some(LogLevel::Error),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_does_not_panic_without_subscriber() {
        LoggingHost::emit("req-1", LogLevel::Log, "hello");
        LoggingHost::emit("req-1", LogLevel::Warn, "careful");
        LoggingHost::emit("req-1", LogLevel::Error, "boom");
    }

    #[test]
    fn test_level_from_u32() {
        assert_eq!(level_from_u32(0), LogLevel::Log);
        assert_eq!(level_from_u32(1), LogLevel::Warn);
        assert_eq!(level_from_u32(2), LogLevel::Error);
        assert_eq!(level_from_u32(99), LogLevel::Log);
    }

    #[test]
    fn test_console_import_level() {
        assert_eq!(console_import_level("console_log"), Some(LogLevel::Log));
        assert_eq!(console_import_level("console_warn"), Some(LogLevel::Warn));
        assert_eq!(console_import_level("console_error"), Some(LogLevel::Error));
        assert_eq!(console_import_level("host_log"), None);
    }
}
