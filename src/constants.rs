//! Global constants for logind-poker
//!
//! Bus names, timing defaults and exit codes in one place.

use std::time::Duration;

// ============================================================================
// logind D-Bus Names
// ============================================================================

/// Prefix of per-session object paths
pub const LOGIND_SESSION_PATH_PREFIX: &str = "/org/freedesktop/login1/session/";

/// Session interface name (used to filter PropertiesChanged)
pub const LOGIND_SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";

// ============================================================================
// Timing Constants
// ============================================================================

/// Default timeout for setup calls (TakeControl, TakeDevice, ListSessions)
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5000;

/// Default timestamp format for event lines
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%H:%M:%S%.3f";

/// Convert a millisecond setting into a Duration (0 is clamped to 1ms)
pub fn call_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

// ============================================================================
// Exit Codes (BSD sysexits.h)
// ============================================================================

pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const USAGE: i32 = 64; // EX_USAGE: command line usage error
    pub const SESSION_NOT_FOUND: i32 = 67; // EX_NOUSER: addressee unknown
    pub const CONNECTION_LOST: i32 = 69; // EX_UNAVAILABLE: service unavailable
    pub const TIMEOUT: i32 = 75; // EX_TEMPFAIL: temporary failure
    pub const NO_CONTROL: i32 = 77; // EX_NOPERM: permission denied
    pub const CONFIG: i32 = 78; // EX_CONFIG: configuration error
}
