//! Environment variable helpers for `JDOCS_*` overrides.
//!
//! ```ignore
//! use jdocs_core::env::{env_get, env_get_millis};
//!
//! let port: u16 = env_get("JDOCS_PORT", 7788);
//! let idle = env_get_millis("JDOCS_IDLE_TIMEOUT_MS", Duration::from_secs(60));
//! ```

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Parse `key` as `T`, falling back to `default` when unset.
///
/// A value that is set but does not parse is reported and ignored.
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable environment override");
                default
            }
        },
        Err(_) => default,
    }
}

pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Millisecond count as a `Duration`.
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_get(key, default.as_millis() as u64))
}
