//! Environment-driven configuration helpers
//!
//! Every `*Config::from_env()` in the workspace is built from these. Unset
//! or unparsable variables fall back to the supplied default.
//!
//! ```ignore
//! use evsock_core::env::{env_get, env_flag};
//!
//! let batch: usize = env_get("EVSOCK_POLL_BATCH", 1024);
//! let edge = env_flag("EVSOCK_EDGE_TRIGGERED", true);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or return `default`
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and well formed
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Read `key` as a boolean flag
///
/// "1", "true", "yes" and "on" (any case) are true; "0", "false", "no" and
/// "off" are false. Anything else, including unset, yields `default`.
#[inline]
pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Non-empty string value of `key`
#[inline]
pub fn env_get_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// First non-empty value among `keys`, in order
pub fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| env_get_string(k))
}
