//! Environment variable helpers.
//!
//! ```ignore
//! use handoff_core::env::env_get;
//!
//! let workers: usize = env_get("HANDOFF_POOL_WORKERS", 4);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`; unset or unparsable falls back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
