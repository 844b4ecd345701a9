//! Handoff configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use handoff_core::config::HandoffConfig;
//!
//! // Defaults with env overrides
//! let config = HandoffConfig::from_env();
//!
//! // Or customize programmatically
//! let config = HandoffConfig::from_env()
//!     .spawner(SpawnerKind::FixedPool)
//!     .pool_workers(8);
//! ```

pub mod defaults;

use crate::env::env_get;
use crate::error::{HandoffError, Result};
use crate::mux::Trigger;

use std::str::FromStr;
use std::time::Duration;

/// Which `TaskSpawner` implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnerKind {
    /// One detached thread per deferred request.
    ThreadPerTask,
    /// Bounded pool of `pool_workers` threads.
    FixedPool,
}

impl FromStr for SpawnerKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thread" | "thread-per-task" => Ok(Self::ThreadPerTask),
            "pool" | "fixed-pool" => Ok(Self::FixedPool),
            _ => Err(()),
        }
    }
}

/// Deferred-completion configuration with builder setters.
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    pub spawner: SpawnerKind,
    /// Threads in a `FixedPool`.
    pub pool_workers: usize,
    /// `FixedPool` queue capacity.
    pub queue_depth: usize,
    /// Cap on running thread-per-task workers (0 = unlimited).
    pub max_outstanding: usize,
    /// How long a worker keeps retrying a full pipe.
    pub write_stall_timeout: Duration,
    /// How long `exit_process` waits for running workers.
    pub drain_timeout: Duration,
    /// Trigger mode for the channel's read-end registration.
    pub trigger: Trigger,
    /// Events fetched per multiplexer wait.
    pub max_events: usize,
    pub max_registrations: usize,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            spawner: defaults::SPAWNER,
            pool_workers: defaults::POOL_WORKERS,
            queue_depth: defaults::QUEUE_DEPTH,
            max_outstanding: defaults::MAX_OUTSTANDING,
            write_stall_timeout: Duration::from_millis(defaults::WRITE_STALL_MS),
            drain_timeout: Duration::from_millis(defaults::DRAIN_TIMEOUT_MS),
            trigger: defaults::TRIGGER,
            max_events: defaults::MAX_EVENTS,
            max_registrations: defaults::MAX_REGISTRATIONS,
        }
    }
}

impl HandoffConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `HANDOFF_SPAWNER` - `thread` or `pool`
    /// - `HANDOFF_POOL_WORKERS` - Pool thread count
    /// - `HANDOFF_QUEUE_DEPTH` - Pool queue capacity
    /// - `HANDOFF_MAX_OUTSTANDING` - Thread-per-task cap (0 = none)
    /// - `HANDOFF_WRITE_STALL_MS` - Full-pipe retry budget
    /// - `HANDOFF_DRAIN_TIMEOUT_MS` - Shutdown drain budget
    /// - `HANDOFF_TRIGGER` - `edge`, `level` or `oneshot`
    /// - `HANDOFF_MAX_EVENTS` - Events per wait
    /// - `HANDOFF_MAX_REGISTRATIONS` - Registration table size
    pub fn from_env() -> Self {
        Self {
            spawner: env_parsed("HANDOFF_SPAWNER", defaults::SPAWNER),
            pool_workers: env_get("HANDOFF_POOL_WORKERS", defaults::POOL_WORKERS),
            queue_depth: env_get("HANDOFF_QUEUE_DEPTH", defaults::QUEUE_DEPTH),
            max_outstanding: env_get("HANDOFF_MAX_OUTSTANDING", defaults::MAX_OUTSTANDING),
            write_stall_timeout: Duration::from_millis(env_get(
                "HANDOFF_WRITE_STALL_MS",
                defaults::WRITE_STALL_MS,
            )),
            drain_timeout: Duration::from_millis(env_get(
                "HANDOFF_DRAIN_TIMEOUT_MS",
                defaults::DRAIN_TIMEOUT_MS,
            )),
            trigger: env_parsed("HANDOFF_TRIGGER", defaults::TRIGGER),
            max_events: env_get("HANDOFF_MAX_EVENTS", defaults::MAX_EVENTS),
            max_registrations: env_get("HANDOFF_MAX_REGISTRATIONS", defaults::MAX_REGISTRATIONS),
        }
    }

    pub fn spawner(mut self, kind: SpawnerKind) -> Self {
        self.spawner = kind;
        self
    }

    pub fn pool_workers(mut self, n: usize) -> Self {
        self.pool_workers = n;
        self
    }

    pub fn queue_depth(mut self, n: usize) -> Self {
        self.queue_depth = n;
        self
    }

    pub fn max_outstanding(mut self, n: usize) -> Self {
        self.max_outstanding = n;
        self
    }

    pub fn write_stall_timeout(mut self, d: Duration) -> Self {
        self.write_stall_timeout = d;
        self
    }

    pub fn drain_timeout(mut self, d: Duration) -> Self {
        self.drain_timeout = d;
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn max_registrations(mut self, n: usize) -> Self {
        self.max_registrations = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.spawner == SpawnerKind::FixedPool {
            if self.pool_workers == 0 {
                return Err(HandoffError::Config("pool_workers must be at least 1"));
            }
            if self.queue_depth == 0 {
                return Err(HandoffError::Config("queue_depth must be at least 1"));
            }
        }
        if self.max_events == 0 {
            return Err(HandoffError::Config("max_events must be at least 1"));
        }
        if self.max_registrations == 0 {
            return Err(HandoffError::Config("max_registrations must be at least 1"));
        }
        Ok(())
    }
}

fn env_parsed<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %val, "ignoring unparsable setting");
            default
        }),
        Err(_) => default,
    }
}
