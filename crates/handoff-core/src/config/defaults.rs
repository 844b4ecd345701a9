//! Compile-time defaults. Every value can be overridden from the
//! environment, see [`HandoffConfig::from_env`](super::HandoffConfig::from_env).

use crate::mux::Trigger;

use super::SpawnerKind;

pub const SPAWNER: SpawnerKind = SpawnerKind::ThreadPerTask;
pub const POOL_WORKERS: usize = 4;
pub const QUEUE_DEPTH: usize = 1024;
/// 0 = no cap on outstanding thread-per-task workers.
pub const MAX_OUTSTANDING: usize = 0;
pub const WRITE_STALL_MS: u64 = 1000;
pub const DRAIN_TIMEOUT_MS: u64 = 5000;
pub const TRIGGER: Trigger = Trigger::Edge;
pub const MAX_EVENTS: usize = 256;
pub const MAX_REGISTRATIONS: usize = 65536;
