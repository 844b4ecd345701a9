//! # handoff-module: Default implementations
//!
//! One default implementation per `handoff-core` trait. Each favours
//! correctness and simplicity; the channel is a plain pipe, the event
//! loop a thin layer over `polling`.
//!
//! ## Default stack
//!
//! | Trait          | Default Impl                 | Alternative            |
//! |----------------|------------------------------|------------------------|
//! | HandleSink     | WriteEnd (pipe)              | -                      |
//! | Multiplexer    | EventLoop<PollerSelector>    | EventLoop<S: Selector> |
//! | TaskSpawner    | ThreadPerTask                | FixedPool              |
//! | RequestHost    | RequestTable                 | host-provided          |

pub mod pipe_channel;
pub mod selector;
pub mod event_loop;
pub mod registry;
pub mod thread_per_task;
pub mod fixed_pool;
pub mod request_table;

pub use pipe_channel::{channel, FrameReader, FrameWriter, ReadEnd, WriteEnd};
pub use event_loop::EventLoop;
pub use selector::{PollerSelector, Selector};
pub use registry::TaskRegistry;
pub use thread_per_task::ThreadPerTask;
pub use fixed_pool::FixedPool;
pub use request_table::{Finalized, RequestTable};

use handoff_core::config::{HandoffConfig, SpawnerKind};
use handoff_core::error::HandoffError;
use handoff_core::worker::TaskSpawner;

/// Build the spawner selected by `config.spawner`.
pub fn spawner_from_config(config: &HandoffConfig) -> handoff_core::Result<Box<dyn TaskSpawner>> {
    let spawner: Box<dyn TaskSpawner> = match config.spawner {
        SpawnerKind::ThreadPerTask => Box::new(ThreadPerTask::new(config.max_outstanding)),
        SpawnerKind::FixedPool => Box::new(
            FixedPool::new(config.pool_workers, config.queue_depth)
                .map_err(|e| HandoffError::os(&e))?,
        ),
    };
    tracing::info!(kind = ?config.spawner, "task spawner ready");
    Ok(spawner)
}
