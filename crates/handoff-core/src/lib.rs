//! # handoff-core: Trait definitions for deferred request completion
//!
//! A single-threaded reactor owns every request. Some requests need work
//! that blocks (sleeps, disk, a slow backend), so the content handler hands
//! the request's [`RequestHandle`] to a worker thread and tells the host
//! "not finished yet". When the worker is done it writes the handle back
//! through a non-blocking channel watched by the reactor, and the reactor
//! finalizes the request on its own thread.
//!
//! This crate defines the trait boundaries for every piece of that path:
//!
//! | Concern                | Trait / type                         |
//! |------------------------|--------------------------------------|
//! | Ownership token        | [`RequestHandle`], [`HandleValue`]   |
//! | Wire framing           | [`frame`]                            |
//! | Worker → reactor write | [`HandleSink`]                       |
//! | Event registration     | [`Registrar`], [`Multiplexer`]       |
//! | Host request API       | [`RequestHost`], [`Respond`]         |
//! | Worker execution       | [`WorkerTask`], [`TaskSpawner`]      |
//!
//! Default implementations live in `handoff-module`; the resume logic and
//! process lifecycle live in `handoff-executor`.

pub mod handle;
pub mod frame;
pub mod sink;
pub mod mux;
pub mod host;
pub mod worker;
pub mod error;
pub mod env;
pub mod config;

pub use handle::{HandleValue, RequestHandle};
pub use sink::{ChannelHealth, HandleSink};
pub use mux::{Callback, Interest, Multiplexer, Readiness, Registrar, Token, Trigger};
pub use host::{HandlerStatus, HostError, RequestHost, Respond, Response, StaticResponse};
pub use worker::{SpawnError, TaskSpawner, Work, WorkerTask};
pub use error::{HandoffError, ReadError, RegistrationError, Result, WriteError};
pub use config::{HandoffConfig, SpawnerKind};
pub use env::env_get;
