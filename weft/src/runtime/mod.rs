//! Core runtime components.
//!
//! This module contains the thread machinery the engine runs on:
//! - [`MsgQueue`], the blocking FIFO between producers and worker threads,
//! - [`ThreadPool`], named workers executing [`Job`]s,
//! - [`Executor`], serial [`ExecQueue`] lanes over a compute pool,
//! - [`Runtime`] and its [`RuntimeBuilder`], which own everything and
//!   create tasks.
//!
//! Most users only touch [`RuntimeBuilder`] and the task factories on
//! [`Runtime`].

mod builder;
mod core;
mod executor;
mod pool;
mod queue;

pub(crate) mod context;

pub use builder::RuntimeBuilder;
pub use self::core::Runtime;
pub use executor::{ExecQueue, ExecSession, ExecState, Executor};
pub use pool::{Job, ThreadPool};
pub use queue::MsgQueue;
