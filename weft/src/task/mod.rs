//! Task graphs.
//!
//! Work is expressed as [`SubTask`]s chained into [`SeriesWork`]s, which
//! run their tasks one after another, and fanned out with
//! [`ParallelWork`]s, which run several series at once. A finishing task
//! hands control to [`sub_task_done`], which walks the graph forward on
//! the thread that completed the work; there is no central scheduler.
//!
//! The concrete tasks cover the engine's services:
//!
//! - [`ClientTask`] and [`ServerTask`]/[`Service`] for network exchanges,
//! - [`TimerTask`] for delays,
//! - [`GoTask`] for closures on the compute executor,
//! - [`CounterTask`] and [`GraphTask`] for synchronization.
//!
//! # Example
//!
//! ```rust,ignore
//! use weft::{parallel, series};
//!
//! let fetch_a = runtime.client_task(a, req_a, |t| log(t));
//! let fetch_b = runtime.client_task(b, req_b, |t| log(t));
//! let pause = runtime.timer_task(Duration::from_millis(50), |_| {});
//!
//! let fan_out = parallel!(series!(fetch_a), series!(fetch_b))?;
//! series!(fan_out, pause).run();
//! ```

mod client;
mod counter;
mod go;
mod graph;
mod parallel;
mod series;
mod server;
mod sub_task;
mod timer;

pub use client::{ClientCallback, ClientTask};
pub use counter::{Counter, CounterCallback, CounterTask};
pub use go::{GoCallback, GoTask};
pub use graph::{GraphCallback, GraphNode, GraphTask};
pub use parallel::{ParallelCallback, ParallelWork};
pub use series::{SeriesCallback, SeriesWork};
pub use server::{PrepareFn, ProcessFn, ServerCallback, ServerTask, Service};
pub use sub_task::{SubTask, TaskLink, next_in_series, sub_task_done};
pub use timer::{TimerCallback, TimerTask};

/// Outcome of a task, readable from its callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Not finished yet.
    #[default]
    Undefined,
    Success,
    /// A server task is processing its request.
    ToReply,
    /// A server task chose not to reply.
    NoReply,
    /// Failed with the errno-style code in the task's `error`.
    SysError,
    /// The engine shut down before the task could finish.
    Aborted,
}

/// Phase that ran out of time when a network task fails with `ETIMEDOUT`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TimeoutReason {
    #[default]
    NotTimeout,
    /// Waiting for a free slot on a saturated target.
    Wait,
    /// Connecting, TLS handshake included.
    Connect,
    /// Sending the request or receiving the response.
    Transmit,
}
