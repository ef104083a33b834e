//! # weft
//!
//! **weft** is an asynchronous task-flow engine. Programs are written as
//! graphs of small tasks (network requests, timers, computations) chained
//! in series and fanned out in parallel; the engine runs them on a fixed
//! set of threads with no blocking call in between.
//!
//! Under the task graph sit three layers:
//!
//! - an **edge-triggered epoll multiplexer** ([`reactor`]) reading and
//!   writing incremental messages with per-descriptor deadlines,
//! - a **communicator** ([`comm`]) driving client and server
//!   request/response exchanges over pooled, keep-alive connections,
//! - a **scheduler** ([`sched`]) spreading requests over load-limited
//!   targets and groups of targets.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use weft::{RuntimeBuilder, series};
//!
//! fn main() -> weft::Result<()> {
//!     let runtime = RuntimeBuilder::new().build()?;
//!     let queue = weft::runtime::ExecQueue::new();
//!
//!     let wait = runtime.timer_task(Duration::from_millis(100), |_| println!("tick"));
//!     let work = runtime.go_task(&queue, || println!("computed"));
//!
//!     series!(wait, work).run();
//!     std::thread::sleep(Duration::from_millis(200));
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`task`]: Series, parallel works and the concrete tasks
//! - [`sched`]: Load-balanced targets and groups
//! - [`comm`]: Connections, sessions and services
//! - [`reactor`]: The readiness multiplexer
//! - [`runtime`]: Thread pools, executor and the runtime builder
//! - [`tls`]: The TLS boundary
//!
//! weft logs through [`tracing`] and never installs a subscriber.

extern crate self as weft;

mod error;
mod utils;

pub mod comm;
pub mod reactor;
pub mod runtime;
pub mod sched;
pub mod task;
pub mod tls;

pub use error::{Error, Result};
pub use runtime::{Runtime, RuntimeBuilder};

pub use weft_macros::{parallel, series};
