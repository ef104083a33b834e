//! Linux readiness poller.
//!
//! The multiplexer loop drives one [`Poller`] per thread. The poller owns
//! the epoll instance together with two internal descriptors:
//! - an `eventfd` waker other threads use to interrupt the wait,
//! - a `timerfd` armed to the nearest pending deadline.

pub(crate) mod common;
pub(crate) mod unix;

mod epoll;

pub(crate) use common::{Interest, Waker};
pub(crate) use epoll::{EpollPoller as Poller, Wakeup};
