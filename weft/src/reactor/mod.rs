//! Readiness multiplexer.
//!
//! Each [`Poll`] owns one loop thread blocked in an edge-triggered `epoll`
//! wait, a dense descriptor table and the deadline bookkeeping of every
//! node it holds. A node is one outstanding interest on one descriptor:
//! reading incremental messages, draining a write buffer, accepting
//! connections, waiting for a connect or a TLS handshake, or counting
//! events. Pure timers live next to them without a descriptor.
//!
//! The multiplexer interprets nothing. Every outcome goes to the
//! [`PollHandler`] given at construction, exactly once per node, and the
//! handler is expected to hand it to another thread quickly.
//!
//! Most users reach the multiplexer through the communicator; it is public
//! so custom event sources can share the same loops.

mod command;
mod core;
mod multi;
mod node;
mod timeout;

pub(crate) mod poller;

pub(crate) use self::core::advance;
pub use self::core::Poll;
pub use multi::MultiPoll;
pub use node::{
    Appended, Operation, Payload, PollData, PollHandler, PollMessage, PollResult, ResultState,
};
