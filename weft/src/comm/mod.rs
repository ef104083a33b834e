//! Connection engine.
//!
//! The [`Communicator`] drives request/response exchanges over pooled TCP
//! connections, optionally wrapped in TLS. A client exchange is a
//! [`CommSession`] sent to a [`CommTarget`]; a server exchange is created by
//! a bound [`CommService`] for each request it reads, handed back with
//! [`SessionState::ToReply`] and finished by [`Communicator::reply`].
//!
//! Sessions provide their own message framing through [`MessageOut`] and
//! [`MessageIn`]. The communicator only moves bytes, enforces deadlines and
//! decides whether a connection is reused.

mod communicator;
mod connection;
mod entry;
mod message;
mod service;
mod session;
mod sleep;
mod target;

pub use communicator::{Communicator, Rejected};
pub use connection::Connection;
pub use message::{MessageIn, MessageOut, ReceiveContext};
pub use service::{Binding, CommService, ServiceConfig};
pub use session::{CommSession, SessionCore, SessionState};
pub use sleep::{SleepSession, SleepState};
pub use target::{CommTarget, Release};
