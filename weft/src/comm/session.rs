use super::connection::Connection;
use super::message::{MessageIn, MessageOut};
use super::target::CommTarget;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Terminal (or hand-over) state reported to [`CommSession::handle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Success,
    Error,
    /// The communicator stopped or the connection was deleted.
    Stopped,
    /// A server session received its request and must now reply.
    ToReply,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Passive {
    /// Client-initiated.
    Client,
    /// Server session waiting for its reply.
    ToReply,
    /// Server session whose reply was issued.
    Replied,
}

/// Session-wide budget left across send/receive steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Budget {
    Unlimited,
    /// Already folded into a deadline; steps fall back to the target's
    /// response timeout.
    Spent,
    Remaining(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Begin {
    Unset,
    /// The next receive step starts a fresh budget.
    Pending,
    At(Instant),
}

/// Per-exchange deadline bookkeeping.
///
/// The target's response timeout bounds each step. A session timeout
/// longer than that is tracked from the first step so a slow but steady
/// peer is still cut off once the whole budget is used.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Timing {
    budget: Budget,
    begin: Begin,

    /// The last inbound message left the connection reusable.
    pub(crate) keep_alive: bool,
}

impl Timing {
    fn new() -> Self {
        Self {
            budget: Budget::Unlimited,
            begin: Begin::Unset,
            keep_alive: false,
        }
    }

    /// Deadline of the first step of a phase whose overall limit is `budget`.
    pub(crate) fn first(
        &mut self,
        budget: Option<Duration>,
        response: Option<Duration>,
    ) -> Option<Duration> {
        match (budget, response) {
            (_, None) => {
                self.budget = Budget::Spent;
                self.begin = Begin::Unset;
                budget
            }
            (Some(b), Some(r)) if b <= r => {
                self.budget = Budget::Spent;
                self.begin = Begin::Unset;
                Some(b)
            }
            (b, Some(r)) => {
                self.budget = b.map_or(Budget::Unlimited, Budget::Remaining);
                self.begin = Begin::At(Instant::now());
                Some(r)
            }
        }
    }

    /// Deadline of a following step: the response timeout, or what is left
    /// of the budget once that is shorter.
    pub(crate) fn next(&mut self, response: Option<Duration>) -> Option<Duration> {
        if let (Budget::Remaining(budget), Begin::At(start), Some(r)) =
            (self.budget, self.begin, response)
        {
            let left = budget.saturating_sub(start.elapsed());
            if left <= r {
                self.budget = Budget::Spent;
                return Some(left);
            }
        }

        response
    }

    /// Makes the next receive step start a fresh budget.
    pub(crate) fn renew(&mut self) {
        self.budget = Budget::Unlimited;
        self.begin = Begin::Pending;
    }

    pub(crate) fn is_spent(&self) -> bool {
        self.budget == Budget::Spent
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.begin == Begin::Pending
    }
}

/// State the communicator keeps inside every session.
///
/// Session types embed one and expose it through [`CommSession::core`].
pub struct SessionCore {
    pub(crate) target: Option<Arc<CommTarget>>,
    pub(crate) conn: Option<Arc<Connection>>,
    pub(crate) seq: u64,
    pub(crate) passive: Passive,
    pub(crate) timing: Timing,
}

impl SessionCore {
    pub fn new() -> Self {
        Self {
            target: None,
            conn: None,
            seq: 0,
            passive: Passive::Client,
            timing: Timing::new(),
        }
    }

    pub(crate) fn passive(target: Arc<CommTarget>, conn: Arc<Connection>, seq: u64) -> Self {
        Self {
            target: Some(target),
            conn: Some(conn),
            seq,
            passive: Passive::ToReply,
            timing: Timing::new(),
        }
    }

    pub(crate) fn attach(&mut self, conn: Arc<Connection>, seq: u64) {
        self.conn = Some(conn);
        self.seq = seq;
    }

    pub(crate) fn detach(&mut self) {
        self.conn = None;
        self.seq = 0;
    }

    /// The target the session ran against, once requested or accepted.
    pub fn target(&self) -> Option<&Arc<CommTarget>> {
        self.target.as_ref()
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.conn.as_ref()
    }

    /// Position of this exchange on its connection, starting at 0.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Whether this is a server-side session.
    pub fn is_passive(&self) -> bool {
        self.passive != Passive::Client
    }
}

impl Default for SessionCore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionCore {
    /// A server session dropped before replying takes its connection down
    /// with it.
    fn drop(&mut self) {
        if self.passive != Passive::ToReply {
            return;
        }

        if let Some(target) = &self.target {
            let idle = target.idle.lock();
            if let Some(entry) = idle.front() {
                entry.poll.delete(entry.fd);
            }
        }
    }
}

/// One request/response exchange driven by the communicator.
///
/// Every session handed to the communicator receives exactly one terminal
/// [`handle`](Self::handle) call. Server sessions get an extra `ToReply`
/// hand-over first, after which they must be passed to `reply` (or dropped,
/// which closes the connection).
pub trait CommSession: Send + 'static {
    fn core(&self) -> &SessionCore;
    fn core_mut(&mut self) -> &mut SessionCore;

    /// The message to send. Called once per exchange.
    fn message_out(&mut self) -> Option<&mut dyn MessageOut>;

    /// The message inbound bytes are appended to.
    fn message_in(&mut self) -> Option<&mut dyn MessageIn>;

    /// Limit for sending the whole outbound message; `None` is unlimited.
    fn send_timeout(&self) -> Option<Duration> {
        None
    }

    /// Limit for receiving the whole inbound message; `None` is unlimited.
    fn receive_timeout(&self) -> Option<Duration> {
        None
    }

    /// How long the connection may idle afterwards; zero closes it.
    fn keep_alive_timeout(&self) -> Option<Duration> {
        Some(Duration::ZERO)
    }

    /// Limit for the first response byte of a client exchange.
    ///
    /// Zero means "use the receive timeout".
    fn first_timeout(&self) -> Option<Duration> {
        Some(Duration::ZERO)
    }

    fn handle(self: Box<Self>, state: SessionState, error: i32);
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn budget_within_response_is_used_once() {
        let mut timing = Timing::new();

        assert_eq!(timing.first(Some(5 * MS), Some(10 * MS)), Some(5 * MS));
        assert!(timing.is_spent());
        assert_eq!(timing.next(Some(10 * MS)), Some(10 * MS));
    }

    #[test]
    fn long_budget_is_tracked_across_steps() {
        let mut timing = Timing::new();

        assert_eq!(timing.first(Some(1000 * MS), Some(10 * MS)), Some(10 * MS));
        assert!(!timing.is_spent());
        assert_eq!(timing.next(Some(10 * MS)), Some(10 * MS));

        let mut tight = Timing::new();
        tight.first(Some(11 * MS), Some(10 * MS));
        std::thread::sleep(5 * MS);
        let step = tight.next(Some(10 * MS)).unwrap();
        assert!(step <= 6 * MS);
        assert!(tight.is_spent());
    }

    #[test]
    fn unlimited_response_takes_the_budget() {
        let mut timing = Timing::new();
        assert_eq!(timing.first(None, None), None);
        assert_eq!(timing.first(Some(3 * MS), None), Some(3 * MS));
        assert!(timing.is_spent());
    }

    #[test]
    fn renew_marks_pending() {
        let mut timing = Timing::new();
        timing.first(Some(MS), Some(MS));
        timing.renew();

        assert!(timing.is_pending());
        assert!(!timing.is_spent());
    }
}
