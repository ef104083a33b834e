use parking_lot::Mutex;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepState {
    Complete,
    Error,
    /// The communicator stopped before the timer fired.
    Disrupted,
}

/// A pure timer run by the communicator's multiplexer.
pub trait SleepSession: Send + 'static {
    fn duration(&self) -> Duration;

    fn handle(self: Box<Self>, state: SleepState, error: i32);
}

/// Shared slot so the timer's poll context stays cloneable; the session
/// is taken out exactly once, when the timer resolves.
pub(crate) type SleepCell = Mutex<Option<Box<dyn SleepSession>>>;
