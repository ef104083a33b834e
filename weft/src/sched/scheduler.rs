use super::object::RequestObject;
use crate::comm::{
    Binding, CommService, CommSession, CommTarget, Communicator, Rejected, ServiceConfig,
    SleepSession,
};
use crate::Result;

use std::sync::Arc;
use std::time::Duration;

/// A [`Communicator`] whose client requests go through load-limited
/// [`RequestObject`]s.
pub struct CommScheduler {
    comm: Communicator,
}

impl CommScheduler {
    /// Starts the underlying communicator.
    ///
    /// # Errors
    ///
    /// Propagates any failure of [`Communicator::new`].
    pub fn new(poller_threads: usize, handler_threads: usize, max_open_files: usize) -> Result<Self> {
        Ok(Self {
            comm: Communicator::new(poller_threads, handler_threads, max_open_files)?,
        })
    }

    /// Acquires a target from `object` and sends `session` to it.
    ///
    /// Returns the target the session went to. The load slot is given back
    /// when the exchange finishes, or right away if the request is
    /// rejected.
    ///
    /// # Arguments
    ///
    /// * `wait_timeout` - How long to wait for a free slot; `None` waits
    ///   forever, zero fails immediately.
    pub fn request(
        &self,
        session: Box<dyn CommSession>,
        object: &dyn RequestObject,
        wait_timeout: Option<Duration>,
    ) -> std::result::Result<Arc<CommTarget>, Rejected> {
        let target = match object.acquire(wait_timeout) {
            Ok(target) => target,
            Err(error) => return Err(Rejected { error, session }),
        };

        match self.comm.request(session, &target) {
            Ok(()) => Ok(target),
            Err(rejected) => {
                target.release(false);
                Err(rejected)
            }
        }
    }

    pub fn reply(&self, session: Box<dyn CommSession>) -> std::result::Result<(), Rejected> {
        self.comm.reply(session)
    }

    pub fn push(&self, buf: &[u8], session: &dyn CommSession) -> Result<usize> {
        self.comm.push(buf, session)
    }

    pub fn bind(&self, config: ServiceConfig, service: Arc<dyn CommService>) -> Result<Binding> {
        self.comm.bind(config, service)
    }

    pub fn unbind(&self, binding: Binding) {
        self.comm.unbind(binding);
    }

    pub fn sleep(
        &self,
        session: Box<dyn SleepSession>,
    ) -> std::result::Result<(), Rejected<dyn SleepSession>> {
        self.comm.sleep(session)
    }

    pub fn is_handler_thread(&self) -> bool {
        self.comm.is_handler_thread()
    }

    pub fn increase_handler_thread(&self) -> Result<()> {
        self.comm.increase_handler_thread()
    }

    /// The communicator requests are delegated to.
    pub fn communicator(&self) -> &Communicator {
        &self.comm
    }

    pub fn shutdown(&self) {
        self.comm.shutdown();
    }
}

impl std::fmt::Debug for CommScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommScheduler")
            .field("comm", &self.comm)
            .finish()
    }
}
