use super::connection::Connection;
use super::entry::{ConnEntry, ConnState};
use super::session::CommSession;
use crate::tls::TlsConfig;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Listening endpoint settings.
#[derive(Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,

    /// Deadline of the listener itself; `None` listens until unbound.
    pub listen_timeout: Option<Duration>,

    /// Bounds every receive step of accepted connections.
    pub response_timeout: Option<Duration>,

    pub tls: Option<TlsConfig>,
}

impl ServiceConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            listen_timeout: None,
            response_timeout: None,
            tls: None,
        }
    }
}

/// Server-side hooks of a bound listener.
pub trait CommService: Send + Sync + 'static {
    /// Creates the session the next request on `conn` is read into.
    ///
    /// Returning `None` closes the connection.
    fn new_session(&self, seq: u64, conn: &Arc<Connection>) -> Option<Box<dyn CommSession>>;

    /// The listener failed, or the communicator stopped under it.
    fn handle_stop(&self, error: i32) {
        let _ = error;
    }

    /// The listener and every connection it accepted are gone.
    fn handle_unbound(&self);
}

pub(crate) struct AliveList {
    pub(crate) entries: VecDeque<Arc<ConnEntry>>,
    pub(crate) listening: bool,
}

/// A bound service: its listener and the keep-alive connections it owns.
///
/// Every accepted connection holds a reference, so the service is reported
/// unbound only after the listener and all of them are gone.
pub(crate) struct ServiceRef {
    pub(crate) service: Arc<dyn CommService>,
    pub(crate) config: ServiceConfig,
    listen: Mutex<Option<OwnedFd>>,
    listen_fd: RawFd,
    local_addr: SocketAddr,
    bound: AtomicBool,
    pub(crate) alive: Mutex<AliveList>,
}

impl ServiceRef {
    pub(crate) fn new(
        service: Arc<dyn CommService>,
        config: ServiceConfig,
        listen: OwnedFd,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            service,
            config,
            listen_fd: listen.as_raw_fd(),
            listen: Mutex::new(Some(listen)),
            local_addr,
            bound: AtomicBool::new(false),
            alive: Mutex::new(AliveList {
                entries: VecDeque::new(),
                listening: true,
            }),
        }
    }

    /// Called once the listener is registered; only bound services report
    /// `handle_unbound`.
    pub(crate) fn mark_bound(&self) {
        self.bound.store(true, Ordering::Release);
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn listen_fd(&self) -> RawFd {
        self.listen_fd
    }

    /// Closes up to `max` keep-alive connections, all of them when `max` is 0.
    pub(crate) fn drain(&self, max: usize) -> usize {
        let mut alive = self.alive.lock();
        let mut count = 0;

        while max == 0 || count < max {
            let Some(entry) = alive.entries.pop_front() else {
                break;
            };

            entry.poll.delete(entry.fd);
            entry.set_state(ConnState::Closing);
            count += 1;
        }

        count
    }

    /// Closes the listener and every keep-alive connection.
    pub(crate) fn shutdown(&self) {
        let listen = self.listen.lock().take();
        drop(listen);

        self.alive.lock().listening = false;
        let drained = self.drain(0);

        debug!(addr = %self.local_addr, drained, "service shut down");
    }
}

impl Drop for ServiceRef {
    fn drop(&mut self) {
        if self.bound.load(Ordering::Acquire) {
            self.service.handle_unbound();
        }
    }
}

/// A bound listener, returned by `bind` and consumed by `unbind`.
pub struct Binding {
    pub(crate) service: Arc<ServiceRef>,
}

impl Binding {
    /// Address the listener is bound to, with the real port when port 0
    /// was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.service.local_addr
    }

    /// Closes up to `max` keep-alive connections, all of them when `max` is 0.
    pub fn drain(&self, max: usize) -> usize {
        self.service.drain(max)
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("local_addr", &self.service.local_addr)
            .finish()
    }
}
