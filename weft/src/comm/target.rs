use super::entry::ConnEntry;
use super::service::ServiceRef;
use crate::tls::TlsConfig;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Receives the load slot a finished client exchange gives back.
pub trait Release: Send + Sync {
    /// `keep_alive` is set when the connection went back to the idle pool.
    fn release(&self, keep_alive: bool);
}

/// A destination clients connect to.
///
/// Besides the address and timeouts, a target owns the pool of idle
/// keep-alive connections to that address. The most recently used
/// connection sits at the front and is reused first.
pub struct CommTarget {
    addr: SocketAddr,
    connect_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    tls: Option<TlsConfig>,

    pub(crate) idle: Mutex<VecDeque<Arc<ConnEntry>>>,

    releaser: Option<Weak<dyn Release>>,

    /// Set on the per-connection targets of accepted server connections.
    pub(crate) service: Option<Arc<ServiceRef>>,
}

impl CommTarget {
    /// Creates a target with no connect or response timeout.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: None,
            response_timeout: None,
            tls: None,
            idle: Mutex::new(VecDeque::new()),
            releaser: None,
            service: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bounds every single send or receive step on this target.
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub(crate) fn with_releaser(mut self, releaser: Weak<dyn Release>) -> Self {
        self.releaser = Some(releaser);
        self
    }

    pub(crate) fn for_peer(
        addr: SocketAddr,
        response_timeout: Option<Duration>,
        service: Arc<ServiceRef>,
    ) -> Self {
        Self {
            response_timeout,
            service: Some(service),
            ..Self::new(addr)
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    /// Number of idle keep-alive connections in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Gives the load slot back to whoever handed this target out.
    pub fn release(&self, keep_alive: bool) {
        if let Some(releaser) = self.releaser.as_ref().and_then(Weak::upgrade) {
            releaser.release(keep_alive);
        }
    }
}

impl std::fmt::Debug for CommTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommTarget")
            .field("addr", &self.addr)
            .field("connect_timeout", &self.connect_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}
