use parking_lot::Mutex;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One established socket as seen by sessions.
///
/// A connection outlives the sessions running on it when it is kept alive,
/// so protocols stash per-connection state here (negotiated settings,
/// authentication) through the context slot.
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Connection {
    pub(crate) fn new(peer: SocketAddr) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            context: Mutex::new(None),
        }
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Replaces the per-connection context.
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.lock() = Some(Box::new(value));
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.context.lock().take()
    }

    /// Runs `f` on the context if one of type `T` is set.
    pub fn with_context<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut context = self.context.lock();
        f(context.as_mut().and_then(|c| c.downcast_mut::<T>()))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::Connection;

    #[test]
    fn context_is_typed() {
        let conn = Connection::new("127.0.0.1:80".parse().unwrap());
        conn.set_context(7u32);

        assert_eq!(conn.with_context(|v: Option<&mut u32>| v.copied()), Some(7));
        assert_eq!(conn.with_context(|v: Option<&mut String>| v.is_some()), false);
        assert!(conn.take_context().is_some());
        assert!(conn.take_context().is_none());
    }

    #[test]
    fn ids_are_unique() {
        let addr = "127.0.0.1:80".parse().unwrap();
        assert_ne!(Connection::new(addr).id(), Connection::new(addr).id());
    }
}
