use std::os::fd::RawFd;

/// Readiness a registration waits for.
///
/// `edge` selects edge-triggered delivery; every node except listeners is
/// registered edge-triggered and must be drained until `EAGAIN`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
    pub(crate) edge: bool,
}

impl Interest {
    pub(crate) const READ: Interest = Interest {
        read: true,
        write: false,
        edge: true,
    };

    pub(crate) const WRITE: Interest = Interest {
        read: false,
        write: true,
        edge: true,
    };

    /// Level-triggered read, used by listening sockets.
    pub(crate) const ACCEPT: Interest = Interest {
        read: true,
        write: false,
        edge: false,
    };

    pub(crate) fn to_epoll(self) -> u32 {
        let mut flags = 0;

        if self.read {
            flags |= libc::EPOLLIN;
        }
        if self.write {
            flags |= libc::EPOLLOUT;
        }
        if self.edge {
            flags |= libc::EPOLLET;
        }

        flags as u32
    }
}

pub(crate) struct Waker(pub(crate) RawFd);

unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Drop for Waker {
    fn drop(&mut self) {
        super::unix::sys_close(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn listeners_are_level_triggered() {
        assert_eq!(Interest::ACCEPT.to_epoll() & libc::EPOLLET as u32, 0);
        assert_ne!(Interest::READ.to_epoll() & libc::EPOLLET as u32, 0);
        assert_ne!(Interest::WRITE.to_epoll() & libc::EPOLLOUT as u32, 0);
    }
}
