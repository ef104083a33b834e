//! Linux `epoll`-based poller implementation.
//!
//! Responsibilities:
//! - Register file descriptors with read/write interests
//! - Block waiting for I/O readiness, with no fixed timeout
//! - Wake the loop when commands are submitted from other threads
//! - Fire a single `timerfd` armed to the nearest deadline

use super::common::{Interest, Waker};
use super::unix::sys_close;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLIN, epoll_create1, epoll_ctl,
    epoll_event, epoll_wait, itimerspec, timespec,
};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Reserved token used internally for the wake-up event.
///
/// Node tokens pack a 32-bit generation and a descriptor, so the top two
/// values never collide with them.
const WAKE_TOKEN: u64 = u64::MAX;

/// Reserved token for the deadline timer.
const TIMER_TOKEN: u64 = u64::MAX - 1;

/// Most events returned by one readiness wait.
pub(crate) const MAX_EVENTS: usize = 256;

/// Internal sources that fired during one wait.
#[derive(Default, Debug)]
pub(crate) struct Wakeup {
    /// The waker was signalled: commands are pending.
    pub(crate) woken: bool,

    /// The deadline timer expired.
    pub(crate) timer: bool,
}

/// Linux `epoll` poller.
///
/// This poller owns:
/// - an `epoll` instance,
/// - an internal `eventfd` used as a wake-up signal,
/// - a `timerfd` used as the single deadline timer.
///
/// Registration calls take `&self` so any thread may issue them while the
/// loop thread is blocked in [`poll`](Self::poll).
pub(crate) struct EpollPoller {
    /// Epoll file descriptor.
    epoll: RawFd,

    /// Monotonic timer descriptor.
    timer: RawFd,

    /// Waker wrapping the internal eventfd.
    waker: Arc<Waker>,
}

impl Waker {
    /// Wake the poller.
    ///
    /// This writes to the internal `eventfd`, causing `epoll_wait`
    /// to return immediately.
    pub(crate) fn wake(&self) {
        let buf: u64 = 1;
        unsafe {
            libc::write(self.0, &buf as *const _ as *const _, 8);
        }
    }

    fn reset(&self) {
        let mut buf = 0u64;
        unsafe {
            libc::read(self.0, &mut buf as *mut _ as *mut _, 8);
        }
    }
}

impl EpollPoller {
    /// Create a new `EpollPoller`.
    ///
    /// This:
    /// - creates the epoll instance,
    /// - creates a non-blocking `eventfd` and `timerfd`,
    /// - registers both as persistent, level-triggered sources.
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let timer = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if timer < 0 {
            let err = io::Error::last_os_error();
            sys_close(epoll);
            return Err(err);
        }

        let eventfd = match super::unix::sys_eventfd() {
            Ok(fd) => fd,
            Err(e) => {
                sys_close(timer);
                sys_close(epoll);
                return Err(e);
            }
        };

        let poller = Self {
            epoll,
            timer,
            waker: Arc::new(Waker(eventfd)),
        };

        poller.ctl(EPOLL_CTL_ADD, eventfd, EPOLLIN as u32, WAKE_TOKEN)?;
        poller.ctl(EPOLL_CTL_ADD, timer, EPOLLIN as u32, TIMER_TOKEN)?;

        Ok(poller)
    }

    /// Return the poller waker.
    ///
    /// Other threads use this to interrupt `epoll_wait` when commands arrive.
    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Register a file descriptor with the poller.
    pub(crate) fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, interest.to_epoll(), token)
    }

    /// Update interest flags and token for an already registered descriptor.
    pub(crate) fn reregister(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, interest.to_epoll(), token)
    }

    /// Remove a file descriptor from the poller.
    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Arms the deadline timer to fire after `after`, or disarms it.
    ///
    /// A zero duration would disarm a timerfd, so it is rounded up to one
    /// nanosecond: an already expired deadline fires on the next wait.
    pub(crate) fn arm_timer(&self, after: Option<Duration>) -> io::Result<()> {
        let value = match after {
            Some(d) => {
                let d = d.max(Duration::from_nanos(1));
                timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as libc::c_long,
                }
            }
            None => timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };

        let spec = itimerspec {
            it_interval: timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };

        let rc = unsafe { libc::timerfd_settime(self.timer, 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Poll for I/O readiness events.
    ///
    /// Blocks until at least one descriptor becomes ready, the waker is
    /// signalled, or the deadline timer fires. Node tokens are appended
    /// to `tokens`; internal sources are reported through [`Wakeup`].
    pub(crate) fn poll(
        &self,
        events: &mut Vec<epoll_event>,
        tokens: &mut Vec<u64>,
    ) -> io::Result<Wakeup> {
        let mut wakeup = Wakeup::default();

        events.clear();
        events.reserve(MAX_EVENTS);

        let n = unsafe {
            epoll_wait(
                self.epoll,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                -1,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(wakeup);
            }
            return Err(err);
        }

        // SAFETY: the kernel initialized the first `n` entries.
        unsafe {
            events.set_len(n as usize);
        }

        for ev in events.iter() {
            match ev.u64 {
                WAKE_TOKEN => {
                    self.waker.reset();
                    wakeup.woken = true;
                }
                TIMER_TOKEN => {
                    let mut expirations = 0u64;
                    unsafe {
                        libc::read(self.timer, &mut expirations as *mut _ as *mut _, 8);
                    }
                    wakeup.timer = true;
                }
                token => tokens.push(token),
            }
        }

        Ok(wakeup)
    }

    fn ctl(&self, op: i32, fd: RawFd, flags: u32, token: u64) -> io::Result<()> {
        let mut event = epoll_event {
            events: flags,
            u64: token,
        };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        sys_close(self.timer);
        sys_close(self.epoll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::poller::unix::{sys_close, sys_pipe, sys_write};
    use std::time::Instant;

    #[test]
    fn waker_interrupts_wait() {
        let poller = EpollPoller::new().unwrap();
        poller.waker().wake();

        let mut events = Vec::new();
        let mut tokens = Vec::new();
        let wakeup = poller.poll(&mut events, &mut tokens).unwrap();

        assert!(wakeup.woken);
        assert!(tokens.is_empty());
    }

    #[test]
    fn timer_fires_after_deadline() {
        let poller = EpollPoller::new().unwrap();
        let start = Instant::now();
        poller.arm_timer(Some(Duration::from_millis(20))).unwrap();

        let mut events = Vec::new();
        let mut tokens = Vec::new();
        let wakeup = poller.poll(&mut events, &mut tokens).unwrap();

        assert!(wakeup.timer);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn readable_pipe_reports_its_token() {
        let poller = EpollPoller::new().unwrap();
        let (rd, wr) = sys_pipe().unwrap();
        poller.register(rd, 42, Interest::READ).unwrap();
        sys_write(wr, b"x").unwrap();

        let mut events = Vec::new();
        let mut tokens = Vec::new();
        poller.poll(&mut events, &mut tokens).unwrap();
        assert_eq!(tokens, vec![42]);

        poller.deregister(rd).unwrap();
        sys_close(rd);
        sys_close(wr);
    }
}
