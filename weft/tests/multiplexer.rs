use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use weft::reactor::{
    Appended, MultiPoll, Operation, Payload, PollData, PollHandler, PollMessage, PollResult,
    ResultState,
};
use weft::tls::{TlsError, TlsStream, Want};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Event {
    Line(String),
    Value {
        tag: &'static str,
        value: u64,
    },
    Result {
        tag: &'static str,
        state: ResultState,
        error: i32,
    },
}

#[derive(Clone)]
struct Watch {
    tag: &'static str,
    events: Sender<Event>,
}

/// Newline-terminated text; reports the line once complete.
struct Line {
    buf: Vec<u8>,
    events: Sender<Event>,
}

impl PollMessage for Line {
    fn append(&mut self, buf: &[u8]) -> io::Result<Appended> {
        match buf.iter().position(|&b| b == b'\n') {
            Some(end) => {
                self.buf.extend_from_slice(&buf[..end]);
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                let _ = self.events.send(Event::Line(line));
                Ok(Appended::Complete(end + 1))
            }
            None => {
                self.buf.extend_from_slice(buf);
                Ok(Appended::Incomplete)
            }
        }
    }
}

struct Handler;

impl PollHandler<Watch> for Handler {
    fn create_message(&self, context: &Watch) -> io::Result<Box<dyn PollMessage>> {
        Ok(Box::new(Line {
            buf: Vec::new(),
            events: context.events.clone(),
        }))
    }

    fn callback(&self, result: PollResult<Watch>) {
        let PollResult { state, error, data } = result;
        let PollData {
            context, payload, ..
        } = data;

        let event = match payload {
            Payload::Value(value) => Event::Value {
                tag: context.tag,
                value,
            },
            _ => Event::Result {
                tag: context.tag,
                state,
                error,
            },
        };
        let _ = context.events.send(event);
    }
}

fn started() -> (MultiPoll<Watch>, Sender<Event>, Receiver<Event>) {
    let poll = MultiPoll::new(2, 1024, Arc::new(Handler)).expect("Failed to create multiplexer");
    poll.start().expect("Failed to start multiplexer");
    let (tx, rx) = channel();
    (poll, tx, rx)
}

fn pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().expect("Failed to create socket pair");
    a.set_nonblocking(true).expect("Failed to set non-blocking");
    (a, b)
}

fn watch(tag: &'static str, events: &Sender<Event>) -> Watch {
    Watch {
        tag,
        events: events.clone(),
    }
}

fn next(rx: &Receiver<Event>) -> Event {
    rx.recv_timeout(WAIT).expect("No event from the multiplexer")
}

#[test]
fn test_read_node_splits_messages() {
    let (poll, tx, rx) = started();
    let (a, mut b) = pair();

    poll.add(
        PollData::new(Operation::Read, a.as_raw_fd(), watch("read", &tx)),
        None,
    )
    .expect("Failed to add read node");

    b.write_all(b"hello\nwor").expect("Failed to write");
    assert_eq!(next(&rx), Event::Line("hello".into()));
    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "read",
            state: ResultState::Success,
            error: 0
        }
    );

    b.write_all(b"ld\n").expect("Failed to write");
    assert_eq!(next(&rx), Event::Line("world".into()));
    assert!(matches!(
        next(&rx),
        Event::Result {
            state: ResultState::Success,
            ..
        }
    ));

    drop(b);
    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "read",
            state: ResultState::Finished,
            error: 0
        }
    );

    poll.stop();
}

#[test]
fn test_write_node_drains_buffers() {
    let (poll, tx, rx) = started();
    let (a, mut b) = pair();

    let buffers = vec![
        bytes::Bytes::from_static(b"ping "),
        bytes::Bytes::new(),
        bytes::Bytes::from_static(b"pong"),
    ];
    poll.add(
        PollData::write(a.as_raw_fd(), buffers, watch("write", &tx)),
        Some(WAIT),
    )
    .expect("Failed to add write node");

    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "write",
            state: ResultState::Finished,
            error: 0
        }
    );

    let mut received = [0u8; 9];
    io::Read::read_exact(&mut b, &mut received).expect("Failed to read");
    assert_eq!(&received, b"ping pong");

    poll.stop();
}

#[test]
fn test_registration_errors() {
    let (poll, tx, _rx) = started();
    let (a, _b) = pair();
    let fd = a.as_raw_fd();

    poll.add(PollData::new(Operation::Read, fd, watch("first", &tx)), None)
        .expect("Failed to add read node");

    let err = poll
        .add(PollData::new(Operation::Read, fd, watch("second", &tx)), None)
        .expect_err("Duplicate registration should fail");
    assert!(matches!(err, weft::Error::AlreadyRegistered(f) if f == fd));

    let err = poll
        .add(PollData::new(Operation::Read, 4096, watch("far", &tx)), None)
        .expect_err("Descriptor past the table should fail");
    assert!(matches!(err, weft::Error::BadDescriptor(4096)));

    let err = poll
        .modify(PollData::new(Operation::Read, 4095, watch("far", &tx)), None)
        .expect_err("Descriptor past the table should fail");
    assert!(matches!(err, weft::Error::BadDescriptor(4095)));

    poll.stop();
}

#[test]
fn test_delete_reports_once() {
    let (poll, tx, rx) = started();
    let (a, _b) = pair();
    let fd = a.as_raw_fd();

    poll.add(PollData::new(Operation::Read, fd, watch("doomed", &tx)), None)
        .expect("Failed to add read node");

    assert!(poll.delete(fd));
    assert!(!poll.delete(fd));

    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "doomed",
            state: ResultState::Deleted,
            error: 0
        }
    );
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    poll.stop();
}

#[test]
fn test_modify_replaces_the_node() {
    let (poll, tx, rx) = started();
    let (a, mut b) = pair();
    let fd = a.as_raw_fd();

    let err = poll
        .modify(PollData::new(Operation::Read, fd, watch("new", &tx)), None)
        .expect_err("Nothing to modify yet");
    assert!(matches!(err, weft::Error::NotRegistered(_)));

    poll.add(PollData::new(Operation::Read, fd, watch("old", &tx)), None)
        .expect("Failed to add read node");
    poll.modify(PollData::new(Operation::Read, fd, watch("new", &tx)), None)
        .expect("Failed to modify node");

    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "old",
            state: ResultState::Modified,
            error: 0
        }
    );

    b.write_all(b"after\n").expect("Failed to write");
    assert_eq!(next(&rx), Event::Line("after".into()));
    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "new",
            state: ResultState::Success,
            error: 0
        }
    );

    poll.stop();
}

#[test]
fn test_node_deadline_expires() {
    let (poll, tx, rx) = started();
    let (a, _b) = pair();

    let start = Instant::now();
    poll.add(
        PollData::new(Operation::Read, a.as_raw_fd(), watch("idle", &tx)),
        Some(Duration::from_millis(50)),
    )
    .expect("Failed to add read node");

    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "idle",
            state: ResultState::Error,
            error: libc::ETIMEDOUT
        }
    );
    assert!(start.elapsed() >= Duration::from_millis(50));

    poll.stop();
}

#[test]
fn test_set_timeout_clears_the_deadline() {
    let (poll, tx, rx) = started();
    let (a, _b) = pair();
    let fd = a.as_raw_fd();

    poll.add(
        PollData::new(Operation::Read, fd, watch("idle", &tx)),
        Some(Duration::from_millis(50)),
    )
    .expect("Failed to add read node");
    poll.set_timeout(fd, None).expect("Failed to clear deadline");

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    poll.stop();
    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "idle",
            state: ResultState::Stopped,
            error: 0
        }
    );
}

#[test]
fn test_timers_fire_in_deadline_order() {
    let (poll, tx, rx) = started();

    poll.add_timer(Duration::from_millis(120), watch("late", &tx))
        .expect("Failed to add timer");
    poll.add_timer(Duration::from_millis(30), watch("early", &tx))
        .expect("Failed to add timer");
    poll.add_timer(Duration::from_millis(70), watch("middle", &tx))
        .expect("Failed to add timer");

    let order: Vec<_> = (0..3)
        .map(|_| match next(&rx) {
            Event::Result { tag, state, error } => {
                assert_eq!(state, ResultState::Error);
                assert_eq!(error, libc::ETIMEDOUT);
                tag
            }
            other => panic!("unexpected event {other:?}"),
        })
        .collect();

    // Timers are spread over both loops, so order only holds by deadline.
    assert_eq!(order, ["early", "middle", "late"]);

    poll.stop();
}

#[test]
fn test_stop_resolves_live_nodes() {
    let (poll, tx, rx) = started();
    let (a, _b) = pair();

    poll.add(
        PollData::new(Operation::Read, a.as_raw_fd(), watch("live", &tx)),
        None,
    )
    .expect("Failed to add read node");
    poll.add_timer(Duration::from_secs(60), watch("timer", &tx))
        .expect("Failed to add timer");

    poll.stop();

    let mut tags = vec![];
    for _ in 0..2 {
        match next(&rx) {
            Event::Result { tag, state, .. } => {
                assert_eq!(state, ResultState::Stopped);
                tags.push(tag);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    tags.sort();
    assert_eq!(tags, ["live", "timer"]);

    let err = poll
        .add_timer(Duration::from_millis(1), watch("after", &tx))
        .expect_err("Stopped multiplexer should reject nodes");
    assert!(matches!(err, weft::Error::Stopped));
}

#[test]
fn test_add_before_start_is_rejected() {
    let poll = MultiPoll::new(1, 1024, Arc::new(Handler)).expect("Failed to create multiplexer");
    let (tx, _rx) = channel();

    let err = poll
        .add_timer(Duration::from_millis(1), watch("early", &tx))
        .expect_err("Stopped multiplexer should reject nodes");
    assert!(matches!(err, weft::Error::Stopped));
}

fn eventfd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    assert!(fd >= 0, "eventfd failed: {}", io::Error::last_os_error());

    // SAFETY: freshly created descriptor, owned by nobody else.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

fn signal(fd: RawFd, value: u64) {
    let buf = value.to_ne_bytes();
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    assert_eq!(n, 8, "eventfd write failed: {}", io::Error::last_os_error());
}

#[test]
fn test_event_node_reports_counter_values() {
    let (poll, tx, rx) = started();
    let counter = eventfd();
    let fd = counter.as_raw_fd();

    poll.add(PollData::new(Operation::Event, fd, watch("event", &tx)), None)
        .expect("Failed to add event node");

    signal(fd, 5);
    assert_eq!(
        next(&rx),
        Event::Value {
            tag: "event",
            value: 5
        }
    );

    // The node stays registered across values.
    signal(fd, 2);
    assert_eq!(
        next(&rx),
        Event::Value {
            tag: "event",
            value: 2
        }
    );

    assert!(poll.delete(fd));
    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "event",
            state: ResultState::Deleted,
            error: 0
        }
    );

    poll.stop();
}

#[test]
fn test_notify_node_splits_values_until_eof() {
    let (poll, tx, rx) = started();
    let (a, mut b) = pair();

    poll.add(
        PollData::new(Operation::Notify, a.as_raw_fd(), watch("notify", &tx)),
        None,
    )
    .expect("Failed to add notify node");

    let mut values = 7u64.to_ne_bytes().to_vec();
    values.extend_from_slice(&9u64.to_ne_bytes());
    b.write_all(&values).expect("Failed to write");

    assert_eq!(
        next(&rx),
        Event::Value {
            tag: "notify",
            value: 7
        }
    );
    assert_eq!(
        next(&rx),
        Event::Value {
            tag: "notify",
            value: 9
        }
    );

    drop(b);
    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "notify",
            state: ResultState::Finished,
            error: 0
        }
    );

    poll.stop();
}

/// Plain socket reads behind the TLS interface. The first read asks for
/// write readiness; a drained socket asks for read readiness again.
struct Renegotiating {
    fd: RawFd,
    asked: bool,
    wants: Arc<Mutex<Vec<Want>>>,
}

impl TlsStream for Renegotiating {
    fn accept(&mut self) -> Result<(), TlsError> {
        Ok(())
    }

    fn connect(&mut self) -> Result<(), TlsError> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), TlsError> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        if !self.asked {
            self.asked = true;
            self.wants.lock().push(Want::Write);
            return Err(TlsError::Want(Want::Write));
        }

        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }

        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            self.wants.lock().push(Want::Read);
            return Err(TlsError::Want(Want::Read));
        }
        Err(err.into())
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize, TlsError> {
        Err(TlsError::Io(io::Error::from_raw_os_error(libc::EINVAL)))
    }
}

#[test]
fn test_tls_read_follows_wanted_readiness() {
    let (poll, tx, rx) = started();
    let (a, mut b) = pair();
    let wants = Arc::new(Mutex::new(Vec::new()));

    let stream: Box<dyn TlsStream> = Box::new(Renegotiating {
        fd: a.as_raw_fd(),
        asked: false,
        wants: wants.clone(),
    });

    b.write_all(b"secret\n").expect("Failed to write");
    poll.add(
        PollData::new(Operation::Read, a.as_raw_fd(), watch("tls", &tx))
            .with_tls(Some(Arc::new(Mutex::new(stream)))),
        None,
    )
    .expect("Failed to add read node");

    assert_eq!(next(&rx), Event::Line("secret".into()));
    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "tls",
            state: ResultState::Success,
            error: 0
        }
    );

    b.write_all(b"again\n").expect("Failed to write");
    assert_eq!(next(&rx), Event::Line("again".into()));
    assert!(matches!(
        next(&rx),
        Event::Result {
            state: ResultState::Success,
            ..
        }
    ));

    drop(b);
    assert_eq!(
        next(&rx),
        Event::Result {
            tag: "tls",
            state: ResultState::Finished,
            error: 0
        }
    );

    let wants = wants.lock();
    assert_eq!(wants[..2], [Want::Write, Want::Read]);
    assert!(wants[2..].iter().all(|w| *w == Want::Read));

    poll.stop();
}

#[test]
fn test_timer_fires_while_events_flow() {
    let (poll, tx, rx) = started();
    let (a, mut b) = pair();

    poll.add(
        PollData::new(Operation::Read, a.as_raw_fd(), watch("busy", &tx)),
        None,
    )
    .expect("Failed to add read node");

    let start = Instant::now();
    poll.add_timer(Duration::from_millis(60), watch("timer", &tx))
        .expect("Failed to add timer");

    let writer = std::thread::spawn(move || {
        for i in 0..40 {
            b.write_all(format!("tick {i}\n").as_bytes())
                .expect("Failed to write");
            std::thread::sleep(Duration::from_millis(10));
        }
        b
    });

    let fired = loop {
        match next(&rx) {
            Event::Result { tag: "timer", state, error } => {
                assert_eq!(state, ResultState::Error);
                assert_eq!(error, libc::ETIMEDOUT);
                break start.elapsed();
            }
            _ => continue,
        }
    };
    assert!(fired >= Duration::from_millis(60));
    assert!(fired < Duration::from_millis(350), "timer fired late: {fired:?}");

    let _b = writer.join().expect("Writer panicked");
    poll.stop();
}
