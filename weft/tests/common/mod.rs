#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use weft::comm::{Binding, CommTarget, MessageIn, MessageOut, ReceiveContext, ServiceConfig};
use weft::reactor::Appended;
use weft::sched::{CommScheduler, RequestObject, SchedTarget};
use weft::task::{ClientTask, ServerTask, Service, TaskState, TimeoutReason, TimerTask};
use weft::{Runtime, RuntimeBuilder};

pub const WAIT: Duration = Duration::from_secs(5);

/// Newline-terminated text message, both directions.
#[derive(Default)]
pub struct Line {
    pub text: String,
    buf: Vec<u8>,
}

impl Line {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_owned(),
            buf: Vec::new(),
        }
    }
}

impl MessageOut for Line {
    fn encode(&mut self) -> io::Result<Vec<Bytes>> {
        Ok(vec![
            Bytes::from(self.text.clone()),
            Bytes::from_static(b"\n"),
        ])
    }
}

impl MessageIn for Line {
    fn append(&mut self, buf: &[u8], _cx: &mut ReceiveContext<'_>) -> io::Result<Appended> {
        match buf.iter().position(|&b| b == b'\n') {
            Some(end) => {
                self.buf.extend_from_slice(&buf[..end]);
                self.text = String::from_utf8(std::mem::take(&mut self.buf))
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Appended::Complete(end + 1))
            }
            None => {
                self.buf.extend_from_slice(buf);
                Ok(Appended::Incomplete)
            }
        }
    }
}

/// What a client callback saw.
#[derive(Debug)]
pub struct Outcome {
    pub state: TaskState,
    pub error: i32,
    pub reason: TimeoutReason,
    pub text: String,
    pub connection: Option<u64>,
}

pub fn runtime() -> Runtime {
    RuntimeBuilder::new()
        .poller_threads(2)
        .handler_threads(4)
        .compute_threads(2)
        .build()
        .expect("Failed to build runtime")
}

/// Answers every line with `"{prefix}: {line}"`, after `delay` when one is
/// given.
pub fn echo_service(
    runtime: &Runtime,
    prefix: &'static str,
    delay: Option<Duration>,
) -> (Arc<Service<Line, Line>>, Binding) {
    let scheduler: Weak<CommScheduler> = Arc::downgrade(runtime.scheduler());

    let service = runtime.service(move |task: &mut ServerTask<Line, Line>, series| {
        let reply = format!("{prefix}: {}", task.req().text);
        task.resp_mut().text = reply;

        if let (Some(delay), Some(scheduler)) = (delay, scheduler.upgrade()) {
            series.push_back(TimerTask::new(scheduler, delay, None));
        }
    });

    let config = ServiceConfig::new("127.0.0.1:0".parse().expect("Invalid address"));
    let binding = service.start(config).expect("Failed to bind service");
    (service, binding)
}

pub fn target(addr: SocketAddr, max_load: usize) -> Arc<SchedTarget> {
    SchedTarget::new(CommTarget::new(addr), max_load).expect("Failed to create target")
}

/// A client task reporting its outcome on `tx`.
pub fn request(
    runtime: &Runtime,
    object: Arc<dyn RequestObject>,
    text: &str,
    tx: &Sender<Outcome>,
) -> Box<ClientTask<Line, Line>> {
    let tx = tx.clone();
    runtime.client_task(object, Line::new(text), move |task: &mut ClientTask<Line, Line>| {
        let _ = tx.send(Outcome {
            state: task.state(),
            error: task.error(),
            reason: task.timeout_reason(),
            text: task.resp().text.clone(),
            connection: task.connection().map(|c| c.id()),
        });
    })
}

pub fn next(rx: &Receiver<Outcome>) -> Outcome {
    rx.recv_timeout(WAIT).expect("Client callback never ran")
}
