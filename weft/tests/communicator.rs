mod common;

use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::mpsc::channel;
use std::time::Duration;

use common::{echo_service, next, request, runtime, target};
use weft::comm::CommTarget;
use weft::sched::{RequestObject, SchedTarget};
use weft::task::{SeriesWork, TaskState, TimeoutReason};

#[test]
fn test_echo_round_trip() {
    let runtime = runtime();
    let (service, binding) = echo_service(&runtime, "echo", None);
    let target = target(binding.local_addr(), 4);
    let (tx, rx) = channel();

    SeriesWork::start(request(&runtime, target.clone(), "hello", &tx), None);

    let outcome = next(&rx);
    assert_eq!(outcome.state, TaskState::Success, "{outcome:?}");
    assert_eq!(outcome.text, "echo: hello");
    assert_eq!(outcome.reason, TimeoutReason::NotTimeout);
    assert_eq!(target.cur_load(), 0);

    service.stop(binding);
}

#[test]
fn test_keep_alive_reuses_the_connection() {
    let runtime = runtime();
    let (service, binding) = echo_service(&runtime, "echo", None);
    let target = target(binding.local_addr(), 4);
    let (tx, rx) = channel();

    for text in ["one", "two"] {
        let mut task = request(&runtime, target.clone(), text, &tx);
        task.set_keep_alive(Some(Duration::from_secs(5)));
        SeriesWork::start(task, None);
    }
    let first = next(&rx);
    let second = next(&rx);
    assert_eq!(first.state, TaskState::Success);
    assert_eq!(second.state, TaskState::Success);

    let mut task = request(&runtime, target.clone(), "three", &tx);
    task.set_keep_alive(Some(Duration::from_secs(5)));
    SeriesWork::start(task, None);
    let third = next(&rx);

    assert_eq!(third.state, TaskState::Success);
    assert_eq!(third.text, "echo: three");
    assert!(
        third.connection == first.connection || third.connection == second.connection,
        "idle connection was not reused: {first:?} {second:?} {third:?}"
    );
    assert!(target.target().idle_count() >= 1);

    service.stop(binding);
}

#[test]
fn test_zero_keep_alive_opens_a_new_connection() {
    let runtime = runtime();
    let (service, binding) = echo_service(&runtime, "echo", None);
    let target = target(binding.local_addr(), 4);
    let (tx, rx) = channel();

    SeriesWork::start(request(&runtime, target.clone(), "first", &tx), None);
    let first = next(&rx);
    SeriesWork::start(request(&runtime, target.clone(), "second", &tx), None);
    let second = next(&rx);

    assert_eq!(first.state, TaskState::Success);
    assert_eq!(second.state, TaskState::Success);
    assert_ne!(first.connection, second.connection);
    assert_eq!(target.target().idle_count(), 0);

    service.stop(binding);
}

#[test]
fn test_expired_keep_alive_is_not_reused() {
    let runtime = runtime();
    let (service, binding) = echo_service(&runtime, "echo", None);
    let target = target(binding.local_addr(), 4);
    let (tx, rx) = channel();

    let mut task = request(&runtime, target.clone(), "first", &tx);
    task.set_keep_alive(Some(Duration::from_millis(100)));
    SeriesWork::start(task, None);
    let first = next(&rx);
    assert_eq!(first.state, TaskState::Success);
    assert_eq!(target.target().idle_count(), 1);

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(target.target().idle_count(), 0);

    let mut task = request(&runtime, target.clone(), "second", &tx);
    task.set_keep_alive(Some(Duration::from_millis(100)));
    SeriesWork::start(task, None);
    let second = next(&rx);

    assert_eq!(second.state, TaskState::Success);
    assert_eq!(second.text, "echo: second");
    assert!(first.connection.is_some());
    assert_ne!(first.connection, second.connection);

    service.stop(binding);
}

/// A listener whose accept queue is full, so new connects stay pending.
/// The returned streams hold the queue slots.
fn saturated_listener() -> (TcpListener, Vec<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let rc = unsafe { libc::listen(listener.as_raw_fd(), 0) };
    assert_eq!(rc, 0, "Failed to shrink backlog");

    let addr = listener.local_addr().expect("Failed to get local address");
    let mut held = Vec::new();
    for _ in 0..8 {
        match TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
            Ok(stream) => held.push(stream),
            Err(_) => return (listener, held),
        }
    }

    panic!("accept queue never filled up");
}

#[test]
fn test_pending_connect_times_out_in_connect() {
    let runtime = runtime();
    let (listener, _held) = saturated_listener();
    let addr = listener.local_addr().expect("Failed to get local address");

    let target = SchedTarget::new(
        CommTarget::new(addr).with_connect_timeout(Some(Duration::from_millis(100))),
        1,
    )
    .expect("Failed to create target");
    let (tx, rx) = channel();

    SeriesWork::start(request(&runtime, target.clone(), "hello?", &tx), None);

    let outcome = next(&rx);
    assert_eq!(outcome.state, TaskState::SysError);
    assert_eq!(outcome.error, libc::ETIMEDOUT);
    assert_eq!(outcome.reason, TimeoutReason::Connect);
    assert_eq!(target.cur_load(), 0);
}

#[test]
fn test_refused_connection_reports_errno() {
    let runtime = runtime();
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
        listener.local_addr().expect("Failed to get local address")
    };
    let target = target(addr, 1);
    let (tx, rx) = channel();

    SeriesWork::start(request(&runtime, target.clone(), "anyone?", &tx), None);

    let outcome = next(&rx);
    assert_eq!(outcome.state, TaskState::SysError);
    assert_eq!(outcome.error, libc::ECONNREFUSED);
    assert_eq!(outcome.reason, TimeoutReason::NotTimeout);
    assert_eq!(target.cur_load(), 0);
}

#[test]
fn test_saturated_target_times_out_waiting() {
    let runtime = runtime();
    let (service, binding) = echo_service(&runtime, "echo", Some(Duration::from_millis(300)));
    let target = target(binding.local_addr(), 1);
    let (tx, rx) = channel();

    SeriesWork::start(request(&runtime, target.clone(), "slow", &tx), None);

    let mut waiting = request(&runtime, target.clone(), "queued", &tx);
    waiting.set_wait_timeout(Some(Duration::from_millis(50)));
    SeriesWork::start(waiting, None);

    let rejected = next(&rx);
    assert_eq!(rejected.state, TaskState::SysError);
    assert_eq!(rejected.error, libc::ETIMEDOUT);
    assert_eq!(rejected.reason, TimeoutReason::Wait);
    assert_eq!(rejected.connection, None);

    let served = next(&rx);
    assert_eq!(served.state, TaskState::Success);
    assert_eq!(served.text, "echo: slow");

    service.stop(binding);
}

#[test]
fn test_slow_reply_times_out_in_transmit() {
    let runtime = runtime();
    let (service, binding) = echo_service(&runtime, "echo", Some(Duration::from_millis(500)));
    let target = target(binding.local_addr(), 1);
    let (tx, rx) = channel();

    let mut task = request(&runtime, target.clone(), "hurry", &tx);
    task.set_receive_timeout(Some(Duration::from_millis(100)));
    SeriesWork::start(task, None);

    let outcome = next(&rx);
    assert_eq!(outcome.state, TaskState::SysError);
    assert_eq!(outcome.error, libc::ETIMEDOUT);
    assert_eq!(outcome.reason, TimeoutReason::Transmit);
    assert_eq!(target.cur_load(), 0);

    service.stop(binding);
}

#[test]
fn test_shutdown_aborts_pending_requests() {
    let runtime = runtime();
    let (_service, binding) = echo_service(&runtime, "echo", Some(Duration::from_secs(30)));
    let target = target(binding.local_addr(), 1);
    let (tx, rx) = channel();

    SeriesWork::start(request(&runtime, target.clone(), "never", &tx), None);
    std::thread::sleep(Duration::from_millis(100));

    runtime.shutdown();

    let outcome = next(&rx);
    assert_eq!(outcome.state, TaskState::Aborted);

    let (tx, rx) = channel();
    SeriesWork::start(request(&runtime, target, "late", &tx), None);
    assert_eq!(next(&rx).state, TaskState::Aborted);
}
