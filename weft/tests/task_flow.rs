use std::sync::Arc;
use std::sync::mpsc::{Receiver, channel};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing_test::traced_test;
use weft::runtime::ExecQueue;
use weft::task::{GoTask, ParallelWork, SeriesWork, SubTask, TaskState};
use weft::{Runtime, RuntimeBuilder, parallel, series};

const WAIT: Duration = Duration::from_secs(5);

fn runtime() -> Runtime {
    RuntimeBuilder::new()
        .poller_threads(1)
        .handler_threads(4)
        .compute_threads(4)
        .build()
        .expect("Failed to build runtime")
}

fn wait_for<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(WAIT).expect("Flow never finished")
}

type Log = Arc<Mutex<Vec<&'static str>>>;

/// A go task appending `label` to `log`.
fn record(
    runtime: &Runtime,
    queue: &Arc<ExecQueue>,
    log: &Log,
    label: &'static str,
) -> Box<dyn SubTask> {
    let log = log.clone();
    runtime.go_task(queue, move || log.lock().push(label))
}

#[test]
fn test_series_runs_tasks_in_order() {
    let runtime = runtime();
    let log: Log = Arc::default();
    let (tx, rx) = channel();
    let start = Instant::now();

    let first = {
        let log = log.clone();
        runtime.timer_task(Duration::from_millis(40), move |t| {
            assert_eq!(t.state(), TaskState::Success);
            log.lock().push("first");
        })
    };
    let second = {
        let log = log.clone();
        runtime.timer_task(Duration::from_millis(40), move |_| log.lock().push("second"))
    };
    let third = record(&runtime, &ExecQueue::new(), &log, "third");

    let flow = series!(first, second, third);
    assert_eq!(flow.len(), 2);
    flow.set_callback(Box::new(move |s: &SeriesWork| {
        let _ = tx.send(s.is_finished());
    }));
    flow.run();

    assert!(wait_for(&rx));
    assert!(start.elapsed() >= Duration::from_millis(80));
    assert_eq!(*log.lock(), ["first", "second", "third"]);
}

#[test]
fn test_parallel_branches_overlap() {
    let runtime = runtime();
    let (tx, rx) = channel();
    let start = Instant::now();

    let mut fan_out = parallel!(
        series!(runtime.timer_task(Duration::from_millis(150), |_| {})),
        series!(runtime.timer_task(Duration::from_millis(150), |_| {})),
        series!(runtime.timer_task(Duration::from_millis(150), |_| {}))
    )
    .expect("Series already in a parallel work");
    assert_eq!(fan_out.size(), 3);

    fan_out.set_callback(Box::new(move |p: &ParallelWork| {
        let _ = tx.send(p.size());
    }));
    fan_out.start();

    assert_eq!(wait_for(&rx), 3);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(150));
    assert!(
        elapsed < Duration::from_millis(400),
        "branches ran one after the other: {elapsed:?}"
    );
}

#[test]
fn test_parallel_inside_a_series() {
    let runtime = runtime();
    let queue = ExecQueue::new();
    let log: Log = Arc::default();
    let (tx, rx) = channel();

    let fan_out = parallel!(
        series!(
            runtime.timer_task(Duration::from_millis(30), |_| {}),
            record(&runtime, &queue, &log, "left")
        ),
        series!(record(&runtime, &ExecQueue::new(), &log, "right"))
    )
    .expect("Series already in a parallel work");

    let flow = series!(
        record(&runtime, &queue, &log, "before"),
        fan_out,
        record(&runtime, &queue, &log, "after")
    );
    flow.set_callback(Box::new(move |_: &SeriesWork| {
        let _ = tx.send(());
    }));
    flow.run();

    wait_for(&rx);
    let log = log.lock();
    assert_eq!(log.len(), 4);
    assert_eq!(log[0], "before");
    assert_eq!(log[3], "after");
    assert!(log.contains(&"left") && log.contains(&"right"));
}

#[test]
fn test_go_tasks_share_a_queue_in_order() {
    let runtime = runtime();
    let queue = ExecQueue::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = channel();

    for i in 0..32 {
        let seen = seen.clone();
        let tx = tx.clone();
        let mut task = runtime.go_task(&queue, move || seen.lock().push(i));
        task.set_callback(Box::new(move |t: &GoTask| {
            let _ = tx.send(t.state());
        }));
        SeriesWork::start(task, None);
    }

    for _ in 0..32 {
        assert_eq!(wait_for(&rx), TaskState::Success);
    }
    assert_eq!(*seen.lock(), (0..32).collect::<Vec<_>>());
}

#[test]
fn test_counter_releases_its_series() {
    let runtime = runtime();
    let (tx, rx) = channel();

    let (wait, counter) = runtime.counter_task(3, |c| assert_eq!(c.state(), TaskState::Success));
    let done = runtime.timer_task(Duration::ZERO, move |_| {
        let _ = tx.send(());
    });
    series!(wait, done).run();

    let workers: Vec<_> = (0..3)
        .map(|_| {
            let counter = counter.clone();
            std::thread::spawn(move || counter.count())
        })
        .collect();
    let fired = workers
        .into_iter()
        .map(|w| w.join().expect("Counting thread panicked"))
        .filter(|&last| last)
        .count();

    assert_eq!(fired, 1);
    wait_for(&rx);
    assert!(!counter.count());
}

#[test]
#[traced_test]
fn test_graph_orders_a_diamond() {
    let runtime = runtime();
    let log: Log = Arc::default();
    let (tx, rx) = channel();

    let mut graph = runtime.graph_task(move |g| {
        let _ = tx.send((g.state(), g.len()));
    });

    let top = graph.create_node(record(&runtime, &ExecQueue::new(), &log, "top"));
    let left = graph.create_node(runtime.timer_task(Duration::from_millis(20), |_| {}));
    let right = graph.create_node(record(&runtime, &ExecQueue::new(), &log, "right"));
    let bottom = graph.create_node(record(&runtime, &ExecQueue::new(), &log, "bottom"));

    top.precede(&left);
    top.precede(&right);
    bottom.succeed(&left);
    bottom.succeed(&right);
    tracing::info!(nodes = graph.len(), "diamond built");

    SeriesWork::start(graph, None);

    assert_eq!(wait_for(&rx), (TaskState::Success, 4));
    assert_eq!(*log.lock(), ["top", "right", "bottom"]);
    assert!(logs_contain("diamond built"));
}

#[test]
fn test_empty_flows_finish_immediately() {
    let runtime = runtime();
    let (tx, rx) = channel();

    let graph = {
        let tx = tx.clone();
        runtime.graph_task(move |g| {
            assert!(g.is_empty());
            let _ = tx.send("graph");
        })
    };
    SeriesWork::start(graph, None);
    assert_eq!(wait_for(&rx), "graph");

    let mut empty = parallel!().expect("Empty parallel work");
    empty.set_callback(Box::new(move |p: &ParallelWork| {
        assert_eq!(p.size(), 0);
        let _ = tx.send("parallel");
    }));
    empty.start();
    assert_eq!(wait_for(&rx), "parallel");
}
