use super::TaskState;
use super::counter::{Counter, CounterTask};
use super::parallel::ParallelWork;
use super::series::SeriesWork;
use super::sub_task::{SubTask, TaskLink, next_in_series, sub_task_done};

use parking_lot::Mutex;
use std::sync::Arc;

pub type GraphCallback = Box<dyn FnOnce(&GraphTask) + Send>;

/// Position of a task inside a [`GraphTask`], used to declare edges.
///
/// Edges must be declared before the graph is dispatched.
#[derive(Clone)]
pub struct GraphNode {
    counter: Counter,
    successors: Arc<Mutex<Vec<Counter>>>,
}

impl GraphNode {
    /// Makes `next` wait for this node.
    pub fn precede(&self, next: &GraphNode) {
        if next.counter.add_pending() {
            self.successors.lock().push(next.counter.clone());
        }
    }

    /// Makes this node wait for `prev`.
    pub fn succeed(&self, prev: &GraphNode) {
        prev.precede(self);
    }
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("waiting_on", &self.counter.remaining().saturating_sub(1))
            .field("successors", &self.successors.lock().len())
            .finish()
    }
}

/// Last task of a node's series: releases every successor.
struct Signal {
    link: TaskLink,
    successors: Arc<Mutex<Vec<Counter>>>,
}

impl SubTask for Signal {
    fn dispatch(self: Box<Self>) {
        let successors = std::mem::take(&mut *self.successors.lock());
        for counter in &successors {
            counter.count();
        }

        sub_task_done(self);
    }

    fn done(self: Box<Self>) -> Option<Box<dyn SubTask>> {
        next_in_series(&self.link)
    }

    fn link(&self) -> &TaskLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut TaskLink {
        &mut self.link
    }
}

/// A directed acyclic graph of tasks.
///
/// Each node runs in a series of its own: it waits for its predecessors,
/// runs its task, then releases its successors. The graph task completes
/// once every node finished. A cycle leaves the nodes on it waiting
/// forever.
///
/// # Example
///
/// ```rust,ignore
/// let mut graph = GraphTask::new(Some(Box::new(|_| println!("all done"))));
/// let a = graph.create_node(runtime.timer_task(ms(10), |_| {}));
/// let b = graph.create_node(runtime.go_task(&queue, || work()));
/// let c = graph.create_node(runtime.go_task(&queue, || more_work()));
///
/// a.precede(&b);
/// a.precede(&c);
/// SeriesWork::start(graph, None);
/// ```
pub struct GraphTask {
    link: TaskLink,
    parallel: Option<Box<ParallelWork>>,
    state: TaskState,
    callback: Option<GraphCallback>,
}

impl GraphTask {
    pub fn new(callback: Option<GraphCallback>) -> Box<Self> {
        Box::new(Self {
            link: TaskLink::new(),
            parallel: Some(ParallelWork::new(None)),
            state: TaskState::Undefined,
            callback,
        })
    }

    /// Adds `task` as a new node.
    pub fn create_node(&mut self, task: Box<dyn SubTask>) -> GraphNode {
        let (wait, counter) = CounterTask::new(0, None);
        let successors = Arc::new(Mutex::new(Vec::new()));

        let series = SeriesWork::new(wait, None);
        series.push_back(task);
        series.set_last(Box::new(Signal {
            link: TaskLink::new(),
            successors: successors.clone(),
        }));

        match &mut self.parallel {
            Some(parallel) => {
                let added = parallel.add_series(series);
                debug_assert!(added.is_ok(), "fresh series cannot be a branch yet");
            }
            None => {
                debug_assert!(false, "nodes added to a running graph");
                series.dismiss();
            }
        }

        GraphNode {
            counter,
            successors,
        }
    }

    /// Number of nodes, until the graph is dispatched.
    pub fn len(&self) -> usize {
        self.parallel.as_ref().map_or(0, |p| p.size())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn set_callback(&mut self, callback: GraphCallback) {
        self.callback = Some(callback);
    }
}

impl SubTask for GraphTask {
    /// The first dispatch runs the nodes ahead of the graph task in its
    /// series; the second one, after they all finished, completes it.
    fn dispatch(mut self: Box<Self>) {
        let Some(mut parallel) = self.parallel.take() else {
            self.state = TaskState::Success;
            sub_task_done(self);
            return;
        };

        let series = self
            .link
            .series
            .clone()
            .unwrap_or_else(SeriesWork::empty);
        let parent = std::mem::take(&mut self.link.parent);

        series.push_front(self);

        let link = parallel.link_mut();
        link.series = Some(series);
        link.parent = parent;
        parallel.dispatch();
    }

    fn done(mut self: Box<Self>) -> Option<Box<dyn SubTask>> {
        if let Some(callback) = self.callback.take() {
            callback(&*self);
        }

        next_in_series(&self.link)
    }

    fn link(&self) -> &TaskLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut TaskLink {
        &mut self.link
    }
}

impl std::fmt::Debug for GraphTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphTask")
            .field("nodes", &self.len())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    /// Logs its label from another thread.
    struct Step {
        link: TaskLink,
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl SubTask for Step {
        fn dispatch(self: Box<Self>) {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(2));
                self.log.lock().push(self.label);
                sub_task_done(self);
            });
        }

        fn done(self: Box<Self>) -> Option<Box<dyn SubTask>> {
            next_in_series(&self.link)
        }

        fn link(&self) -> &TaskLink {
            &self.link
        }

        fn link_mut(&mut self) -> &mut TaskLink {
            &mut self.link
        }
    }

    fn step(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Box<dyn SubTask> {
        Box::new(Step {
            link: TaskLink::new(),
            label,
            log: log.clone(),
        })
    }

    fn position(log: &[&str], label: &str) -> usize {
        log.iter().position(|l| *l == label).unwrap()
    }

    #[test]
    fn diamond_runs_in_dependency_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel();

        let mut graph = GraphTask::new(Some(Box::new(|g: &GraphTask| {
            assert_eq!(g.state(), TaskState::Success);
        })));
        let a = graph.create_node(step("a", &log));
        let b = graph.create_node(step("b", &log));
        let c = graph.create_node(step("c", &log));
        let d = graph.create_node(step("d", &log));
        assert_eq!(graph.len(), 4);

        a.precede(&b);
        a.precede(&c);
        d.succeed(&b);
        d.succeed(&c);

        let series = SeriesWork::new(graph, Some(Box::new(move |_| tx.send(()).unwrap())));
        series.push_back(step("after", &log));
        series.run();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let log = log.lock();
        assert_eq!(log.len(), 5);
        assert!(position(&log, "a") < position(&log, "b"));
        assert!(position(&log, "a") < position(&log, "c"));
        assert!(position(&log, "b") < position(&log, "d"));
        assert!(position(&log, "c") < position(&log, "d"));
        assert_eq!(log[4], "after");
    }

    #[test]
    fn empty_graph_completes() {
        let (tx, rx) = std::sync::mpsc::channel();
        let graph = GraphTask::new(Some(Box::new(move |g: &GraphTask| {
            assert!(g.is_empty());
            tx.send(()).unwrap();
        })));

        SeriesWork::start(graph, None);
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }
}
