mod common;

use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::Duration;

use common::{echo_service, next, request, runtime, target};
use tracing_subscriber::EnvFilter;
use weft::sched::{RequestObject, SchedGroup};
use weft::task::{SeriesWork, TaskState, TimeoutReason};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn test_group_spreads_requests_over_members() {
    init_tracing();

    let runtime = runtime();
    let (service_a, binding_a) = echo_service(&runtime, "a", Some(Duration::from_millis(100)));
    let (service_b, binding_b) = echo_service(&runtime, "b", Some(Duration::from_millis(100)));

    let a = target(binding_a.local_addr(), 2);
    let b = target(binding_b.local_addr(), 2);
    let group = Arc::new(SchedGroup::new());
    group.add(&a).expect("Failed to add member");
    group.add(&b).expect("Failed to add member");
    assert_eq!(group.max_load(), 4);

    let (tx, rx) = channel();
    for i in 0..4 {
        let text = format!("req-{i}");
        SeriesWork::start(request(&runtime, group.clone(), &text, &tx), None);
    }
    assert_eq!(group.cur_load(), 4);
    assert_eq!(a.cur_load(), 2);
    assert_eq!(b.cur_load(), 2);

    // Every member is busy: a zero wait is refused on the spot.
    let mut extra = request(&runtime, group.clone(), "extra", &tx);
    extra.set_wait_timeout(Some(Duration::ZERO));
    SeriesWork::start(extra, None);

    let refused = next(&rx);
    assert_eq!(refused.state, TaskState::SysError);
    assert_eq!(refused.error, libc::EAGAIN);
    assert_eq!(refused.reason, TimeoutReason::NotTimeout);

    let mut served: Vec<_> = (0..4)
        .map(|_| {
            let outcome = next(&rx);
            assert_eq!(outcome.state, TaskState::Success, "{outcome:?}");
            outcome.text[..1].to_owned()
        })
        .collect();
    served.sort();
    assert_eq!(served, ["a", "a", "b", "b"]);
    assert_eq!(group.cur_load(), 0);

    service_a.stop(binding_a);
    service_b.stop(binding_b);
}

#[test]
fn test_group_waiter_gets_the_released_slot() {
    init_tracing();

    let runtime = runtime();
    let (service, binding) = echo_service(&runtime, "only", Some(Duration::from_millis(100)));

    let member = target(binding.local_addr(), 1);
    let group = Arc::new(SchedGroup::new());
    group.add(&member).expect("Failed to add member");

    let (tx, rx) = channel();
    SeriesWork::start(request(&runtime, group.clone(), "first", &tx), None);

    // Blocks this thread until the first exchange releases its slot.
    let mut queued = request(&runtime, group.clone(), "second", &tx);
    queued.set_wait_timeout(Some(Duration::from_secs(5)));
    SeriesWork::start(queued, None);

    let first = next(&rx);
    let second = next(&rx);
    assert_eq!(first.text, "only: first");
    assert_eq!(second.text, "only: second");
    assert_eq!(second.state, TaskState::Success);

    service.stop(binding);
}

#[test]
fn test_membership_changes() {
    let group = SchedGroup::new();
    let other = SchedGroup::new();
    let member = target("127.0.0.1:1".parse().expect("Invalid address"), 3);

    group.add(&member).expect("Failed to add member");
    assert!(matches!(group.add(&member), Err(weft::Error::AlreadyInGroup)));
    assert!(matches!(other.add(&member), Err(weft::Error::InOtherGroup)));
    assert!(matches!(other.remove(&member), Err(weft::Error::NotInGroup)));
    assert_eq!(group.len(), 1);

    group.remove(&member).expect("Failed to remove member");
    assert!(group.is_empty());
    assert_eq!(group.max_load(), 0);

    other.add(&member).expect("Released member should join another group");
    assert_eq!(other.max_load(), 3);
}
