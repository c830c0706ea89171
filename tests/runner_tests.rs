#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use busrpc::{
    CancelSignal, Message, MessageBus, RawHandler, RpcError, Runner, RunnerConfig, RunnerState,
};

fn counting(count: &Arc<AtomicUsize>, delay: Duration) -> impl Fn(Message) + Send + Sync + 'static {
    let count = Arc::clone(count);
    move |_msg: Message| {
        if !delay.is_zero() {
            may::coroutine::sleep(delay);
        }
        count.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_register_spawns_exact_worker_count() {
    let (bus, dispatcher) = common::setup();
    let count = Arc::new(AtomicUsize::new(0));
    let runner = dispatcher
        .register("jobs.Resize", "resizers", 4, counting(&count, Duration::ZERO))
        .unwrap();

    assert_eq!(runner.concurrency(), 4);
    assert_eq!(runner.group(), "resizers");
    assert_eq!(runner.subject(), "jobs.Resize");
    let metrics = runner.metrics();
    assert!(common::wait_until(Duration::from_secs(1), || metrics.get_active_workers() == 4));
    assert_eq!(bus.subscription_count("jobs.Resize"), 1);

    runner.shutdown().unwrap();
    assert_eq!(metrics.get_active_workers(), 0);
}

#[test]
fn test_concurrency_bound_holds_under_burst() {
    let (bus, dispatcher) = common::setup();
    let count = Arc::new(AtomicUsize::new(0));
    let runner = dispatcher
        .register("jobs.Burst", "g", 3, counting(&count, Duration::from_millis(20)))
        .unwrap();

    for _ in 0..30 {
        bus.publish("jobs.Burst", b"work".to_vec()).unwrap();
    }
    assert!(common::wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 30));
    // Thirty 20ms jobs keep every worker busy at once
    assert_eq!(runner.metrics().get_peak_in_flight(), 3);

    runner.shutdown().unwrap();
}

#[test]
fn test_shutdown_drains_buffered_messages_then_stops() {
    let (bus, dispatcher) = common::setup();
    let count = Arc::new(AtomicUsize::new(0));
    let runner = dispatcher
        .register("jobs.Drain", "g", 1, counting(&count, Duration::from_millis(50)))
        .unwrap();

    for _ in 0..4 {
        bus.publish("jobs.Drain", b"work".to_vec()).unwrap();
    }
    // One message in the handler, three buffered behind it
    let metrics = Arc::clone(runner.metrics());
    assert!(common::wait_until(Duration::from_secs(1), || metrics.get_delivered() >= 1));

    runner.shutdown().unwrap();
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert_eq!(count.load(Ordering::SeqCst), 4);
    assert_eq!(metrics.get_active_workers(), 0);
    assert_eq!(bus.subscription_count("jobs.Drain"), 0);

    // Nothing is delivered after shutdown
    bus.publish("jobs.Drain", b"late".to_vec()).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), 4);
    assert_eq!(metrics.get_delivered(), 4);
}

#[test]
fn test_cancel_stops_pickups_without_interrupting_handler() {
    let (bus, dispatcher) = common::setup();
    let count = Arc::new(AtomicUsize::new(0));
    let runner = dispatcher
        .register("jobs.Cancel", "g", 1, counting(&count, Duration::from_millis(100)))
        .unwrap();

    for _ in 0..3 {
        bus.publish("jobs.Cancel", b"work".to_vec()).unwrap();
    }
    let metrics = Arc::clone(runner.metrics());
    assert!(common::wait_until(Duration::from_secs(1), || metrics.get_delivered() >= 1));

    dispatcher.cancel();
    assert_eq!(runner.state(), RunnerState::ShuttingDown);
    assert_eq!(bus.subscription_count("jobs.Cancel"), 0);

    runner.shutdown().unwrap();
    assert_eq!(runner.state(), RunnerState::Stopped);
    // The in-flight handler finished; the buffered ones were dropped
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.get_delivered(), 1);
    assert_eq!(metrics.get_active_workers(), 0);
}

#[test]
fn test_shutdown_is_idempotent() {
    let (_bus, dispatcher) = common::setup();
    let runner = dispatcher
        .register("jobs.Twice", "g", 2, |_msg: Message| {})
        .unwrap();
    runner.shutdown().unwrap();
    runner.shutdown().unwrap();
    assert_eq!(runner.state(), RunnerState::Stopped);
}

#[test]
fn test_subscribe_failures_are_reported() {
    let (bus, dispatcher) = common::setup();

    let err = dispatcher
        .register("jobs..Bad", "g", 1, |_msg: Message| {})
        .unwrap_err();
    assert!(matches!(err, RpcError::Subscribe { .. }));

    bus.close();
    let err = dispatcher
        .register("jobs.Closed", "g", 1, |_msg: Message| {})
        .unwrap_err();
    assert!(matches!(err, RpcError::Subscribe { .. }));
    assert!(err.is_transport());
}

#[test]
fn test_unknown_subscription_cannot_be_unsubscribed() {
    let (bus, _dispatcher) = common::setup();
    let subscription = bus.queue_subscribe("jobs.Other", "g").unwrap();
    bus.unsubscribe(subscription.id).unwrap();
    let err = bus.unsubscribe(subscription.id).unwrap_err();
    assert!(matches!(err, RpcError::Unsubscribe { .. }));
}

#[test]
fn test_queue_group_members_compete() {
    let (bus, dispatcher) = common::setup();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let a = dispatcher
        .register("jobs.Shared", "workers", 1, counting(&first, Duration::ZERO))
        .unwrap();
    let b = dispatcher
        .register("jobs.Shared", "workers", 1, counting(&second, Duration::ZERO))
        .unwrap();

    for _ in 0..10 {
        bus.publish("jobs.Shared", b"work".to_vec()).unwrap();
    }
    assert!(common::wait_until(Duration::from_secs(2), || {
        first.load(Ordering::SeqCst) + second.load(Ordering::SeqCst) == 10
    }));
    assert_eq!(first.load(Ordering::SeqCst), 5);
    assert_eq!(second.load(Ordering::SeqCst), 5);

    a.shutdown().unwrap();
    b.shutdown().unwrap();
}

#[test]
fn test_separate_groups_each_get_a_copy() {
    let (bus, dispatcher) = common::setup();
    let audit = Arc::new(AtomicUsize::new(0));
    let work = Arc::new(AtomicUsize::new(0));
    let a = dispatcher
        .register("jobs.*", "audit", 1, counting(&audit, Duration::ZERO))
        .unwrap();
    let b = dispatcher
        .register("jobs.Copy", "workers", 2, counting(&work, Duration::ZERO))
        .unwrap();

    for _ in 0..5 {
        bus.publish("jobs.Copy", b"work".to_vec()).unwrap();
    }
    assert!(common::wait_until(Duration::from_secs(2), || {
        audit.load(Ordering::SeqCst) == 5 && work.load(Ordering::SeqCst) == 5
    }));

    a.shutdown().unwrap();
    b.shutdown().unwrap();
}

#[test]
fn test_raw_handler_can_reply() {
    let (bus, dispatcher) = common::setup();
    let runner = dispatcher
        .register("jobs.Ping", "g", 1, |msg: Message| {
            let mut data = msg.data.clone();
            data.extend_from_slice(b"-pong");
            msg.respond(data).unwrap();
        })
        .unwrap();

    let reply = bus
        .request("jobs.Ping", b"ping".to_vec(), Duration::from_secs(1))
        .unwrap();
    assert_eq!(reply, b"ping-pong");

    runner.shutdown().unwrap();
}

#[test]
fn test_runner_start_with_child_cancel_signal() {
    let (bus, _dispatcher) = common::setup();
    let parent = CancelSignal::new();
    let handler: RawHandler = Arc::new(|_msg: Message| {});
    let runner = Runner::start(
        Arc::new(bus.clone()),
        RunnerConfig::new("jobs.Child", "g", 1).with_stack_size(0x8000),
        parent.child(),
        handler,
    )
    .unwrap();
    assert_eq!(runner.state(), RunnerState::Running);

    parent.cancel();
    assert_eq!(runner.state(), RunnerState::ShuttingDown);
    runner.shutdown().unwrap();
    assert_eq!(bus.subscription_count("jobs.Child"), 0);
}

#[test]
fn test_idle_pool_shuts_down_promptly() {
    let (bus, dispatcher) = common::setup();
    let count = Arc::new(AtomicUsize::new(0));
    let runner = dispatcher
        .register("jobs.Idle", "g", 4, counting(&count, Duration::from_millis(50)))
        .unwrap();
    let metrics = Arc::clone(runner.metrics());
    assert!(common::wait_until(Duration::from_secs(1), || metrics.get_active_workers() == 4));

    for _ in 0..4 {
        bus.publish("jobs.Idle", b"work".to_vec()).unwrap();
    }
    assert!(common::wait_until(Duration::from_secs(1), || count.load(Ordering::SeqCst) == 4));
    assert_eq!(metrics.get_peak_in_flight(), 4);

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = done_tx.send(runner.shutdown());
    });
    done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("shutdown of parked workers hung")
        .unwrap();
    assert_eq!(metrics.get_active_workers(), 0);
    assert_eq!(bus.subscription_count("jobs.Idle"), 0);
}
