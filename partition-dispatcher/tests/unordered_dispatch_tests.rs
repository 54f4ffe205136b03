mod common;

use std::time::Duration;

use common::{fast_settings, partition, unordered};
use partition_dispatcher::broker::CommitMode;
use partition_dispatcher::dispatcher::{CycleOutcome, Dispatcher, DispatcherSettings};
use partition_dispatcher::test_utils::{MockBroker, RecordingExecutor};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_records_of_a_partition_run_concurrently() {
    let p0 = partition(0);
    let broker = MockBroker::with_assignment(vec![p0.clone()]);
    broker.push_records(&p0, 0..6);

    let mut h = unordered(
        broker,
        RecordingExecutor::new().with_delay(Duration::from_millis(30)),
        4,
        fast_settings(),
    );

    assert!(h.cycle_until(WAIT, |h| h.broker.committed(&p0) == Some(6)));

    let mut executed = h.executor.executed_offsets_for(&p0);
    executed.sort_unstable();
    assert_eq!(executed, (0..6).collect::<Vec<_>>());
    assert!(h.executor.max_partition_concurrency() > 1);
    assert!(h.executor.max_concurrency() <= 4);
    // nothing is paused outside the operator override
    assert_eq!(h.broker.pause_calls(), 0);
}

#[test]
fn test_no_poll_until_previous_poll_settles() {
    let p0 = partition(0);
    let broker = MockBroker::with_assignment(vec![p0.clone()]);
    broker.push_records(&p0, 0..2);

    let mut h = unordered(
        broker,
        RecordingExecutor::new().with_delay(Duration::from_millis(200)),
        2,
        fast_settings(),
    );

    assert_eq!(h.dispatcher.poll_cycle(), CycleOutcome::Busy);
    h.broker.push_records(&p0, 2..4);
    assert_eq!(h.dispatcher.poll_cycle(), CycleOutcome::Busy);
    assert_eq!(h.broker.poll_count(), 1);
    assert_eq!(h.broker.backlog_len(&p0), 2);

    assert!(h.cycle_until(WAIT, |h| h.broker.committed(&p0) == Some(4)));
}

#[test]
fn test_revoke_drains_in_flight_records() {
    let p0 = partition(0);
    let broker = MockBroker::with_assignment(vec![p0.clone()]);
    broker.push_records(&p0, 0..2);

    let settings = DispatcherSettings {
        commit_interval: Duration::from_secs(60),
        ..fast_settings()
    };
    let mut h = unordered(
        broker,
        RecordingExecutor::new().with_delay(Duration::from_millis(20)),
        2,
        settings,
    );

    assert!(h.cycle_until(WAIT, |h| h.executor.executed().len() == 2));
    h.broker.push_records(&p0, 2..4);
    assert!(h.cycle_until(WAIT, |h| h.executor.executed().len() == 4));

    h.dispatcher.revoke(&[p0.clone()]);

    // the settled first poll and the drained second poll are committed together
    assert_eq!(h.broker.committed(&p0), Some(4));
    let (_, mode) = h.broker.commits().pop().unwrap();
    assert_eq!(mode, CommitMode::Sync);
}

#[test]
fn test_idle_when_nothing_polled() {
    let broker = MockBroker::with_assignment(vec![partition(0)]);
    let mut h = unordered(broker, RecordingExecutor::new(), 1, fast_settings());

    assert_eq!(h.dispatcher.poll_cycle(), CycleOutcome::Idle);
}

#[test]
fn test_shutdown_commits_settled_offsets() {
    let p0 = partition(0);
    let broker = MockBroker::with_assignment(vec![p0.clone()]);
    broker.push_records(&p0, 0..3);

    let settings = DispatcherSettings {
        commit_interval: Duration::from_secs(60),
        ..fast_settings()
    };
    let mut h = unordered(broker, RecordingExecutor::new(), 2, settings);

    assert!(h.cycle_until(WAIT, |h| h.executor.executed().len() == 3));
    h.dispatcher.shutdown();

    assert_eq!(h.broker.committed(&p0), Some(3));
    assert!(h.broker.is_closed());
}
