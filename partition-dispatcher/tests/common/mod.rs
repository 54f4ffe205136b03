//! Shared helpers for the dispatcher integration tests.
//!
//! Dispatchers block on broker polls and processor drains, so tests drive them from the
//! test thread and run the worker pool on a separate multi-thread runtime.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use partition_dispatcher::broker::{BrokerError, CommitMode};
use partition_dispatcher::dispatcher::{
    Dispatcher, DispatcherSettings, OrderedDispatcher, UnorderedDispatcher,
};
use partition_dispatcher::partition_gate::OperationalControls;
use partition_dispatcher::request::{MissingCredentialPolicy, RequestHandler};
use partition_dispatcher::test_utils::{MockBroker, RecordingExecutor};
use partition_dispatcher::types::Partition;
use partition_dispatcher::worker_pool::WorkerPool;
use tokio::runtime::Runtime;

pub const TOPIC: &str = "requests";

pub fn partition(number: i32) -> Partition {
    Partition::new(TOPIC.to_string(), number)
}

pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// Short timeouts so a test completes in well under a second.
pub fn fast_settings() -> DispatcherSettings {
    DispatcherSettings {
        poll_timeout: Duration::from_millis(10),
        poll_error_backoff: Duration::from_millis(10),
        idle_interval: Duration::ZERO,
        commit_interval: Duration::from_millis(20),
        commit_mode: CommitMode::Async,
        monitor_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(2),
        revoke_drain_timeout: Duration::from_secs(2),
    }
}

pub fn handler(executor: Arc<RecordingExecutor>) -> Arc<RequestHandler> {
    Arc::new(
        RequestHandler::new(executor)
            .with_missing_credential_policy(MissingCredentialPolicy::PassThrough),
    )
}

/// Everything a test needs to drive a dispatcher and inspect its effects.
pub struct Harness<D> {
    pub dispatcher: D,
    pub broker: MockBroker,
    pub executor: Arc<RecordingExecutor>,
    pub controls: Arc<OperationalControls>,
    pub runtime: Runtime,
}

pub fn ordered(
    broker: MockBroker,
    executor: RecordingExecutor,
    pool_size: usize,
    settings: DispatcherSettings,
) -> Harness<OrderedDispatcher<MockBroker>> {
    let runtime = runtime();
    let executor = Arc::new(executor);
    let controls = Arc::new(OperationalControls::new());
    let pool = WorkerPool::new(runtime.handle().clone(), pool_size);

    let connected = broker.clone();
    let dispatcher = OrderedDispatcher::new(
        settings,
        pool,
        handler(executor.clone()),
        controls.clone(),
        move |listener| {
            connected.set_listener(listener);
            Ok::<_, BrokerError>(connected)
        },
    )
    .unwrap();

    Harness {
        dispatcher,
        broker,
        executor,
        controls,
        runtime,
    }
}

pub fn unordered(
    broker: MockBroker,
    executor: RecordingExecutor,
    pool_size: usize,
    settings: DispatcherSettings,
) -> Harness<UnorderedDispatcher<MockBroker>> {
    let runtime = runtime();
    let executor = Arc::new(executor);
    let controls = Arc::new(OperationalControls::new());
    let pool = WorkerPool::new(runtime.handle().clone(), pool_size);

    let connected = broker.clone();
    let dispatcher = UnorderedDispatcher::new(
        settings,
        pool,
        handler(executor.clone()),
        controls.clone(),
        move |listener| {
            connected.set_listener(listener);
            Ok::<_, BrokerError>(connected)
        },
    )
    .unwrap();

    Harness {
        dispatcher,
        broker,
        executor,
        controls,
        runtime,
    }
}

impl<D: Dispatcher> Harness<D> {
    /// Run poll cycles until `done` holds. Returns `false` if `timeout` passes first.
    pub fn cycle_until(&mut self, timeout: Duration, done: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done(self) {
                return true;
            }
            self.dispatcher.poll_cycle();
        }
        done(self)
    }

    /// Wait, without polling, until `done` holds or `timeout` passes.
    pub fn wait_until(&self, timeout: Duration, done: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done(self)
    }
}
