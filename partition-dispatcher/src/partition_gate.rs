//! Partition Gate - pause/resume flow control
//!
//! A partition is paused at the broker while it has an active batch processor, so no new
//! records arrive for it until the current batch is done. The gate keeps the broker's
//! pause state and the [`PartitionMonitor`] in lockstep: every pause creates an entry and
//! every resume removes one.
//!
//! On top of that sits an operator override. `trigger_pausing` pauses every assigned
//! partition until `trigger_resuming` is called; while the override is active, batches
//! that finish do not resume their partition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::batch_processor::BatchProcessor;
use crate::broker::BrokerClient;
use crate::metrics_consts::FLOW_CONTROL_CALLS;
use crate::partition_monitor::PartitionMonitor;
use crate::types::Partition;

/// Global pause/resume requests, consumed once per poll cycle by the dispatcher thread.
#[derive(Debug, Default)]
pub struct OperationalControls {
    pause_requested: AtomicBool,
    resume_requested: AtomicBool,
}

impl OperationalControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger_pausing(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn trigger_resuming(&self) {
        self.resume_requested.store(true, Ordering::SeqCst);
    }

    fn take_pause(&self) -> bool {
        self.pause_requested
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn take_resume(&self) -> bool {
        self.resume_requested
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

pub struct PartitionGate {
    controls: Arc<OperationalControls>,
    globally_paused: bool,
}

impl PartitionGate {
    pub fn new(controls: Arc<OperationalControls>) -> Self {
        Self {
            controls,
            globally_paused: false,
        }
    }

    pub fn controls(&self) -> &Arc<OperationalControls> {
        &self.controls
    }

    pub fn is_globally_paused(&self) -> bool {
        self.globally_paused
    }

    /// Pause `partition` for the batch `processor` is about to run.
    ///
    /// Already-paused partitions are not paused again; their monitor entry is pointed at
    /// the new processor instead.
    pub fn pause<B: BrokerClient + ?Sized>(
        &self,
        broker: &mut B,
        monitor: &mut PartitionMonitor,
        partition: &Partition,
        processor: Arc<BatchProcessor>,
    ) {
        if monitor.contains(partition) {
            monitor.attach_processor(partition, processor);
            return;
        }

        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "PAUSE partition"
        );
        if let Err(e) = broker.pause(std::slice::from_ref(partition)) {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                error = ?e,
                "Failed to pause partition"
            );
            return;
        }
        record_flow_control("pause", "partition", 1);
        monitor.record_pause(partition, Instant::now(), Some(processor));
    }

    /// Resume partitions whose batch has finished.
    ///
    /// While the global override is active the partitions stay paused and only lose
    /// their processor reference.
    pub fn resume<B: BrokerClient + ?Sized>(
        &self,
        broker: &mut B,
        monitor: &mut PartitionMonitor,
        partitions: &[Partition],
    ) {
        if partitions.is_empty() {
            return;
        }

        if self.globally_paused {
            for partition in partitions {
                monitor.detach_processor(partition);
            }
            debug!(
                count = partitions.len(),
                "Global pause active, keeping finished partitions paused"
            );
            return;
        }

        let to_resume: Vec<Partition> = partitions
            .iter()
            .filter(|p| monitor.contains(p))
            .cloned()
            .collect();
        if to_resume.is_empty() {
            return;
        }

        debug!(partitions = ?to_resume, "RESUME partitions");
        if let Err(e) = broker.resume(&to_resume) {
            // entries stay without a processor and are retried on the next cycle
            warn!(error = ?e, "Failed to resume partitions");
            for partition in &to_resume {
                monitor.detach_processor(partition);
            }
            return;
        }
        record_flow_control("resume", "partition", to_resume.len());
        for partition in &to_resume {
            monitor.remove(partition);
        }
    }

    /// Consume pending operator triggers and retry resumes that failed earlier. Called
    /// once per poll cycle.
    pub fn apply_global_triggers<B: BrokerClient + ?Sized>(
        &mut self,
        broker: &mut B,
        monitor: &mut PartitionMonitor,
    ) {
        if self.controls.take_pause() {
            self.pause_all(broker, monitor);
        }
        if self.controls.take_resume() {
            self.globally_paused = false;
            let resumed = self.resume_idle(broker, monitor, "global");
            info!(
                resumed = resumed,
                still_busy = monitor.len(),
                "Global resume applied"
            );
        } else if !self.globally_paused {
            self.resume_idle(broker, monitor, "retry");
        }
    }

    fn pause_all<B: BrokerClient + ?Sized>(
        &mut self,
        broker: &mut B,
        monitor: &mut PartitionMonitor,
    ) {
        let assigned = match broker.assignment() {
            Ok(assigned) => assigned,
            Err(e) => {
                warn!(error = ?e, "Failed to read assignment for global pause");
                return;
            }
        };

        let to_pause: Vec<Partition> = assigned
            .into_iter()
            .filter(|p| !monitor.contains(p))
            .collect();

        if !to_pause.is_empty() {
            if let Err(e) = broker.pause(&to_pause) {
                warn!(error = ?e, "Failed to pause partitions for global pause");
                return;
            }
            let now = Instant::now();
            for partition in &to_pause {
                monitor.record_pause(partition, now, None);
            }
            record_flow_control("pause", "global", to_pause.len());
        }

        self.globally_paused = true;
        info!(
            newly_paused = to_pause.len(),
            total_paused = monitor.len(),
            "Global pause applied"
        );
    }

    /// Resume every paused partition that is not running a batch. Partitions still busy
    /// stay paused until their batch finishes.
    fn resume_idle<B: BrokerClient + ?Sized>(
        &self,
        broker: &mut B,
        monitor: &mut PartitionMonitor,
        scope: &'static str,
    ) -> usize {
        let idle: Vec<Partition> = monitor
            .partitions()
            .into_iter()
            .filter(|p| !monitor.has_processor(p))
            .collect();
        if idle.is_empty() {
            return 0;
        }

        if let Err(e) = broker.resume(&idle) {
            warn!(error = ?e, scope = scope, "Failed to resume idle partitions");
            return 0;
        }
        for partition in &idle {
            monitor.remove(partition);
        }
        record_flow_control("resume", scope, idle.len());
        idle.len()
    }
}

fn record_flow_control(action: &'static str, scope: &'static str, count: usize) {
    metrics::counter!(FLOW_CONTROL_CALLS, "action" => action, "scope" => scope)
        .increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_batch, MockBroker};

    fn p(num: i32) -> Partition {
        Partition::new("topic".to_string(), num)
    }

    fn processor(num: i32) -> Arc<BatchProcessor> {
        Arc::new(BatchProcessor::new(test_batch("topic", num, 0..2)))
    }

    fn assert_coherent(broker: &MockBroker, monitor: &PartitionMonitor) {
        let mut paused = broker.paused();
        paused.sort();
        let mut monitored = monitor.partitions();
        monitored.sort();
        assert_eq!(paused, monitored);
    }

    #[test]
    fn test_pause_and_resume_keep_monitor_in_sync() {
        let mut broker = MockBroker::with_assignment(vec![p(0), p(1)]);
        let mut monitor = PartitionMonitor::new();
        let gate = PartitionGate::new(Arc::new(OperationalControls::new()));

        gate.pause(&mut broker, &mut monitor, &p(0), processor(0));
        assert_coherent(&broker, &monitor);
        assert_eq!(broker.pause_calls(), 1);

        // second pause of the same partition does not reach the broker
        gate.pause(&mut broker, &mut monitor, &p(0), processor(0));
        assert_eq!(broker.pause_calls(), 1);

        gate.resume(&mut broker, &mut monitor, &[p(0)]);
        assert_coherent(&broker, &monitor);
        assert!(monitor.is_empty());
    }

    #[test]
    fn test_resume_ignores_unpaused_partitions() {
        let mut broker = MockBroker::with_assignment(vec![p(0)]);
        let mut monitor = PartitionMonitor::new();
        let gate = PartitionGate::new(Arc::new(OperationalControls::new()));

        gate.resume(&mut broker, &mut monitor, &[p(0)]);
        assert_eq!(broker.resume_calls(), 0);
    }

    #[test]
    fn test_global_pause_holds_finished_partitions() {
        let mut broker = MockBroker::with_assignment(vec![p(0), p(1), p(2)]);
        let mut monitor = PartitionMonitor::new();
        let controls = Arc::new(OperationalControls::new());
        let mut gate = PartitionGate::new(controls.clone());

        gate.pause(&mut broker, &mut monitor, &p(0), processor(0));

        controls.trigger_pausing();
        gate.apply_global_triggers(&mut broker, &mut monitor);
        assert!(gate.is_globally_paused());
        assert_eq!(monitor.len(), 3);
        assert_coherent(&broker, &monitor);

        // the batch on p0 finishes while the override is active
        gate.resume(&mut broker, &mut monitor, &[p(0)]);
        assert_coherent(&broker, &monitor);
        assert!(monitor.contains(&p(0)));
        assert!(!monitor.has_processor(&p(0)));
    }

    #[test]
    fn test_global_resume_leaves_busy_partitions_paused() {
        let mut broker = MockBroker::with_assignment(vec![p(0), p(1)]);
        let mut monitor = PartitionMonitor::new();
        let controls = Arc::new(OperationalControls::new());
        let mut gate = PartitionGate::new(controls.clone());

        controls.trigger_pausing();
        gate.apply_global_triggers(&mut broker, &mut monitor);

        // a batch starts on p1 while everything is paused
        gate.pause(&mut broker, &mut monitor, &p(1), processor(1));
        assert!(monitor.has_processor(&p(1)));

        controls.trigger_resuming();
        gate.apply_global_triggers(&mut broker, &mut monitor);

        assert!(!gate.is_globally_paused());
        assert_eq!(monitor.partitions(), vec![p(1)]);
        assert_coherent(&broker, &monitor);

        gate.resume(&mut broker, &mut monitor, &[p(1)]);
        assert!(monitor.is_empty());
        assert_coherent(&broker, &monitor);
    }

    #[test]
    fn test_triggers_are_consumed_once() {
        let mut broker = MockBroker::with_assignment(vec![p(0)]);
        let mut monitor = PartitionMonitor::new();
        let controls = Arc::new(OperationalControls::new());
        let mut gate = PartitionGate::new(controls.clone());

        controls.trigger_pausing();
        gate.apply_global_triggers(&mut broker, &mut monitor);
        gate.apply_global_triggers(&mut broker, &mut monitor);

        assert_eq!(broker.pause_calls(), 1);
    }
}
