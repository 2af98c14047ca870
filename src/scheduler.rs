//! Poll scheduler.
//!
//! Tracks when every (device, metric) pair is next due and dispatches poll
//! requests at the right cadence. One entry per live pair sits in a
//! min-priority queue ordered by due time; a fixed tick drains everything
//! that has come due, dispatches it and reinserts it one interval later.
//! Provisioning events admit new pairs at runtime without a restart.
//!
//! The whole structure is owned by a single task: tick processing and
//! admission are serialized on one `select!` loop, so no lock guards the
//! queue and the two can never race. The tick path performs no I/O; dispatch
//! is a bounded-channel `try_send` and a failed send leaves the task
//! rescheduled rather than starved.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::registry::{DeviceType, EntityId, Registry};

/// Default tick between due-time sweeps.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Capacity of the provisioning event channel.
pub const EVENT_CAPACITY: usize = 64;

/// Notification that a device's full metric set has been durably stored and
/// the device may be admitted for polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionEvent {
    pub device_id: EntityId,
}

/// A dispatched poll request, consumed by the executor.
///
/// Carries ids plus the address snapshot the executor needs; credential
/// resolution happens on the executor side so that profiles are snapshotted
/// as late as possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    pub device_id: EntityId,
    pub metric_id: EntityId,
    pub ip: String,
    pub port: u16,
    pub device_type: DeviceType,
    /// Metric group name, e.g. `"Linux.CPU"`.
    pub group: String,
    pub profile_id: EntityId,
    /// Dispatch time; travels with the result to the sink.
    pub timestamp: DateTime<Utc>,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick between due-time sweeps.
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick: DEFAULT_TICK }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PollTask {
    due: DateTime<Utc>,
    device_id: EntityId,
    metric_id: EntityId,
}

impl Ord for PollTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.device_id.cmp(&other.device_id))
            .then_with(|| self.metric_id.cmp(&other.metric_id))
    }
}

impl PartialOrd for PollTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Poll intervals are second-granularity; convert for due-time arithmetic.
fn interval_delta(interval: Duration) -> chrono::Duration {
    chrono::Duration::seconds(interval.as_secs().min(i64::MAX as u64) as i64)
}

/// Priority-queue scheduler over poll tasks.
pub struct Scheduler {
    registry: Arc<Registry>,
    dispatch: mpsc::Sender<PollRequest>,
    events: mpsc::Receiver<ProvisionEvent>,
    tick: Duration,
    queue: BinaryHeap<Reverse<PollTask>>,
    live: HashSet<(EntityId, EntityId)>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.live.len())
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        dispatch: mpsc::Sender<PollRequest>,
        events: mpsc::Receiver<ProvisionEvent>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            dispatch,
            events,
            tick: config.tick,
            queue: BinaryHeap::new(),
            live: HashSet::new(),
        }
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> usize {
        self.live.len()
    }

    /// Admit one task per metric definition already in the registry.
    ///
    /// Called once at startup, after the registry load. A metric polled
    /// before is due one interval after its last poll; one never polled is
    /// due one interval from now.
    pub fn admit_existing(&mut self, now: DateTime<Utc>) {
        let mut admitted = 0usize;
        for metric in self.registry.metrics() {
            let delta = interval_delta(metric.interval);
            let due = match metric.last_polled {
                Some(last) => last + delta,
                None => now + delta,
            };
            if self.admit(metric.device_id, metric.id, due) {
                admitted += 1;
            }
        }
        tracing::info!(admitted, "Existing metric definitions admitted");
    }

    /// Run the scheduling timeline until the provisioning side closes.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(tick = ?self.tick, tasks = self.live.len(), "Scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.process_due(Utc::now()),
                event = self.events.recv() => match event {
                    Some(event) => self.on_provisioned(event, Utc::now()),
                    None => {
                        tracing::info!("Provision channel closed, scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Admit a task unless its pair is already live. Returns whether a new
    /// task was inserted; duplicate admission is a no-op by construction.
    fn admit(&mut self, device_id: EntityId, metric_id: EntityId, due: DateTime<Utc>) -> bool {
        if !self.live.insert((device_id, metric_id)) {
            tracing::debug!(device_id, metric_id, "Pair already scheduled, admission skipped");
            return false;
        }
        self.queue.push(Reverse(PollTask {
            due,
            device_id,
            metric_id,
        }));
        true
    }

    /// Admit every metric of a freshly provisioned device, each first due one
    /// full interval from now so provisioning never triggers an immediate
    /// burst of polls.
    fn on_provisioned(&mut self, event: ProvisionEvent, now: DateTime<Utc>) {
        let metrics = self.registry.metrics_for_device(event.device_id);
        if metrics.is_empty() {
            tracing::warn!(device_id = event.device_id, "Provisioned device has no metrics");
            return;
        }

        let mut admitted = 0usize;
        for metric in metrics {
            if self.admit(event.device_id, metric.id, now + interval_delta(metric.interval)) {
                admitted += 1;
            }
        }
        tracing::info!(device_id = event.device_id, admitted, "Device admitted for polling");
    }

    /// Dispatch every task whose due time has passed and reschedule it.
    ///
    /// Tasks come off the heap in ascending due order; entries not yet due
    /// are never popped. The interval is re-read from the registry at each
    /// reschedule so interval edits take effect on the next cycle. A task
    /// whose device or metric has vanished is retired.
    fn process_due(&mut self, now: DateTime<Utc>) {
        while self
            .queue
            .peek()
            .is_some_and(|Reverse(task)| task.due <= now)
        {
            let Some(Reverse(task)) = self.queue.pop() else {
                break;
            };

            let Ok(metric) = self.registry.metric(task.metric_id) else {
                self.retire(&task, "metric removed");
                continue;
            };
            let Ok(device) = self.registry.device(task.device_id) else {
                self.retire(&task, "device removed");
                continue;
            };

            let request = PollRequest {
                device_id: device.id,
                metric_id: metric.id,
                ip: device.ip.clone(),
                port: device.port,
                device_type: device.device_type,
                group: metric.group.clone(),
                profile_id: device.profile_id,
                timestamp: now,
            };

            if let Err(e) = self.dispatch.try_send(request) {
                // Scheduling never starves on a bad dispatch; the pair just
                // waits for its next due time.
                tracing::warn!(
                    device_id = device.id,
                    metric_id = metric.id,
                    error = %e,
                    "Poll dispatch failed, task rescheduled"
                );
            } else {
                tracing::debug!(
                    ip = %device.ip,
                    group = %metric.group,
                    "Poll dispatched"
                );
            }

            self.registry.record_poll(metric.id, now);
            self.queue.push(Reverse(PollTask {
                due: now + interval_delta(metric.interval),
                ..task
            }));
        }
    }

    fn retire(&mut self, task: &PollTask, reason: &str) {
        self.live.remove(&(task.device_id, task.metric_id));
        tracing::warn!(
            device_id = task.device_id,
            metric_id = task.metric_id,
            reason,
            "Poll task retired"
        );
    }
}
