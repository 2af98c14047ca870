//! Poll executor.
//!
//! Turns dispatched poll requests into bounded-concurrency executions of the
//! probing program. The consuming loop itself never blocks on a subprocess:
//! each request takes a permit from the polling pool and runs on its own
//! task, so a slow device holds one worker, not the pipeline.
//!
//! Failure philosophy: a timed-out or failed poll is an observation about
//! the device, not about the executor: it is logged, nothing is emitted
//! downstream, and the scheduler retries at the next due time. Only the
//! successful path produces a side effect: one [`PollResult`] to the sink.

pub mod plugin;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};

use crate::registry::Registry;
use crate::scheduler::PollRequest;
use crate::sink::PollResult;
use plugin::{Plugin, PluginError, PollPayload};

/// Default polling pool size.
pub const DEFAULT_WORKERS: usize = 20;

/// Default capacity of the request channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Polling pool size, independent of the discovery pool.
    pub workers: usize,

    /// Capacity of the request channel between scheduler and executor.
    pub queue_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Bounded-concurrency executor of poll requests.
pub struct PollExecutor {
    registry: Arc<Registry>,
    plugin: Plugin,
    results: mpsc::Sender<PollResult>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for PollExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollExecutor")
            .field("available_workers", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl PollExecutor {
    pub fn new(
        registry: Arc<Registry>,
        plugin: Plugin,
        results: mpsc::Sender<PollResult>,
        workers: usize,
    ) -> Self {
        Self {
            registry,
            plugin,
            results,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Consume poll requests until the scheduler side closes.
    ///
    /// A request referencing a missing credential profile is a caller logic
    /// error: it is logged and dropped here; the scheduler has already
    /// rescheduled the pair, so polling resumes once the profile exists.
    pub async fn run(self, mut requests: mpsc::Receiver<PollRequest>) {
        tracing::info!(
            workers = self.permits.available_permits(),
            "Poll executor started"
        );

        while let Some(request) = requests.recv().await {
            let profile = match self.registry.credential(request.profile_id) {
                Ok(profile) => profile,
                Err(e) => {
                    tracing::warn!(
                        ip = %request.ip,
                        profile_id = request.profile_id,
                        error = %e,
                        "Credential profile missing, poll dropped"
                    );
                    continue;
                }
            };

            // Snapshot before handing off: the payload owns its credential
            // copy, so profile updates never reach in-flight work.
            let payload = PollPayload::new(&request, profile);

            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let plugin = self.plugin.clone();
            let results = self.results.clone();
            tokio::spawn(async move {
                let _permit = permit;
                execute(plugin, payload, request, results).await;
            });
        }

        tracing::info!("Request channel closed, poll executor stopping");
    }
}

/// One poll execution: invoke the program, emit the result on success.
async fn execute(
    plugin: Plugin,
    payload: PollPayload,
    request: PollRequest,
    results: mpsc::Sender<PollResult>,
) {
    match plugin.poll(&payload).await {
        Ok(metrics) => {
            let result = PollResult {
                ip: request.ip,
                timestamp: request.timestamp,
                metrics,
            };
            if let Err(e) = results.try_send(result) {
                tracing::warn!(error = %e, "Result sink unavailable, poll result dropped");
            }
        }
        Err(PluginError::Timeout) => {
            tracing::warn!(ip = %request.ip, group = %request.group, "Poll timed out");
        }
        Err(e) => {
            tracing::warn!(ip = %request.ip, group = %request.group, error = %e, "Poll failed");
        }
    }
}
