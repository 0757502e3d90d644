// src/pipeline/supervisor.rs - Owns the batch worker and the watchdog as explicit tasks
use anyhow::{anyhow, Context, Result};
use log::{error, info};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::pipeline::orchestrator::PipelineOrchestrator;
use crate::pipeline::watchdog::StallWatchdog;

const QUEUE_CAPACITY: usize = 256;

pub struct PipelineSupervisor {
    orchestrator: Arc<PipelineOrchestrator>,
    watchdog: Arc<StallWatchdog>,
}

/// Handle to a started supervisor. Dropping it without `stop` leaves the tasks running
/// until the runtime shuts down.
pub struct SupervisorHandle {
    queue: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<usize>,
    watchdog: JoinHandle<()>,
}

impl PipelineSupervisor {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, watchdog: Arc<StallWatchdog>) -> Self {
        Self {
            orchestrator,
            watchdog,
        }
    }

    /// Spawns the single batch worker and the watchdog loop.
    pub fn start(self) -> SupervisorHandle {
        let (queue, mut receiver) = mpsc::channel::<String>(QUEUE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let orchestrator = self.orchestrator.clone();
        let worker = tokio::spawn(async move {
            let mut processed = 0usize;
            // Ends once every sender is gone and the queue is drained.
            while let Some(batch_id) = receiver.recv().await {
                match orchestrator.run(&batch_id).await {
                    Ok(outcome) => info!(
                        "Batch {} finished as {} (run {}): {}",
                        batch_id, outcome.status, outcome.run_id, outcome.message
                    ),
                    Err(e) => error!("Batch {} could not be processed: {:#}", batch_id, e),
                }
                processed += 1;
            }
            processed
        });

        let watchdog = self.watchdog.clone();
        let watchdog = tokio::spawn(async move { watchdog.run(shutdown_rx).await });

        info!("Pipeline supervisor started (queue capacity {})", QUEUE_CAPACITY);
        SupervisorHandle {
            queue,
            shutdown,
            worker,
            watchdog,
        }
    }
}

/// Remembers which pending batches were already queued.
///
/// Only ids still in the latest pending listing are kept, so a batch that left `pending` and
/// was later reset to it is queued again.
#[derive(Debug, Default)]
pub struct PendingTracker {
    queued: HashSet<String>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ids in `pending` not queued yet, in listing order.
    pub fn newly_pending<'a, I>(&mut self, pending: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let listed: Vec<&str> = pending.into_iter().collect();
        self.queued.retain(|id| listed.contains(&id.as_str()));
        listed
            .into_iter()
            .filter(|id| self.queued.insert(id.to_string()))
            .map(str::to_string)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

impl SupervisorHandle {
    pub async fn submit(&self, batch_id: &str) -> Result<()> {
        self.queue
            .send(batch_id.to_string())
            .await
            .map_err(|_| anyhow!("batch worker has stopped, cannot submit {}", batch_id))
    }

    /// Closes the queue, lets the worker finish what was already submitted, then stops the
    /// watchdog. Returns how many batches the worker ran.
    pub async fn stop(self) -> Result<usize> {
        let SupervisorHandle {
            queue,
            shutdown,
            worker,
            watchdog,
        } = self;
        drop(queue);
        let processed = worker.await.context("batch worker task failed")?;

        // The watchdog may already have exited if its receiver was dropped.
        let _ = shutdown.send(true);
        watchdog.await.context("watchdog task failed")?;
        info!("Pipeline supervisor stopped after {} batches", processed);
        Ok(processed)
    }
}
