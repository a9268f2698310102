//! Background scheduler.
//!
//! One loop owns dispatch: it pulls the highest-priority due task from the
//! queue, hands it to a spawned worker bounded by a semaphore, and goes back
//! to sleep until the queue changes, a backoff expires, or the poll interval
//! elapses. Workers feed outcomes back through the [`WorkflowManager`].

use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{OrchestrationError, Result};
use crate::manager::WorkflowManager;
use crate::metrics::WorkflowMetrics;
use crate::queue::{Task, TaskQueue};
use crate::registry::CapabilityRegistry;

/// Lower bound of the poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of capability invocations running at once.
    pub max_concurrent_tasks: usize,
    /// Timeout for a single capability invocation.
    pub task_timeout: Duration,
    /// Interval for re-checking the queue when nothing wakes the loop.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            task_timeout: Duration::from_secs(30),
            poll_interval: MIN_POLL_INTERVAL,
        }
    }
}

impl SchedulerConfig {
    /// Returns the config with the poll interval raised to the minimum and at least one worker.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.poll_interval = self.poll_interval.max(MIN_POLL_INTERVAL);
        self.max_concurrent_tasks = self.max_concurrent_tasks.max(1);
        self
    }
}

/// Everything a dispatch worker needs.
struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    manager: Arc<WorkflowManager>,
    queue: Arc<TaskQueue>,
    metrics: Arc<WorkflowMetrics>,
    task_timeout: Duration,
}

impl Dispatcher {
    async fn run(&self, task: Task) {
        if !self.manager.begin_task(&task).await {
            self.queue.release(&task.id).await;
            return;
        }

        debug!(
            task_id = %task.id,
            workflow_id = %task.workflow_id,
            step_id = %task.step_id,
            capability = %task.capability,
            attempt = task.attempt(),
            "Processing task"
        );

        let started = Instant::now();
        let outcome = self.invoke(&task).await;
        let elapsed = started.elapsed();

        // The attempt is over before its outcome is applied, so a requeued retry never overlaps it.
        self.queue.mark_finished(&task.id).await;

        match outcome {
            Ok(value) => {
                self.metrics.record_call(&task.capability, true, elapsed).await;
                self.manager.complete_task(&task, value, elapsed).await;
            }
            Err(failure) => {
                if matches!(failure, OrchestrationError::CapabilityNotRegistered(_)) {
                    error!(task_id = %task.id, capability = %task.capability, "Capability not found");
                } else {
                    self.metrics.record_call(&task.capability, false, elapsed).await;
                }
                self.manager.fail_task(task, &failure).await;
            }
        }
    }

    /// Looks up and invokes the capability, mapping errors, timeouts, and panics to failures.
    async fn invoke(&self, task: &Task) -> Result<serde_json::Value> {
        let Some(capability) = self.registry.get(&task.capability).await else {
            return Err(OrchestrationError::CapabilityNotRegistered(task.capability.clone()));
        };

        let execution = AssertUnwindSafe(capability.execute(&task.step_id, &task.parameters)).catch_unwind();
        match time::timeout(self.task_timeout, execution).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(source))) => {
                Err(OrchestrationError::CapabilityInvocation { capability: task.capability.clone(), source })
            }
            Ok(Err(payload)) => Err(OrchestrationError::CapabilityPanicked {
                capability: task.capability.clone(),
                message: panic_message(payload.as_ref()),
            }),
            Err(_) => Err(OrchestrationError::CapabilityTimeout {
                capability: task.capability.clone(),
                timeout: self.task_timeout,
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Dispatch loop over a [`TaskQueue`].
pub struct Scheduler {
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    registry: Arc<CapabilityRegistry>,
    manager: Arc<WorkflowManager>,
    queue: Arc<TaskQueue>,
    metrics: Arc<WorkflowMetrics>,
    shutdown: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a stopped scheduler.
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<CapabilityRegistry>,
        manager: Arc<WorkflowManager>,
        queue: Arc<TaskQueue>,
        metrics: Arc<WorkflowMetrics>,
    ) -> Self {
        let config = config.normalized();
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            registry,
            manager,
            queue,
            metrics,
            shutdown: None,
            handle: None,
        }
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Whether the loop has been started and not stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|token| !token.is_cancelled())
    }

    /// Starts the dispatch loop in a background task.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(OrchestrationError::SchedulerAlreadyRunning);
        }

        let token = CancellationToken::new();
        self.shutdown = Some(token.clone());

        let config = self.config;
        let semaphore = Arc::clone(&self.semaphore);
        let queue = Arc::clone(&self.queue);
        let dispatcher = Arc::new(Dispatcher {
            registry: Arc::clone(&self.registry),
            manager: Arc::clone(&self.manager),
            queue: Arc::clone(&self.queue),
            metrics: Arc::clone(&self.metrics),
            task_timeout: config.task_timeout,
        });

        self.handle = Some(tokio::spawn(async move {
            info!(
                max_concurrent_tasks = config.max_concurrent_tasks,
                poll_interval_ms = config.poll_interval.as_millis(),
                "Scheduler started"
            );

            loop {
                // Dispatch as long as there is a free worker and a due task.
                while let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() {
                    let Some(task) = queue.dequeue_ready(Instant::now()).await else {
                        drop(permit);
                        break;
                    };
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        let _permit = permit;
                        dispatcher.run(task).await;
                    });
                }

                let now = Instant::now();
                let wake_at = queue
                    .next_due(now)
                    .await
                    .map_or(now + config.poll_interval, |due| due.min(now + config.poll_interval));

                tokio::select! {
                    () = token.cancelled() => {
                        info!("Scheduler shutdown signal received");
                        break;
                    }
                    () = queue.notified() => {}
                    () = time::sleep_until(wake_at) => {}
                }
            }
        }));
        Ok(())
    }

    /// Stops the loop. Workers already running finish their current attempt.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(token) = self.shutdown.take() else {
            return Err(OrchestrationError::SchedulerNotRunning);
        };
        token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler loop terminated abnormally");
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(token) = self.shutdown.take() {
            token.cancel();
        }
    }
}
