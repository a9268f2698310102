//! Active workflow set, history, and the outcome callbacks the scheduler uses.
//!
//! Lock order is always `active` before the queue's own locks; the history is
//! only written while `active` is held, so a workflow is always visible in
//! exactly one of the two.

use quill_abstraction::Parameters;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestrationError, Result};
use crate::events::{EventBus, WorkflowEvent};
use crate::instance::{Advance, WorkflowInstance, WorkflowResults, WorkflowStatus, WorkflowStatusReport};
use crate::metrics::WorkflowMetrics;
use crate::queue::{Task, TaskQueue};
use crate::retry::RetryPolicy;
use crate::template::TemplateCatalog;

/// Fallback backoff horizon when `now + delay` does not fit in an `Instant`.
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Finished workflows, append-only.
#[derive(Debug, Default)]
struct History {
    entries: Vec<Arc<WorkflowInstance>>,
    index: HashMap<String, usize>,
}

impl History {
    fn push(&mut self, instance: WorkflowInstance) {
        self.index.insert(instance.id().to_string(), self.entries.len());
        self.entries.push(Arc::new(instance));
    }

    fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowInstance>> {
        self.index.get(workflow_id).map(|i| Arc::clone(&self.entries[*i]))
    }
}

/// Owns workflow instances from creation until they are archived.
pub struct WorkflowManager {
    catalog: Arc<TemplateCatalog>,
    active: Mutex<HashMap<String, WorkflowInstance>>,
    history: RwLock<History>,
    queue: Arc<TaskQueue>,
    metrics: Arc<WorkflowMetrics>,
    events: EventBus,
    retry: RetryPolicy,
}

impl fmt::Debug for WorkflowManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowManager")
            .field("active_count", &self.active.try_lock().map(|a| a.len()).unwrap_or(0))
            .field("history_count", &self.history.try_read().map(|h| h.entries.len()).unwrap_or(0))
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl WorkflowManager {
    /// Creates a manager dispatching into `queue`.
    #[must_use]
    pub fn new(
        catalog: Arc<TemplateCatalog>,
        queue: Arc<TaskQueue>,
        metrics: Arc<WorkflowMetrics>,
        events: EventBus,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            catalog,
            active: Mutex::new(HashMap::new()),
            history: RwLock::new(History::default()),
            queue,
            metrics,
            events,
            retry,
        }
    }

    /// Retry policy applied to failed attempts.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Creates a pending instance of a catalog template.
    pub async fn create_instance(
        &self,
        template_name: &str,
        context_id: &str,
        parameters: Parameters,
    ) -> Result<String> {
        let template = self
            .catalog
            .get(template_name)
            .await
            .ok_or_else(|| OrchestrationError::UnknownTemplate(template_name.to_string()))?;

        let instance = WorkflowInstance::new(template, context_id, parameters);
        let workflow_id = instance.id().to_string();
        info!(workflow_id = %workflow_id, template = %template_name, context_id = %context_id, "Created workflow");

        self.active.lock().await.insert(workflow_id.clone(), instance);
        self.metrics.record_created().await;
        Ok(workflow_id)
    }

    /// Error for an action on a workflow that is not active.
    async fn not_active(&self, workflow_id: &str, action: &'static str) -> OrchestrationError {
        match self.history.read().await.get(workflow_id) {
            Some(archived) => OrchestrationError::InvalidTransition {
                workflow_id: workflow_id.to_string(),
                from: archived.status(),
                action,
            },
            None => OrchestrationError::UnknownWorkflow(workflow_id.to_string()),
        }
    }

    /// `Pending -> Running` and dispatch of the first ready step.
    pub async fn start(&self, workflow_id: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(instance) = active.get_mut(workflow_id) else {
            drop(active);
            return Err(self.not_active(workflow_id, "start").await);
        };
        instance.start()?;
        info!(workflow_id = %workflow_id, template = %instance.template().name, "Started workflow");
        self.drive(&mut active, workflow_id).await;
        Ok(())
    }

    /// Cancels a workflow; queued tasks are dropped and in-flight outcomes will be discarded.
    pub async fn cancel(&self, workflow_id: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(instance) = active.get_mut(workflow_id) else {
            drop(active);
            return Err(self.not_active(workflow_id, "cancel").await);
        };
        instance.cancel()?;
        let dropped = self.queue.take_workflow(workflow_id).await;
        info!(workflow_id = %workflow_id, dropped_tasks = dropped.len(), "Cancelled workflow");
        if let Some(instance) = active.remove(workflow_id) {
            self.archive(instance).await;
        }
        Ok(())
    }

    /// `Running -> Paused`; a queued task of the workflow is parked.
    pub async fn pause(&self, workflow_id: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(instance) = active.get_mut(workflow_id) else {
            drop(active);
            return Err(self.not_active(workflow_id, "pause").await);
        };
        instance.pause()?;
        for task in self.queue.take_workflow(workflow_id).await {
            debug!(workflow_id = %workflow_id, step_id = %task.step_id, "Parking queued task");
            instance.park(task);
        }
        info!(workflow_id = %workflow_id, "Paused workflow");
        Ok(())
    }

    /// `Paused -> Running`; parked work is re-enqueued or the next step dispatched.
    pub async fn resume(&self, workflow_id: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(instance) = active.get_mut(workflow_id) else {
            drop(active);
            return Err(self.not_active(workflow_id, "resume").await);
        };
        let parked = instance.resume()?;
        info!(workflow_id = %workflow_id, "Resumed workflow");
        match parked {
            Some(task) => self.queue.enqueue(task).await,
            None => self.drive(&mut active, workflow_id).await,
        }
        Ok(())
    }

    /// Creates a pending workflow that re-runs only the missing steps of a failed or cancelled one.
    pub async fn relaunch(&self, workflow_id: &str) -> Result<String> {
        let mut active = self.active.lock().await;
        let next = match active.get(workflow_id) {
            Some(instance) => instance.relaunch()?,
            None => {
                let archived = self.history.read().await.get(workflow_id);
                archived
                    .ok_or_else(|| OrchestrationError::UnknownWorkflow(workflow_id.to_string()))?
                    .relaunch()?
            }
        };
        let next_id = next.id().to_string();
        info!(
            workflow_id = %next_id,
            relaunched_from = %workflow_id,
            completed_steps = next.completed_steps().len(),
            "Relaunched workflow"
        );
        active.insert(next_id.clone(), next);
        drop(active);
        self.metrics.record_created().await;
        Ok(next_id)
    }

    /// Status of an active or archived workflow.
    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowStatusReport> {
        if let Some(instance) = self.active.lock().await.get(workflow_id) {
            return Ok(instance.status_report());
        }
        self.history
            .read()
            .await
            .get(workflow_id)
            .map(|instance| instance.status_report())
            .ok_or_else(|| OrchestrationError::UnknownWorkflow(workflow_id.to_string()))
    }

    /// Results of an active or archived workflow.
    pub async fn results(&self, workflow_id: &str) -> Result<WorkflowResults> {
        if let Some(instance) = self.active.lock().await.get(workflow_id) {
            return Ok(instance.results_report());
        }
        self.history
            .read()
            .await
            .get(workflow_id)
            .map(|instance| instance.results_report())
            .ok_or_else(|| OrchestrationError::UnknownWorkflow(workflow_id.to_string()))
    }

    /// Status reports of all active workflows.
    pub async fn active_workflows(&self) -> Vec<WorkflowStatusReport> {
        let mut reports: Vec<_> = self.active.lock().await.values().map(WorkflowInstance::status_report).collect();
        reports.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        reports
    }

    /// Status reports of archived workflows, oldest first.
    pub async fn history(&self) -> Vec<WorkflowStatusReport> {
        self.history.read().await.entries.iter().map(|i| i.status_report()).collect()
    }

    /// Waits until a workflow reaches a terminal status.
    pub async fn wait_for_completion(&self, workflow_id: &str, timeout: Duration) -> Result<WorkflowStatusReport> {
        let mut events = self.events.subscribe();
        let wait = async {
            loop {
                let report = self.status(workflow_id).await?;
                if report.status.is_terminal() {
                    return Ok::<_, OrchestrationError>(report);
                }
                loop {
                    match events.recv().await {
                        Ok(WorkflowEvent::WorkflowFinished { workflow_id: finished, .. })
                            if finished == workflow_id =>
                        {
                            break;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(workflow_id = %workflow_id, skipped, "Event receiver lagged");
                            break;
                        }
                        Err(RecvError::Closed) => return self.status(workflow_id).await,
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| OrchestrationError::WaitTimeout(timeout, workflow_id.to_string()))?
    }

    /// Called by the scheduler before invoking a dequeued task's capability.
    ///
    /// Returns `false` if the task must not run: the workflow is gone, or it is
    /// paused (the task is parked on it).
    pub async fn begin_task(&self, task: &Task) -> bool {
        let mut active = self.active.lock().await;
        let Some(instance) = active.get_mut(&task.workflow_id) else {
            debug!(workflow_id = %task.workflow_id, step_id = %task.step_id, "Dropping task of inactive workflow");
            return false;
        };
        if !instance.is_in_flight(&task.step_id) {
            debug!(workflow_id = %task.workflow_id, step_id = %task.step_id, "Dropping stale task");
            return false;
        }
        if instance.status() == WorkflowStatus::Paused {
            debug!(workflow_id = %task.workflow_id, step_id = %task.step_id, "Parking task of paused workflow");
            instance.park(task.clone());
            return false;
        }
        self.events.publish(WorkflowEvent::StepDispatched {
            workflow_id: task.workflow_id.clone(),
            step_id: task.step_id.clone(),
            attempt: task.attempt(),
        });
        true
    }

    /// Applies a successful attempt.
    pub async fn complete_task(&self, task: &Task, result: Value, elapsed: Duration) {
        let mut active = self.active.lock().await;
        let Some(instance) = active.get_mut(&task.workflow_id) else {
            debug!(workflow_id = %task.workflow_id, step_id = %task.step_id, "Discarding result of inactive workflow");
            return;
        };
        if !instance.is_in_flight(&task.step_id) {
            debug!(workflow_id = %task.workflow_id, step_id = %task.step_id, "Discarding stale result");
            return;
        }

        instance.record_success(&task.step_id, result, elapsed);
        let progress = instance.progress();
        info!(
            workflow_id = %task.workflow_id,
            step_id = %task.step_id,
            progress = progress,
            elapsed_ms = elapsed.as_millis(),
            "Step completed"
        );
        self.events.publish(WorkflowEvent::StepCompleted {
            workflow_id: task.workflow_id.clone(),
            step_id: task.step_id.clone(),
            progress,
        });
        self.drive(&mut active, &task.workflow_id).await;
    }

    /// Applies a failed attempt: requeue with backoff, or fail the step permanently.
    pub async fn fail_task(&self, mut task: Task, failure: &OrchestrationError) {
        let mut active = self.active.lock().await;
        let Some(instance) = active.get_mut(&task.workflow_id) else {
            debug!(workflow_id = %task.workflow_id, step_id = %task.step_id, "Discarding failure of inactive workflow");
            return;
        };
        if !instance.is_in_flight(&task.step_id) {
            debug!(workflow_id = %task.workflow_id, step_id = %task.step_id, "Discarding stale failure");
            return;
        }

        let attempt = task.attempt();
        let message = failure.to_string();
        let terminal = !self.retry.should_retry(attempt);
        instance.record_failure(&task.step_id, message.clone(), attempt, terminal);

        if terminal {
            error!(
                workflow_id = %task.workflow_id,
                step_id = %task.step_id,
                attempts = attempt,
                error = %message,
                "Step failed permanently"
            );
            self.events.publish(WorkflowEvent::StepFailed {
                workflow_id: task.workflow_id.clone(),
                step_id: task.step_id.clone(),
                error: message,
            });
            let workflow_id = task.workflow_id;
            self.drive(&mut active, &workflow_id).await;
            return;
        }

        let delay = self.retry.delay_for(task.retry_count);
        task.retry_count += 1;
        let now = Instant::now();
        task.not_before = Some(now.checked_add(delay).unwrap_or(now + MAX_BACKOFF));
        warn!(
            workflow_id = %task.workflow_id,
            step_id = %task.step_id,
            attempt = attempt,
            delay_ms = delay.as_millis(),
            error = %message,
            "Step failed, retrying"
        );
        self.events.publish(WorkflowEvent::StepRetrying {
            workflow_id: task.workflow_id.clone(),
            step_id: task.step_id.clone(),
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error: message,
        });

        if instance.status() == WorkflowStatus::Paused {
            instance.park(task);
        } else {
            self.queue.enqueue(task).await;
        }
    }

    /// Turns the instance's next move into queue traffic or archival.
    async fn drive(&self, active: &mut HashMap<String, WorkflowInstance>, workflow_id: &str) {
        let Some(instance) = active.get_mut(workflow_id) else {
            return;
        };
        match instance.advance() {
            Advance::Dispatch(task) => {
                debug!(workflow_id = %workflow_id, step_id = %task.step_id, capability = %task.capability, "Dispatching step");
                self.queue.enqueue(task).await;
            }
            Advance::Idle => {}
            Advance::Finished(_) => {
                if let Some(instance) = active.remove(workflow_id) {
                    self.archive(instance).await;
                }
            }
        }
    }

    async fn archive(&self, instance: WorkflowInstance) {
        let status = instance.status();
        match status {
            WorkflowStatus::Failed => error!(
                workflow_id = %instance.id(),
                failed_steps = ?instance.failed_steps(),
                "Workflow failed"
            ),
            _ => info!(workflow_id = %instance.id(), status = %status, "Workflow finished"),
        }
        self.metrics.record_finished(status, instance.execution_time()).await;
        self.events.publish(WorkflowEvent::WorkflowFinished { workflow_id: instance.id().to_string(), status });
        self.history.write().await.push(instance);
    }
}
