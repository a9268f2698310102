//! Workflow orchestration engine for Quill.
//!
//! Turns declarative workflow templates (steps plus a dependency graph) into
//! running executions: ready steps are queued by priority, dispatched to
//! registered capabilities by a bounded scheduler, retried with exponential
//! backoff on failure, and finalized as completed or failed.

pub mod error;
pub mod events;
pub mod instance;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod template;

use quill_abstraction::{Capability, Parameters};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};

pub use error::{OrchestrationError, Result};
pub use events::{EventBus, WorkflowEvent};
pub use instance::{StepError, WorkflowInstance, WorkflowResults, WorkflowStatus, WorkflowStatusReport};
pub use manager::WorkflowManager;
pub use metrics::{CapabilityUsage, MetricsSnapshot, WorkflowMetrics};
pub use queue::{QueueMetrics, Task, TaskQueue, TaskStatus};
pub use registry::{CapabilityMetadata, CapabilityRegistry};
pub use retry::RetryPolicy;
pub use scheduler::{MIN_POLL_INTERVAL, Scheduler, SchedulerConfig};
pub use template::{
    NOVEL_CONTINUATION, NOVEL_CREATION, Priority, StepSpec, TemplateCatalog, TemplateError, WorkflowTemplate,
};

/// Orchestrator configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Retry policy for failed steps.
    pub retry: RetryPolicy,
}

/// Entry point tying the catalog, registry, queue, manager, and scheduler together.
#[derive(Debug)]
pub struct Orchestrator {
    /// Workflow templates.
    catalog: Arc<TemplateCatalog>,
    /// Registered capabilities.
    registry: Arc<CapabilityRegistry>,
    /// Pending and running tasks.
    queue: Arc<TaskQueue>,
    /// Workflow and capability counters.
    metrics: Arc<WorkflowMetrics>,
    /// Active workflows and history.
    manager: Arc<WorkflowManager>,
    /// Event stream.
    events: EventBus,
    /// Background dispatch loop.
    scheduler: Mutex<Scheduler>,
}

impl Orchestrator {
    /// Creates an orchestrator with the built-in templates.
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_catalog(config, TemplateCatalog::with_builtin())
    }

    /// Creates an orchestrator over the given catalog.
    #[must_use]
    pub fn with_catalog(config: OrchestratorConfig, catalog: TemplateCatalog) -> Self {
        let catalog = Arc::new(catalog);
        let registry = Arc::new(CapabilityRegistry::new());
        let queue = Arc::new(TaskQueue::new());
        let metrics = Arc::new(WorkflowMetrics::new());
        let events = EventBus::default();
        let manager = Arc::new(WorkflowManager::new(
            Arc::clone(&catalog),
            Arc::clone(&queue),
            Arc::clone(&metrics),
            events.clone(),
            config.retry,
        ));
        let scheduler = Scheduler::new(
            config.scheduler,
            Arc::clone(&registry),
            Arc::clone(&manager),
            Arc::clone(&queue),
            Arc::clone(&metrics),
        );

        Self { catalog, registry, queue, metrics, manager, events, scheduler: Mutex::new(scheduler) }
    }

    /// Starts the background scheduler.
    pub async fn start_scheduler(&self) -> Result<()> {
        self.scheduler.lock().await.start()
    }

    /// Stops the background scheduler.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.lock().await.stop().await
    }

    /// Checks if the scheduler is running.
    pub async fn is_scheduler_running(&self) -> bool {
        self.scheduler.lock().await.is_running()
    }

    /// Registers a capability under `name`. The last registration for a name wins.
    ///
    /// # Returns
    /// Returns `true` if the name was newly registered.
    pub async fn register_capability(
        &self,
        name: impl Into<String>,
        capability: Arc<dyn Capability>,
        tags: Vec<String>,
    ) -> bool {
        self.registry.register(name, capability, tags).await
    }

    /// The capability registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Validates and registers a template. Running instances keep their snapshot.
    pub async fn register_template(&self, template: WorkflowTemplate) -> Result<bool> {
        Ok(self.catalog.register(template).await?)
    }

    /// The template catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<TemplateCatalog> {
        &self.catalog
    }

    /// Creates a pending workflow instance.
    ///
    /// # Errors
    /// Returns `UnknownTemplate` if no template has this name.
    pub async fn create_instance(
        &self,
        template_name: &str,
        context_id: &str,
        parameters: Parameters,
    ) -> Result<String> {
        self.manager.create_instance(template_name, context_id, parameters).await
    }

    /// Starts a pending workflow.
    pub async fn start(&self, workflow_id: &str) -> Result<()> {
        self.manager.start(workflow_id).await
    }

    /// Cancels a pending, running, or paused workflow.
    pub async fn cancel(&self, workflow_id: &str) -> Result<()> {
        self.manager.cancel(workflow_id).await
    }

    /// Pauses a running workflow.
    pub async fn pause(&self, workflow_id: &str) -> Result<()> {
        self.manager.pause(workflow_id).await
    }

    /// Resumes a paused workflow.
    pub async fn resume(&self, workflow_id: &str) -> Result<()> {
        self.manager.resume(workflow_id).await
    }

    /// Creates a pending copy of a failed or cancelled workflow that only runs its missing steps.
    pub async fn relaunch(&self, workflow_id: &str) -> Result<String> {
        self.manager.relaunch(workflow_id).await
    }

    /// Status of a workflow.
    pub async fn get_status(&self, workflow_id: &str) -> Result<WorkflowStatusReport> {
        self.manager.status(workflow_id).await
    }

    /// Results of a workflow.
    pub async fn get_results(&self, workflow_id: &str) -> Result<WorkflowResults> {
        self.manager.results(workflow_id).await
    }

    /// Waits until a workflow is completed, failed, or cancelled.
    pub async fn wait_for_completion(
        &self,
        workflow_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowStatusReport> {
        self.manager.wait_for_completion(workflow_id, timeout).await
    }

    /// Creates, starts, and awaits a workflow, returning its results whatever the outcome.
    pub async fn run(
        &self,
        template_name: &str,
        context_id: &str,
        parameters: Parameters,
        timeout: Duration,
    ) -> Result<WorkflowResults> {
        let workflow_id = self.create_instance(template_name, context_id, parameters).await?;
        self.start(&workflow_id).await?;
        self.wait_for_completion(&workflow_id, timeout).await?;
        self.get_results(&workflow_id).await
    }

    /// Subscribes to workflow events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Snapshot of workflow and capability counters.
    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot().await
    }

    /// Queue depth and running task counts.
    pub async fn queue_metrics(&self) -> QueueMetrics {
        self.queue.metrics().await
    }

    /// Active workflows, oldest first.
    pub async fn active_workflows(&self) -> Vec<WorkflowStatusReport> {
        self.manager.active_workflows().await
    }

    /// Finished workflows, oldest first.
    pub async fn history(&self) -> Vec<WorkflowStatusReport> {
        self.manager.history().await
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let orchestrator = Orchestrator::default();
        assert_eq!(orchestrator.catalog().count().await, 2);
        assert_eq!(orchestrator.registry().count().await, 0);
        assert!(!orchestrator.is_scheduler_running().await);
    }

    #[tokio::test]
    async fn test_scheduler_start_stop() {
        let orchestrator = Orchestrator::default();
        orchestrator.start_scheduler().await.unwrap();
        assert!(orchestrator.is_scheduler_running().await);
        assert!(matches!(orchestrator.start_scheduler().await, Err(OrchestrationError::SchedulerAlreadyRunning)));

        orchestrator.shutdown().await.unwrap();
        assert!(!orchestrator.is_scheduler_running().await);
        assert!(matches!(orchestrator.shutdown().await, Err(OrchestrationError::SchedulerNotRunning)));
    }

    #[tokio::test]
    async fn test_register_invalid_template() {
        let orchestrator = Orchestrator::default();
        let err = orchestrator.register_template(WorkflowTemplate::new("empty", "")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidTemplate(TemplateError::Empty(_))));
    }
}
