//! Workflow instance state machine.
//!
//! A [`WorkflowInstance`] is one execution of a template against a project. It
//! owns its status, results and failure log, decides which step is ready next,
//! and records step outcomes. It never touches the queue itself: the manager
//! turns the [`Advance`] it returns into queue operations.

use chrono::{DateTime, Utc};
use quill_abstraction::Parameters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{OrchestrationError, Result};
use crate::queue::Task;
use crate::template::{StepSpec, WorkflowTemplate};

/// Parameter key carrying the workflow id into every task.
pub const WORKFLOW_ID_PARAM: &str = "workflow_id";
/// Parameter key carrying the project (context) id into every task.
pub const PROJECT_ID_PARAM: &str = "project_id";

/// Workflow execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Created, not started yet.
    Pending,
    /// Steps are being dispatched.
    Running,
    /// Dispatch is suspended until resumed.
    Paused,
    /// Every step completed.
    Completed,
    /// Some step failed permanently and the remaining steps cannot progress.
    Failed,
    /// Cancelled by a caller.
    Cancelled,
}

impl WorkflowStatus {
    /// Checks if the workflow can transition to the given status.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct transition rule
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            // From Pending: start or cancel
            (Self::Pending, Self::Running | Self::Cancelled) => true,
            // From Running: pause, finish or cancel
            (Self::Running, Self::Paused | Self::Completed | Self::Failed | Self::Cancelled) => true,
            // From Paused: resume or cancel
            (Self::Paused, Self::Running | Self::Cancelled) => true,
            // Terminal states never change
            _ => false,
        }
    }

    /// Returns whether the status is final.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns the lowercase status name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt at a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    /// Step that failed.
    pub step_id: String,
    /// Error message of the attempt.
    pub message: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Whether this attempt made the step permanently failed.
    pub terminal: bool,
    /// When the attempt failed.
    pub timestamp: DateTime<Utc>,
}

/// What the instance wants done after a state change.
#[derive(Debug)]
pub enum Advance {
    /// Enqueue this task.
    Dispatch(Task),
    /// Nothing to do right now.
    Idle,
    /// The workflow reached a terminal status.
    Finished(WorkflowStatus),
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    /// Workflow id.
    pub workflow_id: String,
    /// Template the workflow runs.
    pub template_name: String,
    /// Project the workflow operates on.
    pub context_id: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Completed share of steps, 0 to 100.
    pub progress: f64,
    /// Step currently dispatched, if any.
    pub current_step: Option<String>,
    /// Number of completed steps.
    pub completed_count: usize,
    /// Number of steps in the template.
    pub total_count: usize,
    /// When the workflow was created.
    pub created_at: DateTime<Utc>,
    /// When the workflow was started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the workflow reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Projected completion time while running.
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Answer to a results query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResults {
    /// Workflow id.
    pub workflow_id: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Step results keyed by step id.
    pub results: BTreeMap<String, Value>,
    /// Completed steps, in completion order.
    pub completed_steps: Vec<String>,
    /// Permanently failed steps, in failure order.
    pub failed_steps: Vec<String>,
    /// Steps that neither completed nor failed.
    pub blocked_steps: Vec<String>,
    /// Every failed attempt, oldest first.
    pub error_log: Vec<StepError>,
    /// Completed share of steps, 0 to 100.
    pub progress: f64,
    /// Milliseconds spent on each completed step.
    pub step_durations_ms: BTreeMap<String, u64>,
}

impl WorkflowResults {
    /// Turns a Failed outcome into a `WorkflowFailed` error.
    ///
    /// # Errors
    /// Returns `WorkflowFailed` if the workflow ended in the Failed status.
    pub fn into_result(self) -> Result<Self> {
        if self.status == WorkflowStatus::Failed {
            return Err(OrchestrationError::WorkflowFailed {
                workflow_id: self.workflow_id,
                failed_steps: self.failed_steps,
            });
        }
        Ok(self)
    }
}

/// One execution of a workflow template.
#[derive(Debug, Clone)]
pub struct WorkflowInstance {
    id: String,
    template: Arc<WorkflowTemplate>,
    context_id: String,
    parameters: Parameters,
    status: WorkflowStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    completed_steps: Vec<String>,
    failed_steps: Vec<String>,
    results: BTreeMap<String, Value>,
    error_log: Vec<StepError>,
    current_step: Option<String>,
    progress: f64,
    /// Step whose task is queued, running, or parked.
    in_flight: Option<String>,
    /// Task taken out of the queue while paused.
    parked: Option<Task>,
    step_durations: BTreeMap<String, Duration>,
}

impl WorkflowInstance {
    /// Creates a pending instance of `template`.
    #[must_use]
    pub fn new(template: Arc<WorkflowTemplate>, context_id: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            id: format!("wf-{}", uuid::Uuid::new_v4()),
            template,
            context_id: context_id.into(),
            parameters,
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            results: BTreeMap::new(),
            error_log: Vec::new(),
            current_step: None,
            progress: 0.0,
            in_flight: None,
            parked: None,
            step_durations: BTreeMap::new(),
        }
    }

    /// Workflow id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Template snapshot the instance runs.
    #[must_use]
    pub fn template(&self) -> &WorkflowTemplate {
        &self.template
    }

    /// Project the instance operates on.
    #[must_use]
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    /// Completed steps in completion order.
    #[must_use]
    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    /// Permanently failed steps.
    #[must_use]
    pub fn failed_steps(&self) -> &[String] {
        &self.failed_steps
    }

    /// Completed share of steps, 0 to 100.
    #[must_use]
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Step currently dispatched.
    #[must_use]
    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    /// Whether a task of this instance is queued, running, or parked.
    #[must_use]
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether `step_id` is the step this instance has dispatched.
    #[must_use]
    pub fn is_in_flight(&self, step_id: &str) -> bool {
        self.in_flight.as_deref() == Some(step_id)
    }

    /// Completion time of a finished workflow, measured from start.
    #[must_use]
    pub fn execution_time(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.completed_at?;
        (finished - started).to_std().ok()
    }

    fn transition(&mut self, to: WorkflowStatus, action: &'static str) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestrationError::InvalidTransition {
                workflow_id: self.id.clone(),
                from: self.status,
                action,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.current_step = None;
            self.in_flight = None;
            self.parked = None;
        }
        Ok(())
    }

    /// `Pending -> Running`.
    pub fn start(&mut self) -> Result<()> {
        self.transition(WorkflowStatus::Running, "start")?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `Running -> Paused`.
    pub fn pause(&mut self) -> Result<()> {
        if self.status != WorkflowStatus::Running {
            return Err(OrchestrationError::InvalidTransition {
                workflow_id: self.id.clone(),
                from: self.status,
                action: "pause",
            });
        }
        self.transition(WorkflowStatus::Paused, "pause")
    }

    /// `Paused -> Running`, handing back the parked task if there is one.
    pub fn resume(&mut self) -> Result<Option<Task>> {
        if self.status != WorkflowStatus::Paused {
            return Err(OrchestrationError::InvalidTransition {
                workflow_id: self.id.clone(),
                from: self.status,
                action: "resume",
            });
        }
        self.transition(WorkflowStatus::Running, "resume")?;
        Ok(self.parked.take())
    }

    /// Moves a non-terminal workflow to `Cancelled`.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(WorkflowStatus::Cancelled, "cancel")
    }

    /// Holds a task of this instance until it is resumed.
    pub fn park(&mut self, task: Task) {
        self.parked = Some(task);
    }

    /// First step, in template order, that is ready to run.
    #[must_use]
    pub fn next_ready_step(&self) -> Option<&StepSpec> {
        self.template.steps.iter().find(|step| self.is_ready(&step.id))
    }

    fn is_ready(&self, step_id: &str) -> bool {
        !self.completed_steps.iter().any(|s| s == step_id)
            && !self.failed_steps.iter().any(|s| s == step_id)
            && self
                .template
                .prerequisites(step_id)
                .iter()
                .all(|p| self.completed_steps.contains(p))
    }

    /// Decides what happens next for a running instance with nothing in flight.
    pub fn advance(&mut self) -> Advance {
        if self.status != WorkflowStatus::Running || self.in_flight.is_some() {
            return Advance::Idle;
        }

        if self.completed_steps.len() == self.template.step_count() {
            self.status = WorkflowStatus::Completed;
            self.completed_at = Some(Utc::now());
            self.current_step = None;
            return Advance::Finished(WorkflowStatus::Completed);
        }

        let Some(step) = self.next_ready_step().cloned() else {
            // Nothing ready and nothing in flight: the remaining steps are blocked by a failure.
            self.status = WorkflowStatus::Failed;
            self.completed_at = Some(Utc::now());
            self.current_step = None;
            return Advance::Finished(WorkflowStatus::Failed);
        };

        let task = Task::new(&self.id, &step.id, &step.capability, step.priority, self.task_parameters());
        self.in_flight = Some(step.id.clone());
        self.current_step = Some(step.id);
        Advance::Dispatch(task)
    }

    /// Run parameters plus `<step>_result` for every completed step and the workflow context keys.
    #[must_use]
    pub fn task_parameters(&self) -> Parameters {
        let mut parameters = self.parameters.clone();
        for step_id in &self.completed_steps {
            if let Some(result) = self.results.get(step_id) {
                parameters.insert(format!("{step_id}_result"), result.clone());
            }
        }
        parameters.insert(WORKFLOW_ID_PARAM.to_string(), Value::String(self.id.clone()));
        parameters.insert(PROJECT_ID_PARAM.to_string(), Value::String(self.context_id.clone()));
        parameters
    }

    /// Records a successful step.
    pub fn record_success(&mut self, step_id: &str, result: Value, elapsed: Duration) {
        if !self.completed_steps.iter().any(|s| s == step_id) {
            self.completed_steps.push(step_id.to_string());
        }
        self.results.insert(step_id.to_string(), result);
        self.step_durations.insert(step_id.to_string(), elapsed);
        self.release(step_id);
        self.recompute_progress();
    }

    /// Records a failed attempt. A terminal failure marks the step permanently failed.
    pub fn record_failure(&mut self, step_id: &str, message: impl Into<String>, attempt: u32, terminal: bool) {
        self.error_log.push(StepError {
            step_id: step_id.to_string(),
            message: message.into(),
            attempt,
            terminal,
            timestamp: Utc::now(),
        });
        if terminal {
            if !self.failed_steps.iter().any(|s| s == step_id) {
                self.failed_steps.push(step_id.to_string());
            }
            self.release(step_id);
        }
    }

    fn release(&mut self, step_id: &str) {
        if self.in_flight.as_deref() == Some(step_id) {
            self.in_flight = None;
        }
        if self.current_step.as_deref() == Some(step_id) {
            self.current_step = None;
        }
    }

    fn recompute_progress(&mut self) {
        let total = self.template.step_count();
        self.progress = if total == 0 { 0.0 } else { self.completed_steps.len() as f64 / total as f64 * 100.0 };
    }

    /// Steps that have neither completed nor failed, excluding the one in flight.
    #[must_use]
    pub fn blocked_steps(&self) -> Vec<String> {
        self.template
            .steps
            .iter()
            .map(|s| &s.id)
            .filter(|id| {
                !self.completed_steps.contains(id)
                    && !self.failed_steps.contains(id)
                    && self.in_flight.as_ref() != Some(*id)
            })
            .cloned()
            .collect()
    }

    /// Average completed-step duration times the number of remaining steps, from now.
    #[must_use]
    pub fn estimated_completion(&self) -> Option<DateTime<Utc>> {
        if self.status.is_terminal() || self.step_durations.is_empty() {
            return None;
        }
        let total: Duration = self.step_durations.values().sum();
        let average = total / u32::try_from(self.step_durations.len()).ok()?;
        let remaining = u32::try_from(self.template.step_count().saturating_sub(self.completed_steps.len())).ok()?;
        let eta = chrono::Duration::from_std(average.checked_mul(remaining)?).ok()?;
        Utc::now().checked_add_signed(eta)
    }

    /// Builds a status report.
    #[must_use]
    pub fn status_report(&self) -> WorkflowStatusReport {
        WorkflowStatusReport {
            workflow_id: self.id.clone(),
            template_name: self.template.name.clone(),
            context_id: self.context_id.clone(),
            status: self.status,
            progress: self.progress,
            current_step: self.current_step.clone(),
            completed_count: self.completed_steps.len(),
            total_count: self.template.step_count(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            estimated_completion: self.estimated_completion(),
        }
    }

    /// Builds a results report.
    #[must_use]
    pub fn results_report(&self) -> WorkflowResults {
        WorkflowResults {
            workflow_id: self.id.clone(),
            status: self.status,
            results: self.results.clone(),
            completed_steps: self.completed_steps.clone(),
            failed_steps: self.failed_steps.clone(),
            blocked_steps: self.blocked_steps(),
            error_log: self.error_log.clone(),
            progress: self.progress,
            step_durations_ms: self
                .step_durations
                .iter()
                .map(|(step, d)| (step.clone(), u64::try_from(d.as_millis()).unwrap_or(u64::MAX)))
                .collect(),
        }
    }

    /// Creates a pending copy of a failed or cancelled instance that keeps its completed work.
    pub fn relaunch(&self) -> Result<Self> {
        if !matches!(self.status, WorkflowStatus::Failed | WorkflowStatus::Cancelled) {
            return Err(OrchestrationError::InvalidTransition {
                workflow_id: self.id.clone(),
                from: self.status,
                action: "relaunch",
            });
        }
        let mut next = Self::new(Arc::clone(&self.template), self.context_id.clone(), self.parameters.clone());
        next.completed_steps = self.completed_steps.clone();
        next.results = self
            .completed_steps
            .iter()
            .filter_map(|step| self.results.get(step).map(|r| (step.clone(), r.clone())))
            .collect();
        next.step_durations = self
            .completed_steps
            .iter()
            .filter_map(|step| self.step_durations.get(step).map(|d| (step.clone(), *d)))
            .collect();
        next.recompute_progress();
        Ok(next)
    }
}
