// Error types for workflow orchestration

use std::time::Duration;

use quill_abstraction::CapabilityError;
use thiserror::Error;

use crate::instance::WorkflowStatus;
use crate::template::TemplateError;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    /// No template is registered under the requested name
    #[error("Unknown workflow template: {0}")]
    UnknownTemplate(String),

    /// No active or archived workflow has this id
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// The requested lifecycle action is not allowed from the current status
    #[error("Cannot {action} workflow {workflow_id} while it is {from}")]
    InvalidTransition {
        /// Workflow id
        workflow_id: String,
        /// Status the workflow was in
        from: WorkflowStatus,
        /// Action that was attempted
        action: &'static str,
    },

    /// A template failed validation
    #[error("Invalid template: {0}")]
    InvalidTemplate(#[from] TemplateError),

    /// The step's capability was never registered
    #[error("CapabilityNotRegistered: {0}")]
    CapabilityNotRegistered(String),

    /// The capability ran and reported a failure
    #[error("Capability '{capability}' failed: {source}")]
    CapabilityInvocation {
        /// Capability name
        capability: String,
        /// Error raised by the capability
        #[source]
        source: CapabilityError,
    },

    /// The capability did not answer within the task timeout
    #[error("Capability '{capability}' timed out after {timeout:?}")]
    CapabilityTimeout {
        /// Capability name
        capability: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The capability panicked while executing
    #[error("Capability '{capability}' panicked: {message}")]
    CapabilityPanicked {
        /// Capability name
        capability: String,
        /// Panic payload, if it was a string
        message: String,
    },

    /// The workflow reached the terminal Failed status
    #[error("Workflow {workflow_id} failed at steps: {}", failed_steps.join(", "))]
    WorkflowFailed {
        /// Workflow id
        workflow_id: String,
        /// Steps that permanently failed
        failed_steps: Vec<String>,
    },

    /// Waiting for a workflow took longer than allowed
    #[error("Timed out after {0:?} waiting for workflow {1}")]
    WaitTimeout(Duration, String),

    /// The scheduler loop was started twice
    #[error("Scheduler is already running")]
    SchedulerAlreadyRunning,

    /// The scheduler loop was stopped while not running
    #[error("Scheduler is not running")]
    SchedulerNotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_not_registered_message() {
        let err = OrchestrationError::CapabilityNotRegistered("chapter_writer".to_string());
        assert_eq!(err.to_string(), "CapabilityNotRegistered: chapter_writer");
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = OrchestrationError::InvalidTransition {
            workflow_id: "wf-1".to_string(),
            from: WorkflowStatus::Completed,
            action: "start",
        };
        assert_eq!(err.to_string(), "Cannot start workflow wf-1 while it is completed");
    }

    #[test]
    fn test_workflow_failed_lists_steps() {
        let err = OrchestrationError::WorkflowFailed {
            workflow_id: "wf-1".to_string(),
            failed_steps: vec!["a".to_string(), "b".to_string()],
        };
        assert!(err.to_string().ends_with("a, b"));
    }
}
