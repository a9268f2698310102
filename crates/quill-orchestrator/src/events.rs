//! Workflow event broadcasting.
//!
//! Subscribers receive every step and workflow outcome as it is applied. A
//! lagging subscriber loses the oldest events, the orchestrator never blocks on it.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::instance::WorkflowStatus;

/// Default capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A step's task was handed to its capability.
    StepDispatched {
        /// Workflow id.
        workflow_id: String,
        /// Step id.
        step_id: String,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A step completed.
    StepCompleted {
        /// Workflow id.
        workflow_id: String,
        /// Step id.
        step_id: String,
        /// Workflow progress after the step, 0 to 100.
        progress: f64,
    },
    /// A step failed and was requeued.
    StepRetrying {
        /// Workflow id.
        workflow_id: String,
        /// Step id.
        step_id: String,
        /// Attempt that failed.
        attempt: u32,
        /// Backoff before the next attempt, in milliseconds.
        delay_ms: u64,
        /// Error of the failed attempt.
        error: String,
    },
    /// A step failed permanently.
    StepFailed {
        /// Workflow id.
        workflow_id: String,
        /// Step id.
        step_id: String,
        /// Last error.
        error: String,
    },
    /// A workflow reached a terminal status.
    WorkflowFinished {
        /// Workflow id.
        workflow_id: String,
        /// Terminal status.
        status: WorkflowStatus,
    },
}

impl WorkflowEvent {
    /// Workflow the event belongs to.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        match self {
            Self::StepDispatched { workflow_id, .. }
            | Self::StepCompleted { workflow_id, .. }
            | Self::StepRetrying { workflow_id, .. }
            | Self::StepFailed { workflow_id, .. }
            | Self::WorkflowFinished { workflow_id, .. } => workflow_id,
        }
    }
}

/// Broadcast channel for workflow events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Creates a bus holding up to `capacity` undelivered events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event; it is dropped if nobody listens.
    pub fn publish(&self, event: WorkflowEvent) {
        trace!(?event, "Workflow event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(WorkflowEvent::WorkflowFinished {
            workflow_id: "wf-1".into(),
            status: WorkflowStatus::Completed,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.workflow_id(), "wf-1");
        assert!(matches!(event, WorkflowEvent::WorkflowFinished { status: WorkflowStatus::Completed, .. }));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(0);
        bus.publish(WorkflowEvent::StepFailed {
            workflow_id: "wf-1".into(),
            step_id: "a".into(),
            error: "boom".into(),
        });
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = WorkflowEvent::StepDispatched { workflow_id: "wf".into(), step_id: "s".into(), attempt: 1 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "step_dispatched");
        assert_eq!(json["attempt"], 1);
    }
}
