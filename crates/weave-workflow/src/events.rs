//! Live execution events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::execution::{ExecutionStatus, StepStatus};

/// A change in an execution's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ExecutionStarted {
        execution_id: String,
        workflow_id: String,
    },
    StepStarted {
        execution_id: String,
        step_id: String,
    },
    StepRetrying {
        execution_id: String,
        step_id: String,
        attempt: u32,
        error: String,
    },
    StepFinished {
        execution_id: String,
        step_id: String,
        status: StepStatus,
    },
    ExecutionFinished {
        execution_id: String,
        status: ExecutionStatus,
    },
}

impl WorkflowEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepRetrying { execution_id, .. }
            | Self::StepFinished { execution_id, .. }
            | Self::ExecutionFinished { execution_id, .. } => execution_id,
        }
    }
}

/// Event bus using a tokio broadcast channel.
/// All subscribers receive all events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(WorkflowEvent::StepStarted {
            execution_id: "e1".into(),
            step_id: "s1".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id(), "e1");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(WorkflowEvent::ExecutionFinished {
            execution_id: "e1".into(),
            status: ExecutionStatus::Completed,
        });
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = WorkflowEvent::StepFinished {
            execution_id: "e1".into(),
            step_id: "s1".into(),
            status: StepStatus::Skipped,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "step_finished");
        assert_eq!(json["status"], "skipped");
    }
}
