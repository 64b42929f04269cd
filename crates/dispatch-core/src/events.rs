//! Notifications published to UI subscribers.
//!
//! Three one-way events per invocation: started, any number of output lines,
//! and exactly one completion carrying the terminal result.

use crate::types::{Id, RunResult};
use serde::{Deserialize, Serialize};

/// Wire names of the UI events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UiEventType {
    #[serde(rename = "command:start")]
    ExecutionStarted,
    #[serde(rename = "command:output")]
    OutputLine,
    #[serde(rename = "command:complete")]
    ExecutionCompleted,
}

impl UiEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStarted => "command:start",
            Self::OutputLine => "command:output",
            Self::ExecutionCompleted => "command:complete",
        }
    }
}

/// One UI notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    ExecutionStarted { execution_id: Id, subcommand: String },
    OutputLine { execution_id: Id, line: String },
    ExecutionCompleted { execution_id: Id, result: RunResult },
}

impl UiEvent {
    pub fn event_type(&self) -> UiEventType {
        match self {
            Self::ExecutionStarted { .. } => UiEventType::ExecutionStarted,
            Self::OutputLine { .. } => UiEventType::OutputLine,
            Self::ExecutionCompleted { .. } => UiEventType::ExecutionCompleted,
        }
    }

    /// Wire name, e.g. `command:output`.
    pub fn event_name(&self) -> &'static str {
        self.event_type().as_str()
    }

    pub fn execution_id(&self) -> &Id {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::OutputLine { execution_id, .. }
            | Self::ExecutionCompleted { execution_id, .. } => execution_id,
        }
    }

    /// Completion is the only terminal signal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ExecutionCompleted { .. })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_with_wire_names() {
        assert_eq!(
            serde_json::to_string(&UiEventType::OutputLine).unwrap(),
            "\"command:output\""
        );
        assert_eq!(UiEventType::ExecutionCompleted.as_str(), "command:complete");
    }

    #[test]
    fn output_line_payload_serializes() {
        let event = UiEvent::OutputLine {
            execution_id: Id::from_string("exec-1"),
            line: "Building image...".to_string(),
        };
        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"output_line\""));
        assert!(json.contains("exec-1"));
        assert!(json.contains("Building image..."));
        assert!(!event.is_terminal());
    }

    #[test]
    fn completed_event_round_trips_result() {
        let event = UiEvent::ExecutionCompleted {
            execution_id: Id::from_string("exec-2"),
            result: RunResult::failed("out".into(), "process failed with exit code 2"),
        };
        let json = event.to_json().unwrap();
        let back: UiEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(back.is_terminal());
        assert_eq!(back.event_type(), UiEventType::ExecutionCompleted);
    }
}
