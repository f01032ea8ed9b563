//! Lifecycle events published by the workflow engine.
//!
//! `Event` is transient: it exists for the duration of a single publish call
//! and in the bus's bounded history. Nothing here is persisted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of lifecycle transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workflow.start")]
    WorkflowStart,
    #[serde(rename = "workflow.step")]
    WorkflowStep,
    #[serde(rename = "workflow.checkpoint")]
    WorkflowCheckpoint,
    #[serde(rename = "workflow.complete")]
    WorkflowComplete,
    #[serde(rename = "workflow.rollback")]
    WorkflowRollback,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStart => "workflow.start",
            EventType::WorkflowStep => "workflow.step",
            EventType::WorkflowCheckpoint => "workflow.checkpoint",
            EventType::WorkflowComplete => "workflow.complete",
            EventType::WorkflowRollback => "workflow.rollback",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Component that produced the event (`"engine"` for the workflow engine).
    pub source: String,
    /// Type-specific payload.
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, source: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            source: source.into(),
            data,
            run_id: None,
            step_id: None,
        }
    }

    /// Correlate the event with a run.
    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Correlate the event with a step.
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Convenience accessor for a string field of the payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}
