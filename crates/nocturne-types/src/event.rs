// Engine events published on the sequence event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{SequenceState, TargetStatus, TaskStatus};

/// Periodic progress payload emitted while a sequence is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressReport {
    pub sequence_id: Uuid,
    pub state: SequenceState,
    /// Overall progress percentage, 0-100.
    pub progress: f64,
    pub completed_targets: usize,
    pub total_targets: usize,
    pub current_target: Option<String>,
    pub current_task: Option<String>,
    pub elapsed_secs: f64,
    /// Estimate from average target wall time; None until one target finishes.
    pub estimated_remaining_secs: Option<f64>,
}

/// Events for the append-only sequence log and registered observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SequenceEvent {
    SequenceStarted {
        sequence_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    SequenceEnded {
        sequence_id: Uuid,
        success: bool,
        timestamp: DateTime<Utc>,
    },
    TargetStarted {
        sequence_id: Uuid,
        target: String,
        timestamp: DateTime<Utc>,
    },
    TargetEnded {
        sequence_id: Uuid,
        target: String,
        status: TargetStatus,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        target: String,
        task: String,
        info: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    TaskEnded {
        target: String,
        task: String,
        status: TaskStatus,
        timestamp: DateTime<Utc>,
    },
    Error {
        /// Sequence id or target name, depending on where the error surfaced.
        scope: String,
        kind: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Progress {
        report: ProgressReport,
        timestamp: DateTime<Utc>,
    },
}

impl SequenceEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SequenceEvent::SequenceStarted { timestamp, .. }
            | SequenceEvent::SequenceEnded { timestamp, .. }
            | SequenceEvent::TargetStarted { timestamp, .. }
            | SequenceEvent::TargetEnded { timestamp, .. }
            | SequenceEvent::TaskStarted { timestamp, .. }
            | SequenceEvent::TaskEnded { timestamp, .. }
            | SequenceEvent::Error { timestamp, .. }
            | SequenceEvent::Progress { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = SequenceEvent::TargetEnded {
            sequence_id: Uuid::new_v4(),
            target: "M42".to_string(),
            status: TargetStatus::Completed,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "target_ended");
        assert_eq!(json["status"], "completed");
    }
}
