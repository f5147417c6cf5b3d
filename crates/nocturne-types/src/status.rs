// Status enums shared across the task, target, and sequence layers.
//
// The sequence document contract stores strategy and state enums as integers,
// so each enum here carries a stable numeric representation alongside its
// snake_case serde form used in event payloads.

use serde::{Deserialize, Serialize};

/// Status of a single task within one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Status of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Skipped,
    Aborted,
}

impl TargetStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TargetStatus::Completed
                | TargetStatus::Failed
                | TargetStatus::Skipped
                | TargetStatus::Aborted
        )
    }
}

/// Lifecycle state of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceState {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl SequenceState {
    pub fn as_u8(self) -> u8 {
        match self {
            SequenceState::Idle => 0,
            SequenceState::Running => 1,
            SequenceState::Paused => 2,
            SequenceState::Stopping => 3,
            SequenceState::Stopped => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SequenceState::Idle),
            1 => Some(SequenceState::Running),
            2 => Some(SequenceState::Paused),
            3 => Some(SequenceState::Stopping),
            4 => Some(SequenceState::Stopped),
            _ => None,
        }
    }
}

/// How targets are ordered for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    #[default]
    Fifo,
    Priority,
    Dependencies,
}

impl SchedulingStrategy {
    pub fn as_u8(self) -> u8 {
        match self {
            SchedulingStrategy::Fifo => 0,
            SchedulingStrategy::Priority => 1,
            SchedulingStrategy::Dependencies => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SchedulingStrategy::Fifo),
            1 => Some(SchedulingStrategy::Priority),
            2 => Some(SchedulingStrategy::Dependencies),
            _ => None,
        }
    }
}

/// How ready targets are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
    Adaptive,
    Priority,
}

impl ExecutionStrategy {
    pub fn as_u8(self) -> u8 {
        match self {
            ExecutionStrategy::Sequential => 0,
            ExecutionStrategy::Parallel => 1,
            ExecutionStrategy::Adaptive => 2,
            ExecutionStrategy::Priority => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ExecutionStrategy::Sequential),
            1 => Some(ExecutionStrategy::Parallel),
            2 => Some(ExecutionStrategy::Adaptive),
            3 => Some(ExecutionStrategy::Priority),
            _ => None,
        }
    }
}

/// How the sequencer reacts when a target exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    #[default]
    Stop,
    Skip,
    Retry,
    Alternative,
}

impl RecoveryStrategy {
    pub fn as_u8(self) -> u8 {
        match self {
            RecoveryStrategy::Stop => 0,
            RecoveryStrategy::Skip => 1,
            RecoveryStrategy::Retry => 2,
            RecoveryStrategy::Alternative => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RecoveryStrategy::Stop),
            1 => Some(RecoveryStrategy::Skip),
            2 => Some(RecoveryStrategy::Retry),
            3 => Some(RecoveryStrategy::Alternative),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_roundtrip() {
        for v in 0..=4u8 {
            assert_eq!(SequenceState::from_u8(v).map(|s| s.as_u8()), Some(v));
        }
        for v in 0..=2u8 {
            assert_eq!(SchedulingStrategy::from_u8(v).map(|s| s.as_u8()), Some(v));
        }
        for v in 0..=3u8 {
            assert_eq!(ExecutionStrategy::from_u8(v).map(|s| s.as_u8()), Some(v));
            assert_eq!(RecoveryStrategy::from_u8(v).map(|s| s.as_u8()), Some(v));
        }
        assert!(SequenceState::from_u8(9).is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TargetStatus::Skipped.is_terminal());
        assert!(!TargetStatus::Paused.is_terminal());
    }
}
