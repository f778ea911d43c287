//! TaskRunToolCall: one LLM-requested tool invocation

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::meta::{Kind, LocalObjectReference, Object, ResourceSpec};
use super::tool::ToolType;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunToolCallSpec {
    /// Id of the originating entry in the parent's last assistant message
    pub tool_call_id: String,
    pub task_run_ref: LocalObjectReference,
    pub tool_ref: LocalObjectReference,
    /// Informational; dispatch is decided from the referenced tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<ToolType>,
    /// Raw JSON text
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRunToolCallPhase {
    Pending,
    Running,
    AwaitingHumanApproval,
    AwaitingSubAgent,
    ReadyToExecuteApprovedTool,
    Succeeded,
    Failed,
    ToolCallRejected,
    ErrorRequestingHumanApproval,
}

impl TaskRunToolCallPhase {
    /// Phases no further reconcile will leave
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskRunToolCallPhase::Succeeded
                | TaskRunToolCallPhase::Failed
                | TaskRunToolCallPhase::ToolCallRejected
                | TaskRunToolCallPhase::ErrorRequestingHumanApproval
        )
    }
}

impl fmt::Display for TaskRunToolCallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Coarse status, independent of the phase.
///
/// `Ready` while awaiting approval means "no error, still waiting".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRunToolCallStatusType {
    #[default]
    Pending,
    Ready,
    Error,
    Succeeded,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunToolCallStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TaskRunToolCallPhase>,
    #[serde(default)]
    pub status: TaskRunToolCallStatusType,
    #[serde(default)]
    pub status_detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<ToolType>,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error: String,
    /// Call id registered with the approval backend
    #[serde(default, rename = "externalCallId")]
    pub external_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl TaskRunToolCallStatus {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_some_and(|p| p.is_terminal())
    }
}

impl ResourceSpec for TaskRunToolCallSpec {
    const KIND: Kind = Kind::TaskRunToolCall;
    type Status = TaskRunToolCallStatus;
}

pub type TaskRunToolCall = Object<TaskRunToolCallSpec>;
