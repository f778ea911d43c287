//! TaskRun: one execution attempt of a Task, owning the LLM conversation

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;
use super::meta::{Kind, LocalObjectReference, Object, ResourceSpec};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunSpec {
    pub task_ref: LocalObjectReference,
    /// Overrides the Task's agent when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<LocalObjectReference>,
    /// Overrides the Task's user message when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    /// Set on runs spawned on behalf of a tool call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_run_tool_call_ref: Option<LocalObjectReference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRunPhase {
    Initializing,
    Pending,
    ReadyForLLM,
    SendContextWindowToLLM,
    ToolCallsPending,
    CheckingToolCalls,
    FinalAnswer,
    ErrorBackoff,
    Failed,
}

impl TaskRunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskRunPhase::FinalAnswer | TaskRunPhase::Failed)
    }
}

impl fmt::Display for TaskRunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRunStatusType {
    #[default]
    Pending,
    Ready,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub status: TaskRunStatusType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TaskRunPhase>,
    #[serde(default)]
    pub status_detail: String,
    /// Append-only; index 0 is the system prompt, index 1 the seed user message
    #[serde(default)]
    pub context_window: Vec<Message>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    /// Correlates the sibling tool calls of one LLM response
    #[serde(default, rename = "toolCallRequestId")]
    pub tool_call_request_id: String,
    /// Retryable LLM failures seen since the last successful round trip
    #[serde(default)]
    pub llm_attempts: u32,
    /// Earliest time the next LLM attempt may run while in `ErrorBackoff`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl ResourceSpec for TaskRunSpec {
    const KIND: Kind = Kind::TaskRun;
    type Status = TaskRunStatus;
}

pub type TaskRun = Object<TaskRunSpec>;
