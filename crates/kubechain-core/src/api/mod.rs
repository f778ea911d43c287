//! Resource model
//!
//! Typed spec/status pairs for every kind, the conversation types stored in
//! a TaskRun's context window, and manifest parsing.

mod agent;
mod manifest;
mod message;
mod meta;
mod task;
mod taskrun;
mod taskruntoolcall;
mod tool;

pub use agent::*;
pub use manifest::{parse_manifests, ManifestError};
pub use message::{FunctionCall, Message, Role, ToolCall};
pub use meta::*;
pub use task::{Task, TaskSpec, TaskStatus};
pub use taskrun::{TaskRun, TaskRunPhase, TaskRunSpec, TaskRunStatus, TaskRunStatusType};
pub use taskruntoolcall::{
    TaskRunToolCall, TaskRunToolCallPhase, TaskRunToolCallSpec, TaskRunToolCallStatus,
    TaskRunToolCallStatusType,
};
pub use tool::*;

/// Label on a TaskRun pointing at the Task that spawned it
pub const LABEL_TASK: &str = "kubechain.humanlayer.dev/task";
/// Label on a TaskRunToolCall pointing at its parent TaskRun
pub const LABEL_TASK_RUN: &str = "kubechain.humanlayer.dev/taskruntoolcall";
/// Label shared by the sibling tool calls of one LLM response
pub const LABEL_TOOL_CALL_REQUEST: &str = "kubechain.humanlayer.dev/toolcallrequest";
