//! Task: a user request against an Agent

use serde::{Deserialize, Serialize};

use super::meta::{Kind, LocalObjectReference, Object, ReadinessStatus, ResourceSpec};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub agent_ref: LocalObjectReference,
    #[serde(default)]
    pub user_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub status: ReadinessStatus,
    #[serde(default)]
    pub status_detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_run_ref: Option<LocalObjectReference>,
}

impl ResourceSpec for TaskSpec {
    const KIND: Kind = Kind::Task;
    type Status = TaskStatus;
}

pub type Task = Object<TaskSpec>;
