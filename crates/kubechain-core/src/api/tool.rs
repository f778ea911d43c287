//! Tool: a callable the LLM may request

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::meta::{Kind, LocalObjectReference, Object, ReadinessStatus, ResourceSpec, SecretKeyRef};

/// Wire name of a tool's execution type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
    #[serde(rename = "delegateToAgent")]
    DelegateToAgent,
    #[serde(rename = "MCP")]
    Mcp,
    #[serde(rename = "externalAPI")]
    ExternalApi,
}

impl fmt::Display for ToolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolType::Function => "function",
            ToolType::DelegateToAgent => "delegateToAgent",
            ToolType::Mcp => "MCP",
            ToolType::ExternalApi => "externalAPI",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    /// Name presented to the LLM; defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<ToolType>,
    #[serde(default)]
    pub execute: ToolExecute,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<LocalObjectReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolExecute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin: Option<BuiltinToolSpec>,
    #[serde(default, rename = "externalAPI", skip_serializing_if = "Option::is_none")]
    pub external_api: Option<ExternalApiSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuiltinToolSpec {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalApiSpec {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_from: Option<SecretKeyRef>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub status: ReadinessStatus,
    #[serde(default)]
    pub status_detail: String,
}

impl ResourceSpec for ToolSpec {
    const KIND: Kind = Kind::Tool;
    type Status = ToolStatus;
}

pub type Tool = Object<ToolSpec>;

/// Resolved execution strategy of a tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolKind {
    Function { builtin: String },
    DelegateToAgent { agent: String },
    Mcp { server: String, tool: String },
    ExternalApi(ExternalApiSpec),
}

impl ToolKind {
    pub fn tool_type(&self) -> ToolType {
        match self {
            ToolKind::Function { .. } => ToolType::Function,
            ToolKind::DelegateToAgent { .. } => ToolType::DelegateToAgent,
            ToolKind::Mcp { .. } => ToolType::Mcp,
            ToolKind::ExternalApi(_) => ToolType::ExternalApi,
        }
    }
}

impl Tool {
    /// Name the LLM sees for this tool
    pub fn function_name(&self) -> &str {
        self.spec.name.as_deref().unwrap_or(&self.metadata.name)
    }

    /// Decide the execution kind from the execution spec.
    ///
    /// Order: builtin, agentRef, externalAPI, then the declared `toolType`
    /// (only `function` can be honoured without a payload).
    pub fn kind(&self) -> Option<ToolKind> {
        if let Some(builtin) = &self.spec.execute.builtin {
            return Some(ToolKind::Function {
                builtin: builtin.name.clone(),
            });
        }
        if let Some(agent) = &self.spec.agent_ref {
            return Some(ToolKind::DelegateToAgent {
                agent: agent.name.clone(),
            });
        }
        if let Some(api) = &self.spec.execute.external_api {
            return Some(ToolKind::ExternalApi(api.clone()));
        }
        match self.spec.tool_type {
            Some(ToolType::Function) => Some(ToolKind::Function {
                builtin: self.function_name().to_string(),
            }),
            _ => None,
        }
    }
}
