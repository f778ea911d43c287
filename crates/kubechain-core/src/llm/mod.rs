//! LLM client seam
//!
//! The TaskRun engine talks to the model through `LlmClient`, built per call
//! by an `LlmClientFactory` from the LLM resource and its resolved API key.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::api::{Llm, McpToolInfo, Message, Tool};

mod openai;

pub use openai::{OpenAiClient, OpenAiClientFactory};

/// Separator between server and tool in MCP tool names shown to the LLM
pub const MCP_TOOL_SEPARATOR: &str = "__";

#[derive(Debug, Error)]
pub enum LlmError {
    /// The provider answered with a non-success status
    #[error("request failed with status {status_code}: {message}")]
    Request { status_code: u16, message: String },
    /// No usable answer from the provider (connection, TLS, timeout)
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LlmError::Request { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// 4xx other than rate limiting
    pub fn is_client_error(&self) -> bool {
        self.status_code()
            .is_some_and(|c| (400..500).contains(&c) && c != 429)
    }

    /// Rate limiting and server errors are worth another attempt
    pub fn is_retryable(&self) -> bool {
        self.status_code().is_some_and(|c| c == 429 || c >= 500)
    }
}

/// Tool offered to the LLM (`{type: "function", function: {...}}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl ToolDescriptor {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDescriptor {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn from_tool(tool: &Tool) -> Self {
        Self::function(
            tool.function_name(),
            tool.spec.description.clone(),
            tool.spec
                .parameters
                .clone()
                .unwrap_or_else(empty_object_schema),
        )
    }

    /// Descriptor for an MCP tool, named `<server>__<tool>`
    pub fn from_mcp(server: &str, tool: &McpToolInfo) -> Self {
        let parameters = if tool.input_schema.is_null() {
            empty_object_schema()
        } else {
            tool.input_schema.clone()
        };
        Self::function(
            mcp_tool_name(server, &tool.name),
            tool.description.clone(),
            parameters,
        )
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

pub fn mcp_tool_name(server: &str, tool: &str) -> String {
    format!("{}{}{}", server, MCP_TOOL_SEPARATOR, tool)
}

/// Split `<server>__<tool>`; `None` when there is no separator
pub fn split_mcp_tool_name(full: &str) -> Option<(&str, &str)> {
    full.split_once(MCP_TOOL_SEPARATOR)
        .filter(|(server, tool)| !server.is_empty() && !tool.is_empty())
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One round trip: the reply is either text or a batch of tool calls
    async fn send_request(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<Message, LlmError>;
}

pub trait LlmClientFactory: Send + Sync {
    fn create(&self, llm: &Llm, api_key: &str) -> anyhow::Result<Arc<dyn LlmClient>>;
}
