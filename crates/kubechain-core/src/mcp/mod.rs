//! Model Context Protocol
//!
//! Client side of MCP for tool servers declared as MCPServer resources:
//! - `protocol`: JSON-RPC message types
//! - `transport`: stdio and HTTP transports
//! - `client`: request/response correlation for one server
//! - `manager`: live connections keyed by server name; the `ToolBackend`

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::api::McpToolInfo;
use crate::llm::split_mcp_tool_name;

pub mod client;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use client::McpClient;
pub use manager::McpServerManager;

/// Tool execution backend used by the controllers
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Tools of a connected server; `None` when the server is not connected
    async fn get_tools(&self, server: &str) -> Option<Vec<McpToolInfo>>;

    /// Call a tool and return its text output
    async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> Result<String>;

    /// Split `<server>__<tool>` when the server is connected
    async fn find_server_for_tool(&self, full_name: &str) -> Option<(String, String)> {
        let (server, tool) = split_mcp_tool_name(full_name)?;
        self.get_tools(server).await?;
        Some((server.to_string(), tool.to_string()))
    }
}
