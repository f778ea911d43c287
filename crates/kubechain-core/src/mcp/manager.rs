//! MCP server manager
//!
//! Keeps one live client per MCPServer resource and serves as the tool
//! execution backend for the controllers.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::client::McpClient;
use super::transport::{HttpTransport, McpTransport, StdioTransport};
use super::ToolBackend;
use crate::api::{McpServer, McpToolInfo, McpTransportType};
use crate::secrets::SecretStore;

pub struct McpServerManager {
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    secrets: Arc<dyn SecretStore>,
    working_dir: PathBuf,
}

impl McpServerManager {
    pub fn new(secrets: Arc<dyn SecretStore>, working_dir: PathBuf) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            secrets,
            working_dir,
        }
    }

    /// Environment for a stdio server, with `valueFrom` entries read from secrets
    async fn resolve_env(&self, server: &McpServer) -> Result<HashMap<String, String>> {
        let mut env = HashMap::new();
        for var in &server.spec.env {
            let value = match (&var.value, &var.value_from) {
                (_, Some(source)) => self
                    .secrets
                    .get_ref(server.namespace(), &source.secret_key_ref)
                    .await
                    .with_context(|| format!("resolving env {}", var.name))?,
                (Some(value), None) => value.clone(),
                (None, None) => String::new(),
            };
            env.insert(var.name.clone(), value);
        }
        Ok(env)
    }

    /// (Re)connect to `server` and return its tools
    pub async fn connect_server(&self, server: &McpServer) -> Result<Vec<McpToolInfo>> {
        let name = server.name().to_string();
        self.disconnect(&name).await;

        let transport: Arc<dyn McpTransport> = match server.spec.transport {
            McpTransportType::Stdio => {
                if server.spec.command.is_empty() {
                    return Err(anyhow!("command is required for stdio transport"));
                }
                let env = self.resolve_env(server).await?;
                Arc::new(
                    StdioTransport::spawn(
                        &server.spec.command,
                        &server.spec.args,
                        &env,
                        &self.working_dir,
                    )
                    .await?,
                )
            }
            McpTransportType::Http => {
                if server.spec.url.is_empty() {
                    return Err(anyhow!("url is required for http transport"));
                }
                let headers = self.resolve_env(server).await?;
                Arc::new(HttpTransport::new(server.spec.url.clone(), headers))
            }
        };

        let client = McpClient::start(&name, transport);
        client.initialize().await?;
        let tools = client.list_tools().await?;

        self.clients.write().await.insert(name.clone(), Arc::new(client));
        info!("Connected to MCP server: {} ({} tools)", name, tools.len());

        Ok(tools.into_iter().map(McpToolInfo::from).collect())
    }

    pub async fn disconnect(&self, name: &str) {
        if self.clients.write().await.remove(name).is_some() {
            info!("Disconnected from MCP server: {}", name);
        }
    }

    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        for name in names {
            self.disconnect(&name).await;
        }
    }

    /// Register an already started client
    pub async fn insert_client(&self, client: McpClient) {
        self.clients
            .write()
            .await
            .insert(client.name().to_string(), Arc::new(client));
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        match self.clients.read().await.get(name) {
            Some(client) => client.is_alive().await,
            None => false,
        }
    }
}

#[async_trait]
impl ToolBackend for McpServerManager {
    async fn get_tools(&self, server: &str) -> Option<Vec<McpToolInfo>> {
        let client = self.clients.read().await.get(server).cloned()?;
        Some(
            client
                .cached_tools()
                .await
                .into_iter()
                .map(McpToolInfo::from)
                .collect(),
        )
    }

    async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> Result<String> {
        let client = self
            .clients
            .read()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| anyhow!("MCP server {:?} not connected", server))?;

        let result = client.call_tool(tool, arguments).await?;
        let text = result.text();
        if result.is_error {
            warn!("MCP {} tool {} returned an error: {}", server, tool, text);
            return Err(anyhow!("tool execution error: {}", text));
        }
        Ok(text)
    }
}
