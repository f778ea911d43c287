//! MCPServer controller
//!
//! Connects each MCPServer through the `McpServerManager` and publishes its
//! tool list. Live connections are re-checked on a slow timer; failed ones are
//! retried on a faster one. Deleting the resource drops the connection.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::Context;
use crate::api::{
    Kind, McpServer, McpServerSpec, McpServerStatus, McpToolInfo, McpTransportType, ObjectKey,
    ReadinessStatus,
};
use crate::mcp::{McpServerManager, ToolBackend};
use crate::runtime::{Action, Reconciler};
use crate::store::ResourceStoreExt;

pub struct McpServerReconciler {
    ctx: Arc<Context>,
    manager: Arc<McpServerManager>,
}

fn validate(spec: &McpServerSpec) -> std::result::Result<(), String> {
    match spec.transport {
        McpTransportType::Stdio if spec.command.is_empty() => {
            Err("command is required for stdio transport".to_string())
        }
        McpTransportType::Http if spec.url.is_empty() => {
            Err("url is required for http transport".to_string())
        }
        _ => Ok(()),
    }
}

fn connected(tools: Vec<McpToolInfo>) -> McpServerStatus {
    McpServerStatus {
        connected: true,
        status: ReadinessStatus::Ready,
        status_detail: format!("Connected successfully with {} tools", tools.len()),
        tools,
    }
}

fn failed(detail: String) -> McpServerStatus {
    McpServerStatus {
        connected: false,
        status: ReadinessStatus::Error,
        status_detail: detail,
        tools: Vec::new(),
    }
}

impl McpServerReconciler {
    pub fn new(ctx: Arc<Context>, manager: Arc<McpServerManager>) -> Self {
        Self { ctx, manager }
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.ctx.config.mcp.refresh_secs)
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.ctx.config.mcp.retry_secs)
    }

    /// Status for `server`, connecting when there is no live client
    async fn observe(&self, server: &McpServer) -> McpServerStatus {
        let name = server.name();
        if server.status.connected && self.manager.is_connected(name).await {
            if let Some(tools) = self.manager.get_tools(name).await {
                debug!("MCP server {} still connected", name);
                return connected(tools);
            }
        }

        match self.manager.connect_server(server).await {
            Ok(tools) => connected(tools),
            Err(e) => {
                warn!("MCP server {} connection failed: {:#}", server.key(), e);
                failed(format!("Connection failed: {:#}", e))
            }
        }
    }
}

#[async_trait]
impl Reconciler for McpServerReconciler {
    fn kind(&self) -> Kind {
        Kind::McpServer
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut server) = self.ctx.store.try_get::<McpServerSpec>(key).await? else {
            self.manager.disconnect(&key.name).await;
            return Ok(Action::done());
        };

        let (status, action) = match validate(&server.spec) {
            Err(detail) => (failed(detail), Action::done()),
            Ok(()) => {
                let status = self.observe(&server).await;
                let delay = if status.connected {
                    self.refresh_interval()
                } else {
                    self.retry_interval()
                };
                (status, Action::requeue_after(delay))
            }
        };
        if status == server.status {
            return Ok(action);
        }

        if status.connected {
            self.ctx
                .events
                .normal(Kind::McpServer, key, "Connected", status.status_detail.clone());
        } else {
            self.ctx.events.warning(
                Kind::McpServer,
                key,
                "ConnectionFailed",
                status.status_detail.clone(),
            );
        }
        server.status = status;
        self.ctx
            .store
            .update_status(&server)
            .await
            .with_context(|| format!("Failed to update MCPServer {}", key))?;
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::client::tests::ScriptedServer;
    use crate::mcp::McpClient;
    use crate::testing::{context, Fakes, NS};
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::path::PathBuf;

    fn reconciler(ctx: Arc<Context>) -> (McpServerReconciler, Arc<McpServerManager>) {
        let manager = Arc::new(McpServerManager::new(ctx.secrets.clone(), PathBuf::from(".")));
        (McpServerReconciler::new(ctx, manager.clone()), manager)
    }

    async fn create(fakes: &Fakes, transport: McpTransportType, url: &str) -> ObjectKey {
        fakes
            .store
            .create(McpServer::new(
                NS,
                "fetch",
                McpServerSpec {
                    transport,
                    command: String::new(),
                    args: Vec::new(),
                    env: Vec::new(),
                    url: url.into(),
                    approval_contact_channel: None,
                },
            ))
            .await
            .unwrap()
            .key()
    }

    async fn status(fakes: &Fakes, key: &ObjectKey) -> McpServerStatus {
        fakes.store.get::<McpServerSpec>(key).await.unwrap().status
    }

    #[tokio::test]
    async fn stdio_without_command_is_invalid() {
        let (ctx, fakes) = context();
        let key = create(&fakes, McpTransportType::Stdio, "").await;
        let (r, _) = reconciler(ctx);

        assert_eq!(r.reconcile(&key).await.unwrap(), Action::done());
        let status = status(&fakes, &key).await;
        assert!(!status.connected);
        assert_eq!(status.status, ReadinessStatus::Error);
        assert_eq!(status.status_detail, "command is required for stdio transport");
    }

    #[tokio::test]
    async fn http_server_connects_and_publishes_tools() {
        let (ctx, fakes) = context();
        let mut server = Server::new_async().await;
        let initialize = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"jsonrpc": "2.0", "id": 1, "result": {"protocolVersion": "2024-11-05"}})
                    .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let initialized = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(
                json!({"method": "notifications/initialized"}),
            ))
            .with_status(202)
            .expect(1)
            .create_async()
            .await;
        let list = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "tools/list"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"jsonrpc": "2.0", "id": 2, "result": {"tools": [
                    {"name": "get", "description": "fetch a url", "inputSchema": {"type": "object"}}
                ]}})
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let url = format!("{}/mcp", server.url());
        let key = create(&fakes, McpTransportType::Http, &url).await;
        let (r, manager) = reconciler(ctx);

        assert_eq!(
            r.reconcile(&key).await.unwrap(),
            Action::requeue_after(Duration::from_secs(600))
        );
        let published = status(&fakes, &key).await;
        assert!(published.connected);
        assert_eq!(published.status_detail, "Connected successfully with 1 tools");
        assert_eq!(published.tools[0].name, "get");
        assert!(manager.get_tools("fetch").await.is_some());
        assert!(fakes
            .events
            .reasons_for(Kind::McpServer, &key)
            .contains(&"Connected".to_string()));

        // Live connection: no reconnect, no rewrite
        let version = fakes
            .store
            .get::<McpServerSpec>(&key)
            .await
            .unwrap()
            .metadata
            .resource_version;
        r.reconcile(&key).await.unwrap();
        assert_eq!(
            fakes
                .store
                .get::<McpServerSpec>(&key)
                .await
                .unwrap()
                .metadata
                .resource_version,
            version
        );
        initialize.assert_async().await;
        initialized.assert_async().await;
        list.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_server_is_retried() {
        let (ctx, fakes) = context();
        let key = create(&fakes, McpTransportType::Http, "http://127.0.0.1:1/mcp").await;
        let (r, _) = reconciler(ctx);

        assert_eq!(
            r.reconcile(&key).await.unwrap(),
            Action::requeue_after(Duration::from_secs(30))
        );
        let status = status(&fakes, &key).await;
        assert!(!status.connected);
        assert!(status.status_detail.starts_with("Connection failed:"));
    }

    #[tokio::test]
    async fn deleted_server_is_disconnected() {
        let (ctx, _fakes) = context();
        let (r, manager) = reconciler(ctx);
        let client = McpClient::start(
            "fetch",
            Arc::new(ScriptedServer::new(vec![json!({"name": "get"})])),
        );
        client.initialize().await.unwrap();
        manager.insert_client(client).await;
        assert!(manager.is_connected("fetch").await);

        r.reconcile(&ObjectKey::new(NS, "fetch")).await.unwrap();
        assert!(!manager.is_connected("fetch").await);
    }
}
