//! Agent controller
//!
//! An Agent is ready once its LLM, tools, MCP servers and contact channels
//! are all ready. The resolved lists are published in the status for display.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::Context;
use crate::api::{
    Agent, AgentSpec, AgentStatus, ChannelType, ContactChannelSpec, Kind, LlmSpec,
    LocalObjectReference, McpServerSpec, ObjectKey, ReadinessStatus, ResolvedContactChannel,
    ResolvedMcpServer, ToolSpec,
};
use crate::runtime::{Action, Reconciler};
use crate::store::ResourceStoreExt;

pub struct AgentReconciler {
    ctx: Arc<Context>,
}

impl AgentReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn check_llm(&self, agent: &Agent) -> Result<std::result::Result<(), String>> {
        let name = &agent.spec.llm_ref.name;
        Ok(
            match self
                .ctx
                .store
                .try_get::<LlmSpec>(&ObjectKey::new(agent.namespace(), name))
                .await?
            {
                None => Err(format!("LLM {:?} not found", name)),
                Some(llm) if !llm.status.ready => Err(format!("LLM {:?} is not ready", name)),
                Some(_) => Ok(()),
            },
        )
    }

    async fn check_tools(
        &self,
        agent: &Agent,
    ) -> Result<std::result::Result<Vec<LocalObjectReference>, String>> {
        let mut valid = Vec::new();
        for tool_ref in &agent.spec.tools {
            match self
                .ctx
                .store
                .try_get::<ToolSpec>(&ObjectKey::new(agent.namespace(), &tool_ref.name))
                .await?
            {
                None => return Ok(Err(format!("Tool {:?} not found", tool_ref.name))),
                Some(tool) if !tool.status.ready => {
                    return Ok(Err(format!("Tool {:?} is not ready", tool_ref.name)))
                }
                Some(_) => valid.push(tool_ref.clone()),
            }
        }
        Ok(Ok(valid))
    }

    async fn check_mcp_servers(
        &self,
        agent: &Agent,
    ) -> Result<std::result::Result<Vec<ResolvedMcpServer>, String>> {
        let mut valid = Vec::new();
        for server_ref in &agent.spec.mcp_servers {
            let name = &server_ref.name;
            let server = match self
                .ctx
                .store
                .try_get::<McpServerSpec>(&ObjectKey::new(agent.namespace(), name))
                .await?
            {
                None => return Ok(Err(format!("MCPServer {:?} not found", name))),
                Some(server) if !server.status.connected => {
                    return Ok(Err(format!("MCPServer {:?} is not connected", name)))
                }
                Some(server) => server,
            };

            let tools = match self.ctx.tool_backend.get_tools(name).await {
                Some(tools) => tools,
                None => server.status.tools,
            };
            valid.push(ResolvedMcpServer {
                name: name.clone(),
                tools: tools.into_iter().map(|t| t.name).collect(),
            });
        }
        Ok(Ok(valid))
    }

    async fn check_channels(
        &self,
        agent: &Agent,
    ) -> Result<std::result::Result<Vec<ResolvedContactChannel>, String>> {
        let mut valid = Vec::new();
        for channel_ref in &agent.spec.human_contact_channels {
            let name = &channel_ref.name;
            let channel = match self
                .ctx
                .store
                .try_get::<ContactChannelSpec>(&ObjectKey::new(agent.namespace(), name))
                .await?
            {
                None => return Ok(Err(format!("ContactChannel {:?} not found", name))),
                Some(channel) if !channel.status.ready => {
                    return Ok(Err(format!("ContactChannel {:?} is not ready", name)))
                }
                Some(channel) => channel,
            };

            let context = match channel.spec.channel_type {
                ChannelType::Slack => channel
                    .spec
                    .slack_config
                    .as_ref()
                    .map(|c| c.context_about_channel_or_user.as_str()),
                ChannelType::Email => channel
                    .spec
                    .email_config
                    .as_ref()
                    .map(|c| c.context_about_user.as_str()),
            };
            if context.unwrap_or_default().is_empty() {
                return Ok(Err(format!(
                    "ContactChannel {:?} needs context about the {} recipient",
                    name, channel.spec.channel_type
                )));
            }
            valid.push(ResolvedContactChannel {
                name: name.clone(),
                channel_type: channel.spec.channel_type,
            });
        }
        Ok(Ok(valid))
    }

    async fn validate(&self, agent: &Agent) -> Result<AgentStatus> {
        let invalid = |detail: String| AgentStatus {
            ready: false,
            status: ReadinessStatus::Error,
            status_detail: detail,
            ..Default::default()
        };

        if let Err(detail) = self.check_llm(agent).await? {
            return Ok(invalid(detail));
        }
        let valid_tools = match self.check_tools(agent).await? {
            Ok(tools) => tools,
            Err(detail) => return Ok(invalid(detail)),
        };
        let valid_mcp_servers = match self.check_mcp_servers(agent).await? {
            Ok(servers) => servers,
            Err(detail) => return Ok(invalid(detail)),
        };
        let valid_human_contact_channels = match self.check_channels(agent).await? {
            Ok(channels) => channels,
            Err(detail) => return Ok(invalid(detail)),
        };

        Ok(AgentStatus {
            ready: true,
            status: ReadinessStatus::Ready,
            status_detail: "All dependencies validated successfully".to_string(),
            valid_tools,
            valid_mcp_servers,
            valid_human_contact_channels,
        })
    }
}

#[async_trait]
impl Reconciler for AgentReconciler {
    fn kind(&self) -> Kind {
        Kind::Agent
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut agent) = self.ctx.store.try_get::<AgentSpec>(key).await? else {
            return Ok(Action::done());
        };

        let status = self.validate(&agent).await?;
        let action = if status.ready {
            Action::done()
        } else {
            Action::requeue_after(self.ctx.requeue_delay())
        };
        if status == agent.status {
            return Ok(action);
        }

        debug!("Agent {}: {}", key, status.status_detail);
        if status.ready {
            self.ctx.events.normal(
                Kind::Agent,
                key,
                "ValidationSucceeded",
                status.status_detail.clone(),
            );
        } else {
            self.ctx.events.warning(
                Kind::Agent,
                key,
                "ValidationFailed",
                status.status_detail.clone(),
            );
        }
        agent.status = status;
        self.ctx
            .store
            .update_status(&agent)
            .await
            .with_context(|| format!("Failed to update Agent {}", key))?;
        Ok(action)
    }
}
