//! Agent, LLM, ContactChannel, MCPServer and Secret resources
//!
//! These are the dependencies a TaskRun reads; their controllers only
//! validate them and publish readiness.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::meta::{
    Kind, LocalObjectReference, Object, ReadinessStatus, ResourceSpec, SecretKeyRef,
    SecretKeySource,
};

// ── Agent ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub llm_ref: LocalObjectReference,
    #[serde(default)]
    pub tools: Vec<LocalObjectReference>,
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: Vec<LocalObjectReference>,
    #[serde(default)]
    pub human_contact_channels: Vec<LocalObjectReference>,
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub status: ReadinessStatus,
    #[serde(default)]
    pub status_detail: String,
    #[serde(default)]
    pub valid_tools: Vec<LocalObjectReference>,
    #[serde(default, rename = "validMCPServers")]
    pub valid_mcp_servers: Vec<ResolvedMcpServer>,
    #[serde(default)]
    pub valid_human_contact_channels: Vec<ResolvedContactChannel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMcpServer {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedContactChannel {
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
}

impl ResourceSpec for AgentSpec {
    const KIND: Kind = Kind::Agent;
    type Status = AgentStatus;
}

pub type Agent = Object<AgentSpec>;

// ── LLM ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmSpec {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_from: Option<SecretKeySource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub status: ReadinessStatus,
    #[serde(default)]
    pub status_detail: String,
}

impl ResourceSpec for LlmSpec {
    const KIND: Kind = Kind::Llm;
    type Status = LlmStatus;
}

pub type Llm = Object<LlmSpec>;

// ── ContactChannel ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Slack,
    Email,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::Slack => write!(f, "slack"),
            ChannelType::Email => write!(f, "email"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactChannelSpec {
    pub channel_type: ChannelType,
    pub api_key_from: SecretKeySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_config: Option<SlackChannelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_config: Option<EmailChannelConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackChannelConfig {
    #[serde(rename = "channelOrUserID")]
    pub channel_or_user_id: String,
    #[serde(default)]
    pub context_about_channel_or_user: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailChannelConfig {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub context_about_user: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactChannelStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub status: ReadinessStatus,
    #[serde(default)]
    pub status_detail: String,
}

impl ResourceSpec for ContactChannelSpec {
    const KIND: Kind = Kind::ContactChannel;
    type Status = ContactChannelStatus;
}

pub type ContactChannel = Object<ContactChannelSpec>;

// ── MCPServer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportType {
    Stdio,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerSpec {
    pub transport: McpTransportType,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub url: String,
    /// Calls to this server's tools wait for human sign-off on this channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_contact_channel: Option<LocalObjectReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<SecretKeySource>,
}

/// Tool advertised by a connected MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerStatus {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub status: ReadinessStatus,
    #[serde(default)]
    pub status_detail: String,
    #[serde(default)]
    pub tools: Vec<McpToolInfo>,
}

impl ResourceSpec for McpServerSpec {
    const KIND: Kind = Kind::McpServer;
    type Status = McpServerStatus;
}

pub type McpServer = Object<McpServerSpec>;

// ── Secret ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretSpec {
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretStatus {}

impl ResourceSpec for SecretSpec {
    const KIND: Kind = Kind::Secret;
    type Status = SecretStatus;
}

pub type Secret = Object<SecretSpec>;

impl Secret {
    pub fn with_data<'a>(
        namespace: &str,
        name: &str,
        data: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let data = data
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Secret::new(namespace, name, SecretSpec { data })
    }
}

impl SecretKeySource {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            secret_key_ref: SecretKeyRef {
                name: name.into(),
                key: key.into(),
            },
        }
    }
}
