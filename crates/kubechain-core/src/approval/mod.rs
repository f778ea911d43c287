//! Human approval
//!
//! Tool calls routed through a contact channel are registered with an
//! approval backend, then polled until a human responds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::api::{ChannelType, ContactChannel};

mod humanlayer;

pub use humanlayer::{HumanLayerClient, HumanLayerClientFactory};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval API returned {status}: {body}")]
    Api { status: u16, body: String },
    /// A request with this call id was already accepted
    #[error("approval already requested for call {0}")]
    AlreadyRequested(String),
    #[error("approval transport error: {0}")]
    Transport(String),
    #[error("invalid approval response: {0}")]
    InvalidResponse(String),
    #[error("contact channel is missing its {0} configuration")]
    MissingChannelConfig(ChannelType),
}

/// The function a human is asked to approve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    #[serde(rename = "fn")]
    pub fn_name: String,
    pub kwargs: Map<String, Value>,
}

/// Where the approval request is sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelConfig {
    Slack {
        channel_or_user_id: String,
        context_about_channel_or_user: String,
    },
    Email {
        address: String,
        context_about_user: String,
    },
}

impl ChannelConfig {
    pub fn from_contact_channel(channel: &ContactChannel) -> Result<Self, ApprovalError> {
        match channel.spec.channel_type {
            ChannelType::Slack => {
                let slack = channel
                    .spec
                    .slack_config
                    .as_ref()
                    .ok_or(ApprovalError::MissingChannelConfig(ChannelType::Slack))?;
                Ok(ChannelConfig::Slack {
                    channel_or_user_id: slack.channel_or_user_id.clone(),
                    context_about_channel_or_user: slack.context_about_channel_or_user.clone(),
                })
            }
            ChannelType::Email => {
                let email = channel
                    .spec
                    .email_config
                    .as_ref()
                    .ok_or(ApprovalError::MissingChannelConfig(ChannelType::Email))?;
                Ok(ChannelConfig::Email {
                    address: email.address.clone(),
                    context_about_user: email.context_about_user.clone(),
                })
            }
        }
    }
}

/// Approval state as reported by the backend
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FunctionCallStatus {
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
    /// `None` until a human responds
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[async_trait]
pub trait ApprovalClient: Send + Sync {
    async fn request_approval(
        &self,
        channel: &ChannelConfig,
        spec: &FunctionSpec,
        call_id: &str,
        run_id: &str,
    ) -> Result<(), ApprovalError>;

    async fn get_status(&self, call_id: &str) -> Result<FunctionCallStatus, ApprovalError>;
}

/// Builds clients bound to a contact channel's API key
pub trait ApprovalClientFactory: Send + Sync {
    fn create(&self, api_key: &str) -> Arc<dyn ApprovalClient>;
}
