//! ContactChannel controller
//!
//! Checks that the channel config matches its type and that the HumanLayer
//! API key secret is present.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use super::Context;
use crate::api::{
    ChannelType, ContactChannel, ContactChannelSpec, ContactChannelStatus, Kind, ObjectKey,
    ReadinessStatus,
};
use crate::runtime::{Action, Reconciler};
use crate::store::ResourceStoreExt;

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").unwrap());

pub struct ContactChannelReconciler {
    ctx: Arc<Context>,
}

fn validate_config(spec: &ContactChannelSpec) -> std::result::Result<(), String> {
    match spec.channel_type {
        ChannelType::Slack => {
            let slack = spec
                .slack_config
                .as_ref()
                .ok_or_else(|| "slackConfig is required for slack channel type".to_string())?;
            if slack.channel_or_user_id.is_empty() {
                return Err("slackConfig.channelOrUserID is required".to_string());
            }
        }
        ChannelType::Email => {
            let email = spec
                .email_config
                .as_ref()
                .ok_or_else(|| "emailConfig is required for email channel type".to_string())?;
            if !EMAIL.is_match(&email.address) {
                return Err(format!("invalid email address {:?}", email.address));
            }
        }
    }
    Ok(())
}

impl ContactChannelReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn validate(&self, channel: &ContactChannel) -> std::result::Result<(), String> {
        validate_config(&channel.spec)?;
        let key = self
            .ctx
            .secrets
            .get_ref(channel.namespace(), &channel.spec.api_key_from.secret_key_ref)
            .await
            .map_err(|e| format!("Failed to get API key secret: {}", e))?;
        if key.is_empty() {
            return Err("API key is empty".to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ContactChannelReconciler {
    fn kind(&self) -> Kind {
        Kind::ContactChannel
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut channel) = self.ctx.store.try_get::<ContactChannelSpec>(key).await? else {
            return Ok(Action::done());
        };

        let status = match self.validate(&channel).await {
            Ok(()) => ContactChannelStatus {
                ready: true,
                status: ReadinessStatus::Ready,
                status_detail: format!(
                    "HumanLayer {} channel validated successfully",
                    channel.spec.channel_type
                ),
            },
            Err(detail) => ContactChannelStatus {
                ready: false,
                status: ReadinessStatus::Error,
                status_detail: detail,
            },
        };
        if status == channel.status {
            return Ok(Action::done());
        }

        if status.ready {
            self.ctx.events.normal(
                Kind::ContactChannel,
                key,
                "ValidationSucceeded",
                status.status_detail.clone(),
            );
        } else {
            self.ctx.events.warning(
                Kind::ContactChannel,
                key,
                "ValidationFailed",
                status.status_detail.clone(),
            );
        }
        channel.status = status;
        self.ctx
            .store
            .update_status(&channel)
            .await
            .with_context(|| format!("Failed to update ContactChannel {}", key))?;
        Ok(Action::done())
    }
}
