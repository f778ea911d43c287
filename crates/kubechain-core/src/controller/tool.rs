//! Tool controller

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::Context;
use crate::api::{Kind, ObjectKey, ReadinessStatus, ToolSpec, ToolStatus};
use crate::runtime::{Action, Reconciler};
use crate::store::ResourceStoreExt;

pub struct ToolReconciler {
    ctx: Arc<Context>,
}

impl ToolReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

fn validate(spec: &ToolSpec) -> std::result::Result<(), String> {
    match &spec.parameters {
        None | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err("Invalid Parameters JSON".to_string()),
    }
}

#[async_trait]
impl Reconciler for ToolReconciler {
    fn kind(&self) -> Kind {
        Kind::Tool
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut tool) = self.ctx.store.try_get::<ToolSpec>(key).await? else {
            return Ok(Action::done());
        };

        let status = match validate(&tool.spec) {
            Ok(()) => ToolStatus {
                ready: true,
                status: ReadinessStatus::Ready,
                status_detail: "Tool validation successful".to_string(),
            },
            Err(detail) => ToolStatus {
                ready: false,
                status: ReadinessStatus::Error,
                status_detail: detail,
            },
        };
        if status == tool.status {
            return Ok(Action::done());
        }

        if !status.ready {
            self.ctx
                .events
                .warning(Kind::Tool, key, "ValidationFailed", status.status_detail.clone());
        }
        tool.status = status;
        self.ctx
            .store
            .update_status(&tool)
            .await
            .with_context(|| format!("Failed to update Tool {}", key))?;
        Ok(Action::done())
    }
}
