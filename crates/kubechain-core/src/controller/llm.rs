//! LLM controller: checks the provider and its API key secret

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::Context;
use crate::api::{Kind, Llm, LlmSpec, LlmStatus, ObjectKey, ReadinessStatus};
use crate::runtime::{Action, Reconciler};
use crate::store::ResourceStoreExt;

const SUPPORTED_PROVIDERS: &[&str] = &["openai"];

pub struct LlmReconciler {
    ctx: Arc<Context>,
}

impl LlmReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn validate(&self, llm: &Llm) -> std::result::Result<(), String> {
        if !SUPPORTED_PROVIDERS.contains(&llm.spec.provider.as_str()) {
            return Err(format!("unsupported provider {:?}", llm.spec.provider));
        }
        let source = llm
            .spec
            .api_key_from
            .as_ref()
            .ok_or_else(|| "apiKeyFrom is required".to_string())?;
        let key = self
            .ctx
            .secrets
            .get_ref(llm.namespace(), &source.secret_key_ref)
            .await
            .map_err(|e| format!("Failed to get API key secret: {}", e))?;
        if key.is_empty() {
            return Err("API key is empty".to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for LlmReconciler {
    fn kind(&self) -> Kind {
        Kind::Llm
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut llm) = self.ctx.store.try_get::<LlmSpec>(key).await? else {
            return Ok(Action::done());
        };

        let status = match self.validate(&llm).await {
            Ok(()) => LlmStatus {
                ready: true,
                status: ReadinessStatus::Ready,
                status_detail: format!("{} provider validated successfully", llm.spec.provider),
            },
            Err(detail) => LlmStatus {
                ready: false,
                status: ReadinessStatus::Error,
                status_detail: detail,
            },
        };
        if status == llm.status {
            return Ok(Action::done());
        }

        if status.ready {
            self.ctx
                .events
                .normal(Kind::Llm, key, "ValidationSucceeded", status.status_detail.clone());
        } else {
            self.ctx
                .events
                .warning(Kind::Llm, key, "ValidationFailed", status.status_detail.clone());
        }
        llm.status = status;
        self.ctx
            .store
            .update_status(&llm)
            .await
            .with_context(|| format!("Failed to update LLM {}", key))?;
        Ok(Action::done())
    }
}
