//! HumanLayer function-call approval API

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::{ApprovalClient, ApprovalClientFactory, ApprovalError, ChannelConfig, FunctionCallStatus, FunctionSpec};

#[derive(Debug, Serialize)]
struct FunctionCallRequest<'a> {
    run_id: &'a str,
    call_id: &'a str,
    spec: RequestSpec<'a>,
}

#[derive(Debug, Serialize)]
struct RequestSpec<'a> {
    #[serde(rename = "fn")]
    fn_name: &'a str,
    kwargs: &'a serde_json::Map<String, serde_json::Value>,
    channel: &'a ChannelConfig,
}

#[derive(Debug, Deserialize)]
struct FunctionCallResponse {
    #[serde(default)]
    status: Option<FunctionCallStatus>,
}

pub struct HumanLayerClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl HumanLayerClient {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        let api_base: String = api_base.into();
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/humanlayer/v1/function_calls{}", self.api_base, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApprovalError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApprovalError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ApprovalClient for HumanLayerClient {
    async fn request_approval(
        &self,
        channel: &ChannelConfig,
        spec: &FunctionSpec,
        call_id: &str,
        run_id: &str,
    ) -> Result<(), ApprovalError> {
        let body = FunctionCallRequest {
            run_id,
            call_id,
            spec: RequestSpec {
                fn_name: &spec.fn_name,
                kwargs: &spec.kwargs,
                channel,
            },
        };
        debug!("Requesting approval for {} (call {})", spec.fn_name, call_id);

        let response = self
            .http
            .post(self.url(""))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApprovalError::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(ApprovalError::AlreadyRequested(call_id.to_string()));
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn get_status(&self, call_id: &str) -> Result<FunctionCallStatus, ApprovalError> {
        let response = self
            .http
            .get(self.url(&format!("/{}", call_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ApprovalError::Transport(e.to_string()))?;
        let response = Self::check(response).await?;

        let parsed: FunctionCallResponse = response
            .json()
            .await
            .map_err(|e| ApprovalError::InvalidResponse(e.to_string()))?;
        Ok(parsed.status.unwrap_or_default())
    }
}

pub struct HumanLayerClientFactory {
    api_base: String,
}

impl HumanLayerClientFactory {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }
}

impl ApprovalClientFactory for HumanLayerClientFactory {
    fn create(&self, api_key: &str) -> Arc<dyn ApprovalClient> {
        Arc::new(HumanLayerClient::new(self.api_base.clone(), api_key))
    }
}
