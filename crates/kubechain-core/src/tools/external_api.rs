//! External API tools
//!
//! A tool with `execute.externalAPI` is invoked through an `ExternalApiClient`.
//! Clients come from a `ToolBackendRegistry` built at startup and handed to
//! the controllers; a tool name maps to a factory, with an optional default.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::api::ExternalApiSpec;
use crate::approval::FunctionSpec;

#[async_trait]
pub trait ExternalApiClient: Send + Sync {
    async fn call(&self, run_id: &str, call_id: &str, spec: &FunctionSpec) -> Result<Value>;
}

pub trait ExternalApiClientFactory: Send + Sync {
    /// Client for one tool, authenticated with its resolved credential
    fn create(&self, api: &ExternalApiSpec, credential: &str) -> Result<Arc<dyn ExternalApiClient>>;
}

/// Maps tool names to external API client factories
#[derive(Default, Clone)]
pub struct ToolBackendRegistry {
    factories: HashMap<String, Arc<dyn ExternalApiClientFactory>>,
    fallback: Option<Arc<dyn ExternalApiClientFactory>>,
}

impl ToolBackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose fallback posts to the tool's configured URL
    pub fn with_http_default() -> Self {
        Self::new().with_fallback(Arc::new(HttpExternalApiFactory::default()))
    }

    pub fn register(mut self, tool: impl Into<String>, factory: Arc<dyn ExternalApiClientFactory>) -> Self {
        self.factories.insert(tool.into(), factory);
        self
    }

    pub fn with_fallback(mut self, factory: Arc<dyn ExternalApiClientFactory>) -> Self {
        self.fallback = Some(factory);
        self
    }

    pub fn client_for(
        &self,
        tool: &str,
        api: &ExternalApiSpec,
        credential: &str,
    ) -> Result<Arc<dyn ExternalApiClient>> {
        let factory = self
            .factories
            .get(tool)
            .or(self.fallback.as_ref())
            .ok_or_else(|| anyhow!("no external API client registered for tool {:?}", tool))?;
        factory.create(api, credential)
    }
}

#[derive(Serialize)]
struct CallBody<'a> {
    run_id: &'a str,
    call_id: &'a str,
    spec: &'a FunctionSpec,
}

/// Sends the call spec to a configured endpoint
pub struct HttpExternalApiClient {
    http: reqwest::Client,
    url: String,
    method: reqwest::Method,
    credential: String,
}

#[async_trait]
impl ExternalApiClient for HttpExternalApiClient {
    async fn call(&self, run_id: &str, call_id: &str, spec: &FunctionSpec) -> Result<Value> {
        debug!("{} {} fn={}", self.method, self.url, spec.fn_name);
        let mut request = self
            .http
            .request(self.method.clone(), &self.url)
            .json(&CallBody {
                run_id,
                call_id,
                spec,
            });
        if !self.credential.is_empty() {
            request = request.bearer_auth(&self.credential);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("external API returned {}: {}", status, body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

#[derive(Default)]
pub struct HttpExternalApiFactory {
    http: reqwest::Client,
}

impl ExternalApiClientFactory for HttpExternalApiFactory {
    fn create(&self, api: &ExternalApiSpec, credential: &str) -> Result<Arc<dyn ExternalApiClient>> {
        if api.url.is_empty() {
            return Err(anyhow!("externalAPI url is required"));
        }
        let method = reqwest::Method::from_bytes(api.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| anyhow!("invalid HTTP method {:?}", api.method))?;
        Ok(Arc::new(HttpExternalApiClient {
            http: self.http.clone(),
            url: api.url.clone(),
            method,
            credential: credential.to_string(),
        }))
    }
}
