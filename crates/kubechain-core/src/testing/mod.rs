//! Test doubles for the client seams and fixtures for controller tests

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::api::{
    Agent, AgentSpec, BuiltinToolSpec, ExternalApiSpec, Llm, LlmSpec, LocalObjectReference,
    McpToolInfo, Message, Object, ReadinessStatus, ResourceSpec, Secret, SecretKeySource, Task,
    TaskSpec, Tool, ToolExecute, ToolSpec,
};
use crate::approval::{
    ApprovalClient, ApprovalClientFactory, ApprovalError, ChannelConfig, FunctionCallStatus,
    FunctionSpec,
};
use crate::config::KubechainConfig;
use crate::controller::Context;
use crate::events::EventRecorder;
use crate::llm::{LlmClient, LlmClientFactory, LlmError, ToolDescriptor};
use crate::mcp::ToolBackend;
use crate::secrets::StoreSecrets;
use crate::store::{MemoryStore, ResourceStore, ResourceStoreExt};
use crate::tools::{ExternalApiClient, ExternalApiClientFactory, ToolBackendRegistry};

// ── LLM ────────────────────────────────────────────────────────────────

/// Replays scripted replies and records every request
#[derive(Default)]
pub struct FakeLlm {
    replies: Mutex<VecDeque<Result<Message, LlmError>>>,
    pub requests: Mutex<Vec<(Vec<Message>, Vec<ToolDescriptor>)>>,
    pub api_keys: Mutex<Vec<String>>,
}

impl FakeLlm {
    pub fn reply(&self, reply: Result<Message, LlmError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn send_request(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<Message, LlmError> {
        self.requests
            .lock()
            .push((messages.to_vec(), tools.to_vec()));
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Transport("no scripted reply".into())))
    }
}

pub struct FakeLlmFactory(pub Arc<FakeLlm>);

impl LlmClientFactory for FakeLlmFactory {
    fn create(&self, _llm: &Llm, api_key: &str) -> Result<Arc<dyn LlmClient>> {
        self.0.api_keys.lock().push(api_key.to_string());
        Ok(self.0.clone())
    }
}

// ── Approval ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeApproval {
    pub requests: Mutex<Vec<(ChannelConfig, FunctionSpec, String, String)>>,
    pub status: Mutex<FunctionCallStatus>,
    pub fail_requests: Mutex<bool>,
    pub polls: Mutex<usize>,
}

impl FakeApproval {
    pub fn respond(&self, approved: bool, comment: Option<&str>) {
        let mut status = self.status.lock();
        status.approved = Some(approved);
        status.comment = comment.map(str::to_string);
    }
}

#[async_trait]
impl ApprovalClient for FakeApproval {
    async fn request_approval(
        &self,
        channel: &ChannelConfig,
        spec: &FunctionSpec,
        call_id: &str,
        run_id: &str,
    ) -> Result<(), ApprovalError> {
        if *self.fail_requests.lock() {
            return Err(ApprovalError::Api {
                status: 500,
                body: "internal error".into(),
            });
        }
        let mut requests = self.requests.lock();
        if requests.iter().any(|(_, _, id, _)| id == call_id) {
            return Err(ApprovalError::AlreadyRequested(call_id.to_string()));
        }
        requests.push((
            channel.clone(),
            spec.clone(),
            call_id.to_string(),
            run_id.to_string(),
        ));
        Ok(())
    }

    async fn get_status(&self, _call_id: &str) -> Result<FunctionCallStatus, ApprovalError> {
        *self.polls.lock() += 1;
        Ok(self.status.lock().clone())
    }
}

pub struct FakeApprovalFactory(pub Arc<FakeApproval>);

impl ApprovalClientFactory for FakeApprovalFactory {
    fn create(&self, _api_key: &str) -> Arc<dyn ApprovalClient> {
        self.0.clone()
    }
}

// ── MCP tool backend ───────────────────────────────────────────────────

/// In-memory backend; a server is "connected" when it has a tool list
#[derive(Default)]
pub struct FakeToolBackend {
    pub tools: Mutex<HashMap<String, Vec<McpToolInfo>>>,
    pub outputs: Mutex<HashMap<String, Result<String, String>>>,
    pub calls: Mutex<Vec<(String, String, Value)>>,
}

impl FakeToolBackend {
    pub fn add_server(&self, server: &str, tools: &[&str]) {
        let tools = tools
            .iter()
            .map(|name| McpToolInfo {
                name: name.to_string(),
                description: format!("{} tool", name),
                input_schema: Value::Null,
            })
            .collect();
        self.tools.lock().insert(server.to_string(), tools);
    }

    pub fn set_output(&self, tool: &str, output: Result<&str, &str>) {
        self.outputs.lock().insert(
            tool.to_string(),
            output.map(str::to_string).map_err(str::to_string),
        );
    }
}

#[async_trait]
impl ToolBackend for FakeToolBackend {
    async fn get_tools(&self, server: &str) -> Option<Vec<McpToolInfo>> {
        self.tools.lock().get(server).cloned()
    }

    async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> Result<String> {
        self.calls
            .lock()
            .push((server.to_string(), tool.to_string(), arguments));
        match self.outputs.lock().get(tool) {
            Some(Ok(text)) => Ok(text.clone()),
            Some(Err(text)) => Err(anyhow!("tool execution error: {}", text)),
            None => Ok(String::new()),
        }
    }
}

// ── External API ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeExternalApi {
    pub calls: Mutex<Vec<(String, String, FunctionSpec)>>,
    pub credentials: Mutex<Vec<String>>,
    pub response: Mutex<Option<Value>>,
}

#[async_trait]
impl ExternalApiClient for FakeExternalApi {
    async fn call(&self, run_id: &str, call_id: &str, spec: &FunctionSpec) -> Result<Value> {
        self.calls
            .lock()
            .push((run_id.to_string(), call_id.to_string(), spec.clone()));
        self.response
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("connection refused"))
    }
}

pub struct FakeExternalApiFactory(pub Arc<FakeExternalApi>);

impl ExternalApiClientFactory for FakeExternalApiFactory {
    fn create(
        &self,
        _api: &ExternalApiSpec,
        credential: &str,
    ) -> Result<Arc<dyn ExternalApiClient>> {
        self.0.credentials.lock().push(credential.to_string());
        Ok(self.0.clone())
    }
}

// ── Fixtures ───────────────────────────────────────────────────────────

/// Handles to every fake behind a test `Context`
pub struct Fakes {
    pub store: Arc<MemoryStore>,
    pub events: Arc<EventRecorder>,
    pub llm: Arc<FakeLlm>,
    pub approval: Arc<FakeApproval>,
    pub backend: Arc<FakeToolBackend>,
    pub external: Arc<FakeExternalApi>,
}

/// Controller context wired to fakes over a fresh in-memory store
pub fn context() -> (Arc<Context>, Fakes) {
    context_with(KubechainConfig::default())
}

pub fn context_with(config: KubechainConfig) -> (Arc<Context>, Fakes) {
    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(EventRecorder::default());
    let llm = Arc::new(FakeLlm::default());
    let approval = Arc::new(FakeApproval::default());
    let backend = Arc::new(FakeToolBackend::default());
    let external = Arc::new(FakeExternalApi::default());

    let dyn_store: Arc<dyn ResourceStore> = store.clone();
    let ctx = Context {
        store: dyn_store.clone(),
        events: events.clone(),
        secrets: Arc::new(StoreSecrets::new(dyn_store)),
        llm_factory: Arc::new(FakeLlmFactory(llm.clone())),
        tool_backend: backend.clone(),
        approvals: Arc::new(FakeApprovalFactory(approval.clone())),
        external_apis: ToolBackendRegistry::new()
            .with_fallback(Arc::new(FakeExternalApiFactory(external.clone()))),
        config,
    };

    (
        Arc::new(ctx),
        Fakes {
            store,
            events,
            llm,
            approval,
            backend,
            external,
        },
    )
}

/// Create `obj`, then write its status as given
pub async fn create_with_status<S: ResourceSpec>(
    store: &dyn ResourceStore,
    obj: Object<S>,
) -> Object<S> {
    let status = obj.status.clone();
    let mut created = store.create(obj).await.unwrap();
    created.status = status;
    store.update_status(&created).await.unwrap()
}

pub const NS: &str = "default";

/// Secret `openai` (`OPENAI_API_KEY`), ready LLM `gpt`, ready builtin Tool
/// `add`, and Agent `calc` using them, ready when `agent_ready` is set
pub async fn seed_agent(store: &dyn ResourceStore, agent_ready: bool) -> Agent {
    store
        .create(Secret::with_data(NS, "openai", [("OPENAI_API_KEY", "sk-test")]))
        .await
        .unwrap();

    let mut llm = Llm::new(
        NS,
        "gpt",
        LlmSpec {
            provider: "openai".into(),
            api_key_from: Some(SecretKeySource::new("openai", "OPENAI_API_KEY")),
            ..Default::default()
        },
    );
    llm.status.ready = true;
    llm.status.status = ReadinessStatus::Ready;
    create_with_status(store, llm).await;

    let mut tool = Tool::new(
        NS,
        "add",
        ToolSpec {
            description: "add two numbers".into(),
            parameters: Some(serde_json::json!({
                "type": "object",
                "properties": { "a": { "type": "number" }, "b": { "type": "number" } }
            })),
            execute: ToolExecute {
                builtin: Some(BuiltinToolSpec { name: "add".into() }),
                external_api: None,
            },
            ..Default::default()
        },
    );
    tool.status.ready = true;
    tool.status.status = ReadinessStatus::Ready;
    create_with_status(store, tool).await;

    let mut agent = Agent::new(
        NS,
        "calc",
        AgentSpec {
            llm_ref: LocalObjectReference::new("gpt"),
            tools: vec![LocalObjectReference::new("add")],
            system: "You are a calculator.".into(),
            ..Default::default()
        },
    );
    if agent_ready {
        agent.status.ready = true;
        agent.status.status = ReadinessStatus::Ready;
    }
    create_with_status(store, agent).await
}

/// Task `calc-task` asking agent `calc` a question, optionally marked ready
pub async fn seed_task(store: &dyn ResourceStore, ready: bool) -> Task {
    let mut task = Task::new(
        NS,
        "calc-task",
        TaskSpec {
            agent_ref: LocalObjectReference::new("calc"),
            user_message: "What is 2 + 3?".into(),
        },
    );
    if ready {
        task.status.ready = true;
        task.status.status = ReadinessStatus::Ready;
    }
    create_with_status(store, task).await
}
