//! TaskRun engine
//!
//! Drives one conversation with the LLM:
//! - `Initializing`/`Pending`: wait for the Task and Agent, seed the context window
//! - `ReadyForLLM` → `SendContextWindowToLLM`: call the LLM
//! - a text reply ends in `FinalAnswer`
//! - tool calls fan out into TaskRunToolCalls (`ToolCallsPending`), whose
//!   results are appended once every sibling is terminal, back to `ReadyForLLM`
//! - rate limits and server errors pass through `ErrorBackoff`
//!
//! The context window is append-only, and every append happens in the same
//! conditional status write as the phase change that caused it.

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Context;
use crate::api::{
    Agent, AgentSpec, Kind, LlmSpec, LocalObjectReference, McpServerSpec, Message, ObjectKey,
    Role, TaskRun, TaskRunPhase, TaskRunSpec, TaskRunStatusType, TaskRunToolCall,
    TaskRunToolCallPhase, TaskRunToolCallSpec, TaskRunToolCallStatus, TaskSpec, ToolCall,
    ToolSpec, ToolType, LABEL_TASK_RUN, LABEL_TOOL_CALL_REQUEST,
};
use crate::llm::{split_mcp_tool_name, LlmError, ToolDescriptor};
use crate::runtime::{Action, Backoff, Reconciler};
use crate::store::{LabelSelector, ResourceStoreExt};

const MAX_LLM_BACKOFF: Duration = Duration::from_secs(300);

/// Name of the `index`th (0-based) tool call child of one LLM response
pub fn tool_call_name(run: &str, request_id: &str, index: usize) -> String {
    format!("{}-{}-tc-{:02}", run, request_id, index + 1)
}

/// Outcome of resolving a run's Task and Agent
enum Inputs {
    Ready { agent: Agent, user_message: String },
    Waiting(String),
    Invalid(String),
}

pub struct TaskRunReconciler {
    ctx: Arc<Context>,
}

impl TaskRunReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn write(&self, run: &TaskRun) -> Result<TaskRun> {
        self.ctx
            .store
            .update_status(run)
            .await
            .with_context(|| format!("Failed to update TaskRun {}", run.key()))
    }

    fn set(run: &mut TaskRun, phase: TaskRunPhase, status: TaskRunStatusType, detail: impl Into<String>) {
        run.status.phase = Some(phase);
        run.status.status = status;
        run.status.ready = status == TaskRunStatusType::Ready;
        run.status.status_detail = detail.into();
        if status != TaskRunStatusType::Error {
            run.status.error.clear();
        }
    }

    /// Terminal failure
    async fn fail(
        &self,
        mut run: TaskRun,
        reason: &str,
        detail: impl Into<String>,
        error: impl Into<String>,
    ) -> Result<Action> {
        let detail = detail.into();
        Self::set(&mut run, TaskRunPhase::Failed, TaskRunStatusType::Error, detail.clone());
        run.status.error = error.into();
        run.status.completion_time = Some(Utc::now());
        self.ctx.events.warning(Kind::TaskRun, &run.key(), reason, detail);
        self.write(&run).await?;
        Ok(Action::done())
    }

    /// Park in `Pending` until a dependency is ready. Writes only on change.
    async fn wait(&self, mut run: TaskRun, detail: String) -> Result<Action> {
        let unchanged = run.status.phase == Some(TaskRunPhase::Pending)
            && run.status.status_detail == detail;
        if !unchanged {
            self.ctx
                .events
                .normal(Kind::TaskRun, &run.key(), "Waiting", detail.clone());
            Self::set(&mut run, TaskRunPhase::Pending, TaskRunStatusType::Pending, detail);
            self.write(&run).await?;
        }
        Ok(Action::requeue_after(self.ctx.requeue_delay()))
    }

    async fn resolve_inputs(&self, run: &TaskRun) -> Result<Inputs> {
        let ns = run.namespace();
        let task_name = &run.spec.task_ref.name;

        let task = if task_name.is_empty() {
            None
        } else {
            match self
                .ctx
                .store
                .try_get::<TaskSpec>(&ObjectKey::new(ns, task_name))
                .await?
            {
                None => {
                    return Ok(Inputs::Waiting(format!(
                        "Waiting for task {:?} to exist",
                        task_name
                    )))
                }
                Some(task) if !task.status.ready => {
                    return Ok(Inputs::Waiting(format!(
                        "Waiting for task {:?} to become ready",
                        task_name
                    )))
                }
                Some(task) => Some(task),
            }
        };

        let agent_name = run
            .spec
            .agent_ref
            .as_ref()
            .or(task.as_ref().map(|t| &t.spec.agent_ref))
            .map(|r| r.name.clone())
            .unwrap_or_default();
        if agent_name.is_empty() {
            return Ok(Inputs::Invalid("agentRef is required".to_string()));
        }

        let agent = match self
            .ctx
            .store
            .try_get::<AgentSpec>(&ObjectKey::new(ns, &agent_name))
            .await?
        {
            None => return Ok(Inputs::Waiting("Waiting for Agent to exist".to_string())),
            Some(agent) if !agent.status.ready => {
                return Ok(Inputs::Waiting(format!(
                    "Waiting for agent {:?} to become ready",
                    agent_name
                )))
            }
            Some(agent) => agent,
        };

        let user_message = run
            .spec
            .user_message
            .clone()
            .or(task.map(|t| t.spec.user_message))
            .unwrap_or_default();
        if user_message.is_empty() {
            return Ok(Inputs::Invalid("userMessage is required".to_string()));
        }

        Ok(Inputs::Ready {
            agent,
            user_message,
        })
    }

    // ── Phases ──────────────────────────────────────────────────────────

    async fn initialize(&self, mut run: TaskRun) -> Result<Action> {
        Self::set(
            &mut run,
            TaskRunPhase::Initializing,
            TaskRunStatusType::Pending,
            "Initializing TaskRun",
        );
        run.status.start_time = Some(Utc::now());
        self.ctx
            .events
            .normal(Kind::TaskRun, &run.key(), "Initializing", "Initializing TaskRun");
        self.write(&run).await?;
        Ok(Action::requeue())
    }

    async fn validate(&self, mut run: TaskRun) -> Result<Action> {
        let (agent, user_message) = match self.resolve_inputs(&run).await? {
            Inputs::Waiting(detail) => return self.wait(run, detail).await,
            Inputs::Invalid(detail) => {
                return self
                    .fail(run, "ValidationFailed", detail.clone(), detail)
                    .await
            }
            Inputs::Ready {
                agent,
                user_message,
            } => (agent, user_message),
        };

        // A run sent back to Pending keeps its conversation
        if run.status.context_window.is_empty() {
            run.status.context_window = vec![
                Message::system(agent.spec.system.clone()),
                Message::user(user_message),
            ];
        }
        Self::set(
            &mut run,
            TaskRunPhase::ReadyForLLM,
            TaskRunStatusType::Ready,
            "Ready to send to LLM",
        );
        self.ctx.events.normal(
            Kind::TaskRun,
            &run.key(),
            "ValidationSucceeded",
            "TaskRun validation succeeded",
        );
        self.write(&run).await?;
        Ok(Action::requeue())
    }

    async fn mark_sending(&self, mut run: TaskRun) -> Result<Action> {
        Self::set(
            &mut run,
            TaskRunPhase::SendContextWindowToLLM,
            TaskRunStatusType::Ready,
            "Sending context window to LLM",
        );
        self.ctx.events.normal(
            Kind::TaskRun,
            &run.key(),
            "SendingContextWindowToLLM",
            "Sending context window to LLM",
        );
        self.write(&run).await?;
        Ok(Action::requeue())
    }

    async fn send_to_llm(&self, run: TaskRun) -> Result<Action> {
        let agent = match self.resolve_inputs(&run).await? {
            Inputs::Ready { agent, .. } => agent,
            Inputs::Waiting(detail) => return self.wait(run, detail).await,
            Inputs::Invalid(detail) => {
                return self
                    .fail(run, "ValidationFailed", detail.clone(), detail)
                    .await
            }
        };
        let ns = run.namespace().to_string();

        let llm_name = &agent.spec.llm_ref.name;
        let llm = match self
            .ctx
            .store
            .try_get::<LlmSpec>(&ObjectKey::new(&ns, llm_name))
            .await?
        {
            None => return self.wait(run, format!("Waiting for LLM {:?} to exist", llm_name)).await,
            Some(llm) if !llm.status.ready => {
                return self
                    .wait(run, format!("Waiting for LLM {:?} to become ready", llm_name))
                    .await
            }
            Some(llm) => llm,
        };

        let Some(key_source) = llm.spec.api_key_from.as_ref() else {
            let msg = format!("LLM {:?} has no apiKeyFrom", llm_name);
            return self
                .fail(run, "ValidationFailed", format!("Failed to get API key secret: {}", msg), msg)
                .await;
        };
        let api_key = match self.ctx.secrets.get_ref(&ns, &key_source.secret_key_ref).await {
            Ok(key) => key,
            Err(e) => {
                return self
                    .fail(
                        run,
                        "ValidationFailed",
                        format!("Failed to get API key secret: {}", e),
                        e.to_string(),
                    )
                    .await
            }
        };
        if api_key.is_empty() {
            return self
                .fail(run, "EmptyAPIKey", "API key is empty", "API key is empty")
                .await;
        }

        let client = match self.ctx.llm_factory.create(&llm, &api_key) {
            Ok(client) => client,
            Err(e) => {
                return self
                    .fail(
                        run,
                        "LLMClientCreationFailed",
                        format!("Failed to create LLM client: {}", e),
                        e.to_string(),
                    )
                    .await
            }
        };

        let tools = self.collect_tools(&ns, &agent).await?;
        debug!(
            "Sending {} messages and {} tools for TaskRun {}",
            run.status.context_window.len(),
            tools.len(),
            run.key()
        );

        match client.send_request(&run.status.context_window, &tools).await {
            Ok(reply) => self.handle_reply(run, reply).await,
            Err(e) => self.handle_llm_error(run, e).await,
        }
    }

    async fn handle_llm_error(&self, mut run: TaskRun, err: LlmError) -> Result<Action> {
        let detail = format!("LLM request failed: {}", err);
        warn!("TaskRun {}: {}", run.key(), detail);

        if err.is_retryable() && run.status.llm_attempts < self.ctx.config.llm.max_retries {
            run.status.llm_attempts += 1;
            let delay = Backoff {
                base: self.ctx.requeue_delay(),
                max: MAX_LLM_BACKOFF,
            }
            .delay(run.status.llm_attempts - 1);

            Self::set(
                &mut run,
                TaskRunPhase::ErrorBackoff,
                TaskRunStatusType::Error,
                detail.clone(),
            );
            run.status.error = err.to_string();
            run.status.retry_after = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d);
            self.ctx
                .events
                .warning(Kind::TaskRun, &run.key(), "LLMRequestFailed", detail);
            self.write(&run).await?;
            return Ok(Action::requeue_after(delay));
        }

        let reason = if err.is_client_error() {
            "LLMRequestFailed4xx"
        } else {
            "LLMRequestFailed"
        };
        self.fail(run, reason, detail, err.to_string()).await
    }

    async fn handle_reply(&self, mut run: TaskRun, reply: Message) -> Result<Action> {
        run.status.llm_attempts = 0;
        run.status.retry_after = None;

        if reply.has_tool_calls() {
            let request_id = uuid::Uuid::new_v4().simple().to_string()[..7].to_string();
            info!(
                "TaskRun {} requested {} tool calls (request {})",
                run.key(),
                reply.tool_calls.len(),
                request_id
            );

            let mut message = Message::assistant_tool_calls(reply.tool_calls);
            message.content = reply.content;
            run.status.context_window.push(message);
            run.status.tool_call_request_id = request_id;
            run.status.output.clear();
            Self::set(
                &mut run,
                TaskRunPhase::ToolCallsPending,
                TaskRunStatusType::Ready,
                "LLM response received, tool calls pending",
            );
            self.ctx.events.normal(
                Kind::TaskRun,
                &run.key(),
                "ToolCallsPending",
                "LLM response received, tool calls pending",
            );

            // Persist the request before creating children so a retry reuses it
            let run = self.write(&run).await?;
            self.ensure_tool_calls(&run).await?;
            return Ok(Action::requeue_after(self.ctx.requeue_delay()));
        }

        if reply.content.is_empty() {
            return self
                .fail(
                    run,
                    "LLMRequestFailed",
                    "invalid LLM response",
                    "invalid LLM response: neither content nor tool calls",
                )
                .await;
        }

        run.status.output = reply.content.clone();
        run.status.context_window.push(Message::assistant(reply.content));
        run.status.completion_time = Some(Utc::now());
        Self::set(
            &mut run,
            TaskRunPhase::FinalAnswer,
            TaskRunStatusType::Ready,
            "LLM final response received",
        );
        self.ctx.events.normal(
            Kind::TaskRun,
            &run.key(),
            "LLMFinalAnswer",
            "LLM response received successfully",
        );
        self.write(&run).await?;
        Ok(Action::done())
    }

    /// Tool calls of the assistant message that opened the current request
    fn pending_calls(run: &TaskRun) -> Result<&[ToolCall]> {
        match run
            .status
            .context_window
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
        {
            Some(message) if message.has_tool_calls() => Ok(&message.tool_calls),
            _ => bail!("TaskRun {} has no pending tool calls", run.key()),
        }
    }

    /// Create any missing child for the current request; returns how many were created
    async fn ensure_tool_calls(&self, run: &TaskRun) -> Result<usize> {
        let request_id = &run.status.tool_call_request_id;
        if request_id.is_empty() {
            bail!("TaskRun {} has no tool call request id", run.key());
        }
        let calls = Self::pending_calls(run)?;

        let existing: Vec<String> = self
            .ctx
            .store
            .list::<TaskRunToolCallSpec>(
                run.namespace(),
                &LabelSelector::everything().with(LABEL_TOOL_CALL_REQUEST, request_id.as_str()),
            )
            .await?
            .into_iter()
            .map(|tc| tc.metadata.name)
            .collect();

        let mut created = 0;
        for (index, call) in calls.iter().enumerate() {
            let name = tool_call_name(run.name(), request_id, index);
            if existing.contains(&name) {
                continue;
            }

            let (tool_ref, tool_type) = self
                .resolve_tool_ref(run.namespace(), &call.function.name)
                .await?;
            let mut child = TaskRunToolCall::new(
                run.namespace(),
                &name,
                TaskRunToolCallSpec {
                    tool_call_id: call.id.clone(),
                    task_run_ref: LocalObjectReference::new(run.name()),
                    tool_ref: LocalObjectReference::new(tool_ref),
                    tool_type,
                    arguments: call.function.arguments.clone(),
                },
            );
            child.metadata = child
                .metadata
                .with_label(LABEL_TASK_RUN, run.name())
                .with_label(LABEL_TOOL_CALL_REQUEST, request_id.as_str())
                .with_owner(run.controller_ref());

            match self.ctx.store.create(child).await {
                Ok(_) => {
                    created += 1;
                    self.ctx.events.normal(
                        Kind::TaskRun,
                        &run.key(),
                        "ToolCallCreated",
                        format!("Created TaskRunToolCall {}", name),
                    );
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create TaskRunToolCall {}", name))
                }
            }
        }
        Ok(created)
    }

    /// Map the function name the LLM used back to a Tool resource or MCP tool
    async fn resolve_tool_ref(&self, ns: &str, function: &str) -> Result<(String, Option<ToolType>)> {
        let store = &self.ctx.store;
        if let Some(tool) = store.try_get::<ToolSpec>(&ObjectKey::new(ns, function)).await? {
            return Ok((function.to_string(), tool.kind().map(|k| k.tool_type())));
        }
        if split_mcp_tool_name(function).is_some() {
            return Ok((function.to_string(), Some(ToolType::Mcp)));
        }
        let named = store
            .list::<ToolSpec>(ns, &LabelSelector::everything())
            .await?
            .into_iter()
            .find(|t| t.function_name() == function);
        Ok(match named {
            Some(tool) => (tool.name().to_string(), tool.kind().map(|k| k.tool_type())),
            None => (function.to_string(), None),
        })
    }

    /// Tool descriptors offered to the LLM for `agent`
    async fn collect_tools(&self, ns: &str, agent: &Agent) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();

        for tool_ref in &agent.spec.tools {
            match self
                .ctx
                .store
                .try_get::<ToolSpec>(&ObjectKey::new(ns, &tool_ref.name))
                .await?
            {
                Some(tool) => tools.push(ToolDescriptor::from_tool(&tool)),
                None => warn!("Agent {} references missing tool {}", agent.key(), tool_ref.name),
            }
        }

        for server in &agent.spec.mcp_servers {
            if let Some(server_tools) = self.ctx.tool_backend.get_tools(&server.name).await {
                tools.extend(
                    server_tools
                        .iter()
                        .map(|t| ToolDescriptor::from_mcp(&server.name, t)),
                );
                continue;
            }
            // Not connected in this process; fall back to the last published list
            match self
                .ctx
                .store
                .try_get::<McpServerSpec>(&ObjectKey::new(ns, &server.name))
                .await?
            {
                Some(mcp) if mcp.status.connected => tools.extend(
                    mcp.status
                        .tools
                        .iter()
                        .map(|t| ToolDescriptor::from_mcp(&server.name, t)),
                ),
                _ => warn!("MCP server {} is not connected", server.name),
            }
        }

        Ok(tools)
    }

    async fn check_tool_calls(&self, mut run: TaskRun) -> Result<Action> {
        if self.ensure_tool_calls(&run).await? > 0 {
            return Ok(Action::requeue_after(self.ctx.requeue_delay()));
        }

        let children: HashMap<String, TaskRunToolCall> = self
            .ctx
            .store
            .list::<TaskRunToolCallSpec>(
                run.namespace(),
                &LabelSelector::everything()
                    .with(LABEL_TOOL_CALL_REQUEST, run.status.tool_call_request_id.as_str()),
            )
            .await?
            .into_iter()
            .map(|tc| (tc.metadata.name.clone(), tc))
            .collect();

        let calls = Self::pending_calls(&run)?.to_vec();
        let mut results = Vec::with_capacity(calls.len());
        for (index, call) in calls.iter().enumerate() {
            let name = tool_call_name(run.name(), &run.status.tool_call_request_id, index);
            match children.get(&name) {
                Some(child) if child.status.is_terminal() => {
                    results.push(Message::tool_result(&call.id, tool_result_content(&child.status)));
                }
                _ => {
                    debug!("TaskRun {} still waiting on {}", run.key(), name);
                    return Ok(Action::requeue_after(self.ctx.requeue_delay()));
                }
            }
        }

        run.status.context_window.extend(results);
        Self::set(
            &mut run,
            TaskRunPhase::ReadyForLLM,
            TaskRunStatusType::Ready,
            "All tool calls completed, ready to send tool results to LLM",
        );
        self.ctx.events.normal(
            Kind::TaskRun,
            &run.key(),
            "AllToolCallsCompleted",
            "All tool calls completed",
        );
        self.write(&run).await?;
        Ok(Action::requeue())
    }
}

/// Time left before a run in `ErrorBackoff` may call the LLM again
fn backoff_remaining(run: &TaskRun) -> Option<Duration> {
    let retry_after = run.status.retry_after?;
    (retry_after - Utc::now())
        .to_std()
        .ok()
        .filter(|d| !d.is_zero())
}

/// Content of the `tool` message reporting a finished call
fn tool_result_content(status: &TaskRunToolCallStatus) -> String {
    match status.phase {
        Some(TaskRunToolCallPhase::Succeeded) | Some(TaskRunToolCallPhase::ToolCallRejected) => {
            status.result.clone()
        }
        _ if !status.error.is_empty() => format!("Error: {}", status.error),
        _ => format!("Error: {}", status.status_detail),
    }
}

#[async_trait]
impl Reconciler for TaskRunReconciler {
    fn kind(&self) -> Kind {
        Kind::TaskRun
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(run) = self.ctx.store.try_get::<TaskRunSpec>(key).await? else {
            return Ok(Action::done());
        };

        let Some(phase) = run.status.phase else {
            return self.initialize(run).await;
        };
        debug!("Reconciling TaskRun {} in phase {}", key, phase);

        match phase {
            TaskRunPhase::FinalAnswer | TaskRunPhase::Failed => Ok(Action::done()),
            TaskRunPhase::Initializing | TaskRunPhase::Pending => self.validate(run).await,
            TaskRunPhase::ReadyForLLM => self.mark_sending(run).await,
            TaskRunPhase::ErrorBackoff => match backoff_remaining(&run) {
                Some(remaining) => Ok(Action::requeue_after(remaining)),
                None => self.send_to_llm(run).await,
            },
            TaskRunPhase::SendContextWindowToLLM => self.send_to_llm(run).await,
            TaskRunPhase::ToolCallsPending | TaskRunPhase::CheckingToolCalls => {
                self.check_tool_calls(run).await
            }
        }
    }
}
