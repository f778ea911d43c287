//! TaskRunToolCall engine
//!
//! Executes one tool call requested by the LLM. The execution kind comes from
//! the referenced Tool (or MCPServer for `<server>__<tool>` names), never from
//! the caller-supplied type:
//! - builtin functions run in process
//! - MCP tools go through the `ToolBackend`, behind human approval when the
//!   server names an approval contact channel
//! - external APIs are called with the tool's credential
//! - agent delegation is recognized and rejected
//!
//! Results are written to this object only; the parent TaskRun merges them.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Context;
use crate::api::{
    ContactChannelSpec, ExternalApiSpec, Kind, McpServerSpec, ObjectKey, TaskRunToolCall,
    TaskRunToolCallPhase, TaskRunToolCallSpec, TaskRunToolCallStatusType, ToolKind, ToolSpec,
};
use crate::approval::{ApprovalClient, ApprovalError, ChannelConfig, FunctionSpec};
use crate::llm::split_mcp_tool_name;
use crate::runtime::{Action, Reconciler};
use crate::store::ResourceStoreExt;
use crate::tools::{execute_builtin, format_number};

/// What a tool call resolves to
struct Target {
    /// Tool resource name, or the full `<server>__<tool>` name
    tool_name: String,
    /// Name the LLM used for the function
    function_name: String,
    kind: ToolKind,
    approval_channel: Option<String>,
}

/// Outcome of resolving the tool a call names
enum Resolved {
    Ready(Target),
    /// The tool exists but cannot run yet
    Waiting(String),
    Failed(Failure),
}

/// Terminal execution failure
struct Failure {
    detail: String,
    error: String,
}

impl Failure {
    fn new(detail: impl Into<String>, error: impl ToString) -> Self {
        Self {
            detail: detail.into(),
            error: error.to_string(),
        }
    }
}

type Outcome = std::result::Result<(String, &'static str), Failure>;

fn new_call_id() -> String {
    format!("call-{}", uuid::Uuid::new_v4())
}

/// Arguments as a JSON object; empty text is an empty object
fn parse_arguments(raw: &str) -> std::result::Result<Map<String, Value>, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(raw)
}

pub struct TaskRunToolCallReconciler {
    ctx: Arc<Context>,
}

impl TaskRunToolCallReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn write(&self, call: &TaskRunToolCall) -> Result<TaskRunToolCall> {
        self.ctx
            .store
            .update_status(call)
            .await
            .with_context(|| format!("Failed to update TaskRunToolCall {}", call.key()))
    }

    fn set(
        call: &mut TaskRunToolCall,
        phase: TaskRunToolCallPhase,
        status: TaskRunToolCallStatusType,
        detail: impl Into<String>,
    ) {
        call.status.phase = Some(phase);
        call.status.status = status;
        call.status.status_detail = detail.into();
        if phase.is_terminal() {
            call.status.completion_time = Some(Utc::now());
        }
    }

    async fn initialize(&self, mut call: TaskRunToolCall) -> Result<Action> {
        Self::set(
            &mut call,
            TaskRunToolCallPhase::Pending,
            TaskRunToolCallStatusType::Pending,
            "Initializing",
        );
        call.status.start_time = Some(Utc::now());
        self.ctx.events.normal(
            Kind::TaskRunToolCall,
            &call.key(),
            "Initializing",
            "Initializing TaskRunToolCall",
        );
        self.write(&call).await?;
        Ok(Action::requeue())
    }

    async fn fail(&self, mut call: TaskRunToolCall, failure: Failure) -> Result<Action> {
        warn!(
            "TaskRunToolCall {} failed: {}: {}",
            call.key(),
            failure.detail,
            failure.error
        );
        Self::set(
            &mut call,
            TaskRunToolCallPhase::Failed,
            TaskRunToolCallStatusType::Error,
            failure.detail.clone(),
        );
        call.status.error = failure.error;
        self.ctx.events.warning(
            Kind::TaskRunToolCall,
            &call.key(),
            "ExecutionFailed",
            failure.detail,
        );
        self.write(&call).await?;
        Ok(Action::done())
    }

    async fn succeed(
        &self,
        mut call: TaskRunToolCall,
        result: String,
        detail: &str,
    ) -> Result<Action> {
        Self::set(
            &mut call,
            TaskRunToolCallPhase::Succeeded,
            TaskRunToolCallStatusType::Succeeded,
            detail,
        );
        call.status.result = result;
        call.status.error.clear();
        self.ctx
            .events
            .normal(Kind::TaskRunToolCall, &call.key(), "ExecutionSucceeded", detail);
        self.write(&call).await?;
        Ok(Action::done())
    }

    /// Park the call until its tool can run. Writes only on change.
    async fn wait(&self, mut call: TaskRunToolCall, detail: String) -> Result<Action> {
        if call.status.status_detail != detail {
            debug!("TaskRunToolCall {}: {}", call.key(), detail);
            call.status.status_detail = detail;
            self.write(&call).await?;
        }
        Ok(Action::requeue_after(self.ctx.requeue_delay()))
    }

    async fn resolve_target(&self, call: &TaskRunToolCall) -> Result<Resolved> {
        let ns = call.namespace();
        let name = &call.spec.tool_ref.name;

        if let Some((server, _)) = split_mcp_tool_name(name) {
            if let Some(mcp) = self
                .ctx
                .store
                .try_get::<McpServerSpec>(&ObjectKey::new(ns, server))
                .await?
            {
                let Some((server, tool)) = self.ctx.tool_backend.find_server_for_tool(name).await
                else {
                    return Ok(Resolved::Waiting(format!(
                        "Waiting for MCP server {:?} to connect",
                        server
                    )));
                };
                return Ok(Resolved::Ready(Target {
                    tool_name: name.clone(),
                    function_name: name.clone(),
                    kind: ToolKind::Mcp { server, tool },
                    approval_channel: mcp.spec.approval_contact_channel.map(|c| c.name),
                }));
            }
        }

        let tool = match self
            .ctx
            .store
            .get::<ToolSpec>(&ObjectKey::new(ns, name))
            .await
        {
            Ok(tool) => tool,
            Err(e) if e.is_not_found() => {
                return Ok(Resolved::Failed(Failure::new(
                    format!("Failed to get Tool: {}", e),
                    &e,
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let Some(kind) = tool.kind() else {
            let msg = "unknown tool type: tool doesn't have valid execution configuration";
            return Ok(Resolved::Failed(Failure::new(msg, msg)));
        };
        Ok(Resolved::Ready(Target {
            tool_name: tool.name().to_string(),
            function_name: tool.function_name().to_string(),
            kind,
            approval_channel: None,
        }))
    }

    // ── Direct execution ────────────────────────────────────────────────

    async fn execute(&self, call: TaskRunToolCall, target: Target) -> Result<Action> {
        info!(
            "Executing {} tool {} for {}",
            target.kind.tool_type(),
            target.tool_name,
            call.key()
        );

        let outcome = match &target.kind {
            ToolKind::Function { builtin } => Self::run_builtin(builtin, &call.spec.arguments),
            ToolKind::DelegateToAgent { agent } => {
                debug!("Refusing delegation to agent {}", agent);
                let msg = "delegation is not implemented yet; only direct execution is supported";
                Err(Failure::new(msg, msg))
            }
            ToolKind::Mcp { server, tool } => {
                self.run_mcp(server, tool, &call.spec.arguments).await
            }
            ToolKind::ExternalApi(api) => self.run_external(&call, &target, api).await,
        };

        match outcome {
            Ok((result, detail)) => self.succeed(call, result, detail).await,
            Err(failure) => self.fail(call, failure).await,
        }
    }

    fn run_builtin(builtin: &str, arguments: &str) -> Outcome {
        let args = parse_arguments(arguments)
            .map_err(|e| Failure::new("Invalid arguments JSON", e))?;
        let value = execute_builtin(builtin, &args)
            .map_err(|e| Failure::new(format!("Tool execution failed: {}", e), e))?;
        Ok((format_number(value), "Tool executed successfully"))
    }

    async fn run_mcp(&self, server: &str, tool: &str, arguments: &str) -> Outcome {
        let args = parse_arguments(arguments)
            .map_err(|e| Failure::new("Invalid arguments JSON", e))?;
        match self
            .ctx
            .tool_backend
            .call_tool(server, tool, Value::Object(args))
            .await
        {
            Ok(text) => Ok((text, "MCP tool executed successfully")),
            Err(e) => Err(Failure::new(
                format!("MCP tool execution failed: {}", e),
                format!("{:#}", e),
            )),
        }
    }

    async fn run_external(
        &self,
        call: &TaskRunToolCall,
        target: &Target,
        api: &ExternalApiSpec,
    ) -> Outcome {
        let credential = match &api.credentials_from {
            Some(secret_ref) => {
                let value = self
                    .ctx
                    .secrets
                    .get_ref(call.namespace(), secret_ref)
                    .await
                    .map_err(|e| {
                        Failure::new(format!("Failed to get API credentials: {}", e), &e)
                    })?;
                if value.is_empty() {
                    return Err(Failure::new(
                        "empty API key in secret",
                        format!("secret {:?} key {:?} is empty", secret_ref.name, secret_ref.key),
                    ));
                }
                value
            }
            None => String::new(),
        };

        let mut args = parse_arguments(&call.spec.arguments)
            .map_err(|e| Failure::new("Invalid arguments JSON", e))?;
        let fn_name = args
            .get("fn")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| target.function_name.clone());
        let kwargs = match args.get("kwargs").and_then(Value::as_object) {
            Some(kwargs) => kwargs.clone(),
            None => {
                args.remove("fn");
                args
            }
        };
        let spec = FunctionSpec { fn_name, kwargs };

        let client = self
            .ctx
            .external_apis
            .client_for(&target.tool_name, api, &credential)
            .map_err(|e| Failure::new(format!("Failed to get external client: {}", e), &e))?;
        let response = client
            .call(call.name(), &new_call_id(), &spec)
            .await
            .map_err(|e| Failure::new(format!("External API call failed: {}", e), &e))?;

        let result = match response {
            Value::String(text) => text,
            other => other.to_string(),
        };
        Ok((result, "External API call succeeded"))
    }

    // ── Human approval ──────────────────────────────────────────────────

    async fn fail_approval(&self, mut call: TaskRunToolCall, detail: String) -> Result<Action> {
        Self::set(
            &mut call,
            TaskRunToolCallPhase::ErrorRequestingHumanApproval,
            TaskRunToolCallStatusType::Error,
            detail.clone(),
        );
        call.status.error = detail.clone();
        self.ctx.events.warning(
            Kind::TaskRunToolCall,
            &call.key(),
            "HumanLayerRequestFailed",
            detail,
        );
        self.write(&call).await?;
        Ok(Action::done())
    }

    async fn approval_flow(&self, mut call: TaskRunToolCall, channel_name: &str) -> Result<Action> {
        let ns = call.namespace().to_string();
        let channel = match self
            .ctx
            .store
            .try_get::<ContactChannelSpec>(&ObjectKey::new(&ns, channel_name))
            .await?
        {
            Some(channel) => channel,
            None => {
                return self
                    .fail_approval(call, format!("ContactChannel {:?} not found", channel_name))
                    .await
            }
        };

        if !channel.status.ready {
            let detail = format!("Waiting for contact channel {:?} to become ready", channel_name);
            if call.status.status_detail != detail {
                call.status.status_detail = detail;
                self.write(&call).await?;
            }
            return Ok(Action::requeue_after(self.ctx.requeue_delay()));
        }

        let api_key = match self
            .ctx
            .secrets
            .get_ref(&ns, &channel.spec.api_key_from.secret_key_ref)
            .await
        {
            Ok(key) if !key.is_empty() => key,
            Ok(_) => {
                return self
                    .fail_approval(call, format!("empty API key for contact channel {:?}", channel_name))
                    .await
            }
            Err(e) => {
                return self
                    .fail_approval(call, format!("Failed to get contact channel API key: {}", e))
                    .await
            }
        };
        let client = self.ctx.approvals.create(&api_key);

        if call.status.phase == Some(TaskRunToolCallPhase::AwaitingHumanApproval) {
            return self.poll_approval(call, client.as_ref()).await;
        }

        // The call id is persisted before the request so a retried request reuses it
        if call.status.external_call_id.is_empty() {
            call.status.external_call_id = new_call_id();
            self.write(&call).await?;
            return Ok(Action::requeue());
        }

        let config = match ChannelConfig::from_contact_channel(&channel) {
            Ok(config) => config,
            Err(e) => return self.fail_approval(call, e.to_string()).await,
        };
        let kwargs = match parse_arguments(&call.spec.arguments) {
            Ok(kwargs) => kwargs,
            Err(e) => return self.fail(call, Failure::new("Invalid arguments JSON", e)).await,
        };
        let spec = FunctionSpec {
            fn_name: call.spec.tool_ref.name.clone(),
            kwargs,
        };

        match client
            .request_approval(&config, &spec, &call.status.external_call_id, call.name())
            .await
        {
            Ok(()) => {}
            Err(ApprovalError::AlreadyRequested(id)) => {
                debug!("Approval {} for {} was already requested", id, call.key());
            }
            Err(e) => {
                return self
                    .fail_approval(call, format!("Failed to request human approval: {}", e))
                    .await
            }
        }

        let detail = format!("Waiting for human approval via contact channel {}", channel_name);
        Self::set(
            &mut call,
            TaskRunToolCallPhase::AwaitingHumanApproval,
            TaskRunToolCallStatusType::Ready,
            detail.clone(),
        );
        self.ctx.events.normal(
            Kind::TaskRunToolCall,
            &call.key(),
            "AwaitingHumanApproval",
            detail,
        );
        self.write(&call).await?;
        Ok(Action::requeue_after(self.ctx.requeue_delay()))
    }

    async fn poll_approval(
        &self,
        mut call: TaskRunToolCall,
        client: &dyn ApprovalClient,
    ) -> Result<Action> {
        let status = match client.get_status(&call.status.external_call_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Polling approval for {} failed: {}", call.key(), e);
                return Ok(Action::requeue_after(self.ctx.requeue_delay()));
            }
        };

        match status.approved {
            None => Ok(Action::requeue_after(self.ctx.requeue_delay())),
            Some(true) => {
                Self::set(
                    &mut call,
                    TaskRunToolCallPhase::ReadyToExecuteApprovedTool,
                    TaskRunToolCallStatusType::Ready,
                    "Ready to execute approved tool",
                );
                self.ctx.events.normal(
                    Kind::TaskRunToolCall,
                    &call.key(),
                    "ApprovalReceived",
                    "Human approved the tool call",
                );
                self.write(&call).await?;
                Ok(Action::requeue())
            }
            Some(false) => {
                let result = match status.comment.as_deref().filter(|c| !c.is_empty()) {
                    Some(comment) => format!("Tool call rejected: {}", comment),
                    None => "Tool call rejected".to_string(),
                };
                Self::set(
                    &mut call,
                    TaskRunToolCallPhase::ToolCallRejected,
                    TaskRunToolCallStatusType::Succeeded,
                    "Tool call rejected by human",
                );
                call.status.result = result.clone();
                self.ctx.events.normal(
                    Kind::TaskRunToolCall,
                    &call.key(),
                    "ToolCallRejected",
                    result,
                );
                self.write(&call).await?;
                Ok(Action::done())
            }
        }
    }
}

#[async_trait]
impl Reconciler for TaskRunToolCallReconciler {
    fn kind(&self) -> Kind {
        Kind::TaskRunToolCall
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut call) = self.ctx.store.try_get::<TaskRunToolCallSpec>(key).await? else {
            return Ok(Action::done());
        };

        let Some(phase) = call.status.phase else {
            return self.initialize(call).await;
        };
        if phase.is_terminal() {
            return Ok(Action::done());
        }

        let target = match self.resolve_target(&call).await? {
            Resolved::Ready(target) => target,
            Resolved::Waiting(detail) => return self.wait(call, detail).await,
            Resolved::Failed(failure) => return self.fail(call, failure).await,
        };
        call.status.tool_type = Some(target.kind.tool_type());

        if let Some(channel) = target.approval_channel.clone() {
            if phase != TaskRunToolCallPhase::ReadyToExecuteApprovedTool {
                return self.approval_flow(call, &channel).await;
            }
        }
        self.execute(call, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        BuiltinToolSpec, ChannelType, ContactChannel, LocalObjectReference, McpServer,
        McpTransportType, ReadinessStatus, Secret, SecretKeyRef, SlackChannelConfig, Tool,
        ToolExecute, ToolType,
    };
    use crate::store::ResourceStore;
    use crate::testing::{context, create_with_status, seed_agent, Fakes, NS};
    use serde_json::json;
    use std::time::Duration;

    const CALL: &str = "calc-task-1-abc1234-tc-01";

    fn key() -> ObjectKey {
        ObjectKey::new(NS, CALL)
    }

    async fn create_call(fakes: &Fakes, tool: &str, arguments: &str) {
        fakes
            .store
            .create(TaskRunToolCall::new(
                NS,
                CALL,
                TaskRunToolCallSpec {
                    tool_call_id: "call_1".into(),
                    task_run_ref: LocalObjectReference::new("calc-task-1"),
                    tool_ref: LocalObjectReference::new(tool),
                    tool_type: None,
                    arguments: arguments.into(),
                },
            ))
            .await
            .unwrap();
    }

    async fn get_call(fakes: &Fakes) -> TaskRunToolCall {
        fakes.store.get::<TaskRunToolCallSpec>(&key()).await.unwrap()
    }

    /// Initialize, then run one more pass
    async fn run_once(r: &TaskRunToolCallReconciler) -> Action {
        assert_eq!(r.reconcile(&key()).await.unwrap(), Action::requeue());
        r.reconcile(&key()).await.unwrap()
    }

    async fn seed_tool(fakes: &Fakes, name: &str, spec: ToolSpec) {
        fakes.store.create(Tool::new(NS, name, spec)).await.unwrap();
    }

    async fn seed_mcp_server(fakes: &Fakes, approval: Option<&str>) {
        fakes
            .store
            .create(McpServer::new(
                NS,
                "fetch",
                McpServerSpec {
                    transport: McpTransportType::Stdio,
                    command: "uvx".into(),
                    args: vec!["mcp-server-fetch".into()],
                    env: Vec::new(),
                    url: String::new(),
                    approval_contact_channel: approval.map(LocalObjectReference::new),
                },
            ))
            .await
            .unwrap();
        fakes.backend.add_server("fetch", &["get"]);
    }

    async fn seed_channel(fakes: &Fakes, ready: bool) {
        fakes
            .store
            .create(Secret::with_data(NS, "humanlayer", [("HUMANLAYER_API_KEY", "hl-key")]))
            .await
            .unwrap();
        let mut channel = ContactChannel::new(
            NS,
            "approvals",
            ContactChannelSpec {
                channel_type: ChannelType::Slack,
                api_key_from: crate::api::SecretKeySource::new("humanlayer", "HUMANLAYER_API_KEY"),
                slack_config: Some(SlackChannelConfig {
                    channel_or_user_id: "C0123".into(),
                    context_about_channel_or_user: "ops".into(),
                }),
                email_config: None,
            },
        );
        channel.status.ready = ready;
        channel.status.status = if ready {
            ReadinessStatus::Ready
        } else {
            ReadinessStatus::Pending
        };
        create_with_status(fakes.store.as_ref(), channel).await;
    }

    #[tokio::test]
    async fn builtin_function_succeeds() {
        let (ctx, fakes) = context();
        seed_agent(fakes.store.as_ref(), true).await;
        create_call(&fakes, "add", r#"{"a": 2, "b": 3}"#).await;
        let r = TaskRunToolCallReconciler::new(ctx);

        assert_eq!(run_once(&r).await, Action::done());
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::Succeeded));
        assert_eq!(call.status.status, TaskRunToolCallStatusType::Succeeded);
        assert_eq!(call.status.result, "5");
        assert_eq!(call.status.tool_type, Some(ToolType::Function));
        assert!(call.status.start_time.is_some());
        assert!(call.status.completion_time.is_some());
        assert_eq!(
            fakes.events.reasons_for(Kind::TaskRunToolCall, &key()),
            vec!["Initializing".to_string(), "ExecutionSucceeded".to_string()]
        );

        // Terminal: a further pass writes nothing
        r.reconcile(&key()).await.unwrap();
        assert_eq!(
            get_call(&fakes).await.metadata.resource_version,
            call.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn builtin_errors_are_terminal() {
        let (ctx, fakes) = context();
        seed_tool(
            &fakes,
            "divide",
            ToolSpec {
                execute: ToolExecute {
                    builtin: Some(BuiltinToolSpec {
                        name: "divide".into(),
                    }),
                    external_api: None,
                },
                ..Default::default()
            },
        )
        .await;
        create_call(&fakes, "divide", r#"{"first": "1", "second": 0}"#).await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::Failed));
        assert_eq!(call.status.status, TaskRunToolCallStatusType::Error);
        assert_eq!(call.status.error, "division by zero");
    }

    #[tokio::test]
    async fn malformed_arguments_fail() {
        let (ctx, fakes) = context();
        seed_agent(fakes.store.as_ref(), true).await;
        create_call(&fakes, "add", "{not json").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::Failed));
        assert_eq!(call.status.status_detail, "Invalid arguments JSON");
    }

    #[tokio::test]
    async fn missing_tool_fails() {
        let (ctx, fakes) = context();
        create_call(&fakes, "nope", "{}").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::Failed));
        assert!(call.status.status_detail.starts_with("Failed to get Tool:"));
    }

    #[tokio::test]
    async fn tool_without_execution_config_fails() {
        let (ctx, fakes) = context();
        seed_tool(&fakes, "empty", ToolSpec::default()).await;
        create_call(&fakes, "empty", "{}").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        assert!(get_call(&fakes)
            .await
            .status
            .error
            .starts_with("unknown tool type"));
    }

    #[tokio::test]
    async fn delegation_is_rejected() {
        let (ctx, fakes) = context();
        seed_tool(
            &fakes,
            "ask-helper",
            ToolSpec {
                agent_ref: Some(LocalObjectReference::new("helper")),
                ..Default::default()
            },
        )
        .await;
        create_call(&fakes, "ask-helper", "{}").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::Failed));
        assert_eq!(call.status.tool_type, Some(ToolType::DelegateToAgent));
        assert!(call.status.error.contains("not implemented"));
    }

    #[tokio::test]
    async fn mcp_tool_runs_directly_without_approval() {
        let (ctx, fakes) = context();
        seed_mcp_server(&fakes, None).await;
        fakes.backend.set_output("get", Ok("<html>ok</html>"));
        create_call(&fakes, "fetch__get", r#"{"url":"https://example.com"}"#).await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::Succeeded));
        assert_eq!(call.status.result, "<html>ok</html>");
        assert_eq!(call.status.tool_type, Some(ToolType::Mcp));

        let calls = fakes.backend.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "fetch");
        assert_eq!(calls[0].1, "get");
        assert_eq!(calls[0].2, json!({"url": "https://example.com"}));
    }

    #[tokio::test]
    async fn mcp_tool_waits_for_its_server_to_connect() {
        let (ctx, fakes) = context();
        seed_mcp_server(&fakes, None).await;
        fakes.backend.tools.lock().clear();
        fakes.backend.set_output("get", Ok("late"));
        create_call(&fakes, "fetch__get", "{}").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        assert_eq!(
            run_once(&r).await,
            Action::requeue_after(Duration::from_secs(5))
        );
        let waiting = get_call(&fakes).await;
        assert_eq!(waiting.status.phase, Some(TaskRunToolCallPhase::Pending));
        assert_eq!(
            waiting.status.status_detail,
            "Waiting for MCP server \"fetch\" to connect"
        );
        assert!(fakes.backend.calls.lock().is_empty());

        // Still disconnected: nothing is rewritten
        r.reconcile(&key()).await.unwrap();
        assert_eq!(
            get_call(&fakes).await.metadata.resource_version,
            waiting.metadata.resource_version
        );

        fakes.backend.add_server("fetch", &["get"]);
        assert_eq!(r.reconcile(&key()).await.unwrap(), Action::done());
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::Succeeded));
        assert_eq!(call.status.result, "late");
    }

    #[tokio::test]
    async fn mcp_tool_error_fails() {
        let (ctx, fakes) = context();
        seed_mcp_server(&fakes, None).await;
        fakes.backend.set_output("get", Err("404"));
        create_call(&fakes, "fetch__get", "").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::Failed));
        assert!(call.status.status_detail.starts_with("MCP tool execution failed"));
        assert_eq!(fakes.backend.calls.lock()[0].2, json!({}));
    }

    #[tokio::test]
    async fn approved_call_executes() {
        let (ctx, fakes) = context();
        seed_mcp_server(&fakes, Some("approvals")).await;
        seed_channel(&fakes, true).await;
        fakes.backend.set_output("get", Ok("fetched"));
        create_call(&fakes, "fetch__get", r#"{"url":"https://example.com"}"#).await;
        let r = TaskRunToolCallReconciler::new(ctx);

        // Call id first, then the request
        assert_eq!(run_once(&r).await, Action::requeue());
        let call_id = get_call(&fakes).await.status.external_call_id;
        assert!(call_id.starts_with("call-"));

        assert_eq!(
            r.reconcile(&key()).await.unwrap(),
            Action::requeue_after(Duration::from_secs(5))
        );
        let awaiting = get_call(&fakes).await;
        assert_eq!(awaiting.status.phase, Some(TaskRunToolCallPhase::AwaitingHumanApproval));
        assert_eq!(awaiting.status.status, TaskRunToolCallStatusType::Ready);
        assert_eq!(awaiting.status.external_call_id, call_id);

        let requests = fakes.approval.requests.lock().clone();
        assert_eq!(requests.len(), 1);
        let (channel, spec, sent_id, run_id) = &requests[0];
        assert!(matches!(channel, ChannelConfig::Slack { channel_or_user_id, .. } if channel_or_user_id == "C0123"));
        assert_eq!(spec.fn_name, "fetch__get");
        assert_eq!(spec.kwargs["url"], "https://example.com");
        assert_eq!(sent_id, &call_id);
        assert_eq!(run_id, CALL);

        // No answer yet: nothing is written, nothing executes
        r.reconcile(&key()).await.unwrap();
        assert_eq!(
            get_call(&fakes).await.metadata.resource_version,
            awaiting.metadata.resource_version
        );
        assert!(fakes.backend.calls.lock().is_empty());

        fakes.approval.respond(true, None);
        assert_eq!(r.reconcile(&key()).await.unwrap(), Action::requeue());
        assert_eq!(
            get_call(&fakes).await.status.phase,
            Some(TaskRunToolCallPhase::ReadyToExecuteApprovedTool)
        );

        r.reconcile(&key()).await.unwrap();
        let done = get_call(&fakes).await;
        assert_eq!(done.status.phase, Some(TaskRunToolCallPhase::Succeeded));
        assert_eq!(done.status.result, "fetched");
        assert_eq!(fakes.approval.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn rejected_call_completes_without_executing() {
        let (ctx, fakes) = context();
        seed_mcp_server(&fakes, Some("approvals")).await;
        seed_channel(&fakes, true).await;
        create_call(&fakes, "fetch__get", "{}").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        r.reconcile(&key()).await.unwrap();
        fakes.approval.respond(false, Some("not on prod"));
        assert_eq!(r.reconcile(&key()).await.unwrap(), Action::done());

        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::ToolCallRejected));
        assert_eq!(call.status.status, TaskRunToolCallStatusType::Succeeded);
        assert_eq!(call.status.result, "Tool call rejected: not on prod");
        assert!(fakes.backend.calls.lock().is_empty());
        assert!(fakes
            .events
            .reasons_for(Kind::TaskRunToolCall, &key())
            .contains(&"ToolCallRejected".to_string()));
    }

    #[tokio::test]
    async fn approval_request_failure_is_terminal() {
        let (ctx, fakes) = context();
        seed_mcp_server(&fakes, Some("approvals")).await;
        seed_channel(&fakes, true).await;
        *fakes.approval.fail_requests.lock() = true;
        create_call(&fakes, "fetch__get", "{}").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        assert_eq!(r.reconcile(&key()).await.unwrap(), Action::done());
        let call = get_call(&fakes).await;
        assert_eq!(
            call.status.phase,
            Some(TaskRunToolCallPhase::ErrorRequestingHumanApproval)
        );
        assert_eq!(call.status.status, TaskRunToolCallStatusType::Error);
        assert!(call.status.error.contains("500"));
    }

    #[tokio::test]
    async fn request_accepted_before_a_lost_write_is_not_repeated() {
        let (ctx, fakes) = context();
        seed_mcp_server(&fakes, Some("approvals")).await;
        seed_channel(&fakes, true).await;
        create_call(&fakes, "fetch__get", "{}").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        let call_id = get_call(&fakes).await.status.external_call_id;
        // The request reached the approval service but the status write did not land
        fakes.approval.requests.lock().push((
            ChannelConfig::Email {
                address: "ops@example.com".into(),
                context_about_user: String::new(),
            },
            FunctionSpec {
                fn_name: "fetch__get".into(),
                kwargs: Map::new(),
            },
            call_id.clone(),
            CALL.into(),
        ));

        assert_eq!(
            r.reconcile(&key()).await.unwrap(),
            Action::requeue_after(Duration::from_secs(5))
        );
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::AwaitingHumanApproval));
        assert_eq!(call.status.external_call_id, call_id);
        assert_eq!(fakes.approval.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn missing_channel_is_terminal() {
        let (ctx, fakes) = context();
        seed_mcp_server(&fakes, Some("approvals")).await;
        create_call(&fakes, "fetch__get", "{}").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        assert_eq!(
            get_call(&fakes).await.status.phase,
            Some(TaskRunToolCallPhase::ErrorRequestingHumanApproval)
        );
    }

    #[tokio::test]
    async fn unready_channel_waits() {
        let (ctx, fakes) = context();
        seed_mcp_server(&fakes, Some("approvals")).await;
        seed_channel(&fakes, false).await;
        create_call(&fakes, "fetch__get", "{}").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        assert_eq!(
            run_once(&r).await,
            Action::requeue_after(Duration::from_secs(5))
        );
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::Pending));
        assert!(call.status.status_detail.contains("approvals"));
        assert!(fakes.approval.requests.lock().is_empty());
    }

    async fn seed_weather_tool(fakes: &Fakes) {
        fakes
            .store
            .create(Secret::with_data(NS, "weather-creds", [("token", "w-123")]))
            .await
            .unwrap();
        seed_tool(
            fakes,
            "weather",
            ToolSpec {
                name: Some("get_weather".into()),
                execute: ToolExecute {
                    builtin: None,
                    external_api: Some(ExternalApiSpec {
                        url: "https://weather.example.com/call".into(),
                        method: "POST".into(),
                        requires_approval: false,
                        credentials_from: Some(SecretKeyRef {
                            name: "weather-creds".into(),
                            key: "token".into(),
                        }),
                    }),
                },
                ..Default::default()
            },
        )
        .await;
    }

    #[tokio::test]
    async fn external_api_call_succeeds() {
        let (ctx, fakes) = context();
        seed_weather_tool(&fakes).await;
        *fakes.external.response.lock() = Some(json!({"temp": 21}));
        create_call(&fakes, "weather", r#"{"city":"Oslo"}"#).await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::Succeeded));
        assert_eq!(call.status.result, r#"{"temp":21}"#);
        assert_eq!(fakes.external.credentials.lock().as_slice(), ["w-123"]);

        let (run_id, call_id, spec) = fakes.external.calls.lock()[0].clone();
        assert_eq!(run_id, CALL);
        assert!(call_id.starts_with("call-"));
        assert_eq!(spec.fn_name, "get_weather");
        assert_eq!(spec.kwargs["city"], "Oslo");
    }

    #[tokio::test]
    async fn external_api_explicit_fn_and_kwargs() {
        let (ctx, fakes) = context();
        seed_weather_tool(&fakes).await;
        *fakes.external.response.lock() = Some(json!("sunny"));
        create_call(
            &fakes,
            "weather",
            r#"{"fn":"forecast","kwargs":{"days":3}}"#,
        )
        .await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        assert_eq!(get_call(&fakes).await.status.result, "sunny");
        let (_, _, spec) = fakes.external.calls.lock()[0].clone();
        assert_eq!(spec.fn_name, "forecast");
        assert_eq!(spec.kwargs.len(), 1);
        assert_eq!(spec.kwargs["days"], 3);
    }

    #[tokio::test]
    async fn external_api_transport_failure_is_terminal() {
        let (ctx, fakes) = context();
        seed_weather_tool(&fakes).await;
        create_call(&fakes, "weather", "{}").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        let call = get_call(&fakes).await;
        assert_eq!(call.status.phase, Some(TaskRunToolCallPhase::Failed));
        assert_eq!(
            call.status.status_detail,
            "External API call failed: connection refused"
        );
    }

    #[tokio::test]
    async fn external_api_missing_credentials_fails() {
        let (ctx, fakes) = context();
        seed_weather_tool(&fakes).await;
        fakes
            .store
            .delete(Kind::Secret, &ObjectKey::new(NS, "weather-creds"))
            .await
            .unwrap();
        create_call(&fakes, "weather", "{}").await;
        let r = TaskRunToolCallReconciler::new(ctx);

        run_once(&r).await;
        let call = get_call(&fakes).await;
        assert!(call
            .status
            .status_detail
            .starts_with("Failed to get API credentials"));
        assert!(fakes.external.calls.lock().is_empty());
    }
}
