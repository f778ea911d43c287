//! Reconcilers
//!
//! - `TaskRunReconciler`: the LLM loop, tool-call fan-out and fan-in
//! - `TaskRunToolCallReconciler`: tool dispatch and the human-approval flow
//! - `TaskReconciler`: spawns the TaskRun for a Task
//! - Agent, LLM, Tool, ContactChannel and MCPServer reconcilers: readiness
//!
//! Every reconciler reads the object, computes the next state, and writes the
//! status with a conditional update against the version it read.

use std::sync::Arc;
use std::time::Duration;

use crate::approval::ApprovalClientFactory;
use crate::config::KubechainConfig;
use crate::events::EventRecorder;
use crate::llm::LlmClientFactory;
use crate::mcp::ToolBackend;
use crate::secrets::SecretStore;
use crate::store::ResourceStore;
use crate::tools::ToolBackendRegistry;

mod agent;
mod contactchannel;
mod llm;
mod mcpserver;
mod task;
mod taskrun;
mod taskruntoolcall;
mod tool;

pub use agent::AgentReconciler;
pub use contactchannel::ContactChannelReconciler;
pub use llm::LlmReconciler;
pub use mcpserver::McpServerReconciler;
pub use task::TaskReconciler;
pub use taskrun::TaskRunReconciler;
pub use taskruntoolcall::TaskRunToolCallReconciler;
pub use tool::ToolReconciler;

/// Collaborators shared by all reconcilers
pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub events: Arc<EventRecorder>,
    pub secrets: Arc<dyn SecretStore>,
    pub llm_factory: Arc<dyn LlmClientFactory>,
    pub tool_backend: Arc<dyn ToolBackend>,
    pub approvals: Arc<dyn ApprovalClientFactory>,
    pub external_apis: ToolBackendRegistry,
    pub config: KubechainConfig,
}

impl Context {
    /// Delay used while waiting on a dependency or a human
    pub fn requeue_delay(&self) -> Duration {
        self.config.requeue_delay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        Message, ObjectKey, Role, TaskRunPhase, TaskRunSpec, TaskRunToolCallPhase,
        TaskRunToolCallSpec, TaskSpec, ToolCall,
    };
    use crate::runtime::ControllerManager;
    use crate::store::{LabelSelector, ResourceStoreExt};
    use crate::testing::{context_with, seed_agent, seed_task, NS};

    #[tokio::test]
    async fn task_runs_through_a_tool_call_to_a_final_answer() {
        let (ctx, fakes) = context_with(KubechainConfig {
            requeue_delay_secs: 0,
            ..Default::default()
        });
        seed_agent(fakes.store.as_ref(), true).await;
        fakes.llm.reply(Ok(Message::assistant_tool_calls(vec![ToolCall::function(
            "call_1",
            "add",
            r#"{"x":2,"y":3}"#,
        )])));
        fakes.llm.reply(Ok(Message::assistant("The answer is 5")));

        let manager = Arc::new(
            ControllerManager::new(ctx.store.clone())
                .register(Arc::new(TaskReconciler::new(ctx.clone())), 1)
                .register(Arc::new(TaskRunReconciler::new(ctx.clone())), 1)
                .register(Arc::new(TaskRunToolCallReconciler::new(ctx.clone())), 1),
        );
        let running = tokio::spawn(Arc::clone(&manager).run());
        seed_task(fakes.store.as_ref(), false).await;

        let run_key = ObjectKey::new(NS, "calc-task-1");
        let mut run = None;
        for _ in 0..300 {
            if let Some(current) = fakes.store.try_get::<TaskRunSpec>(&run_key).await.unwrap() {
                if current.status.phase == Some(TaskRunPhase::FinalAnswer) {
                    run = Some(current);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.shutdown();
        running.await.unwrap().unwrap();

        let run = run.expect("TaskRun never reached FinalAnswer");
        assert_eq!(run.status.output, "The answer is 5");
        let roles: Vec<Role> = run.status.context_window.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        let window = &run.status.context_window;
        assert_eq!(window[0].content, "You are a calculator.");
        assert_eq!(window[1].content, "What is 2 + 3?");
        assert_eq!(window[2].tool_calls[0].function.name, "add");
        assert_eq!(window[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(window[3].content, "5");

        let task = fakes
            .store
            .get::<TaskSpec>(&ObjectKey::new(NS, "calc-task"))
            .await
            .unwrap();
        assert!(task.status.ready);
        let calls = fakes
            .store
            .list::<TaskRunToolCallSpec>(NS, &LabelSelector::everything())
            .await
            .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status.phase, Some(TaskRunToolCallPhase::Succeeded));

        // The second LLM request carried the tool result
        assert_eq!(fakes.llm.request_count(), 2);
        let (sent, _) = fakes.llm.requests.lock()[1].clone();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3].content, "5");
    }
}
