//! Task controller: waits for the Agent, then spawns exactly one TaskRun

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::Context;
use crate::api::{
    AgentSpec, Kind, LocalObjectReference, ObjectKey, ReadinessStatus, Task, TaskRun,
    TaskRunSpec, TaskSpec, LABEL_TASK,
};
use crate::runtime::{Action, Reconciler};
use crate::store::{LabelSelector, ResourceStoreExt};

pub struct TaskReconciler {
    ctx: Arc<Context>,
}

impl TaskReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn write(&self, task: &Task) -> Result<Task> {
        self.ctx
            .store
            .update_status(task)
            .await
            .with_context(|| format!("Failed to update Task {}", task.key()))
    }

    /// Park the task in Pending; writes only when the detail changes
    async fn pending(&self, mut task: Task, detail: String) -> Result<Action> {
        if task.status.status != ReadinessStatus::Pending || task.status.status_detail != detail {
            task.status.ready = false;
            task.status.status = ReadinessStatus::Pending;
            task.status.status_detail = detail.clone();
            self.ctx
                .events
                .normal(Kind::Task, &task.key(), "Waiting", detail);
            self.write(&task).await?;
        }
        Ok(Action::requeue_after(self.ctx.requeue_delay()))
    }

    /// Name of the task's run, creating it when none exists yet
    async fn ensure_run(&self, task: &Task) -> Result<String> {
        let existing = self
            .ctx
            .store
            .list::<TaskRunSpec>(
                task.namespace(),
                &LabelSelector::everything().with(LABEL_TASK, task.name()),
            )
            .await?;
        if let Some(run) = existing.first() {
            debug!("Task {} adopts existing TaskRun {}", task.key(), run.name());
            return Ok(run.name().to_string());
        }

        let name = format!("{}-1", task.name());
        let mut run = TaskRun::new(
            task.namespace(),
            &name,
            TaskRunSpec {
                task_ref: LocalObjectReference::new(task.name()),
                ..Default::default()
            },
        );
        run.metadata = run
            .metadata
            .with_label(LABEL_TASK, task.name())
            .with_owner(task.controller_ref());

        match self.ctx.store.create(run).await {
            Ok(_) => info!("Created TaskRun {} for Task {}", name, task.key()),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to create TaskRun {}", name)),
        }
        Ok(name)
    }
}

#[async_trait]
impl Reconciler for TaskReconciler {
    fn kind(&self) -> Kind {
        Kind::Task
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut task) = self.ctx.store.try_get::<TaskSpec>(key).await? else {
            return Ok(Action::done());
        };

        if task.status.ready && task.status.task_run_ref.is_some() {
            return Ok(Action::done());
        }
        if task.status.status_detail.is_empty() {
            task.status.status = ReadinessStatus::Pending;
            task.status.status_detail = "Validating agent".to_string();
            self.write(&task).await?;
            return Ok(Action::requeue());
        }

        let agent_name = task.spec.agent_ref.name.clone();
        match self
            .ctx
            .store
            .try_get::<AgentSpec>(&ObjectKey::new(task.namespace(), &agent_name))
            .await?
        {
            None => {
                return self
                    .pending(task, "Waiting for Agent to exist".to_string())
                    .await
            }
            Some(agent) if !agent.status.ready => {
                return self
                    .pending(
                        task,
                        format!("Waiting for agent {:?} to become ready", agent_name),
                    )
                    .await
            }
            Some(_) => {}
        }

        let run_name = self.ensure_run(&task).await?;
        task.status.ready = true;
        task.status.status = ReadinessStatus::Ready;
        task.status.status_detail = "Task run created".to_string();
        task.status.task_run_ref = Some(LocalObjectReference::new(&run_name));
        self.ctx.events.normal(
            Kind::Task,
            &task.key(),
            "TaskRunCreated",
            format!("Created TaskRun {}", run_name),
        );
        self.write(&task).await?;
        Ok(Action::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, seed_agent, seed_task, NS};
    use std::time::Duration;

    fn key() -> ObjectKey {
        ObjectKey::new(NS, "calc-task")
    }

    #[tokio::test]
    async fn waits_for_agent_then_creates_one_run() {
        let (ctx, fakes) = context();
        seed_agent(fakes.store.as_ref(), false).await;
        seed_task(fakes.store.as_ref(), false).await;
        let r = TaskReconciler::new(ctx);

        assert_eq!(r.reconcile(&key()).await.unwrap(), Action::requeue());
        assert_eq!(
            fakes.store.get::<TaskSpec>(&key()).await.unwrap().status.status_detail,
            "Validating agent"
        );

        assert_eq!(
            r.reconcile(&key()).await.unwrap(),
            Action::requeue_after(Duration::from_secs(5))
        );
        let waiting = fakes.store.get::<TaskSpec>(&key()).await.unwrap();
        assert_eq!(waiting.status.status_detail, "Waiting for agent \"calc\" to become ready");
        r.reconcile(&key()).await.unwrap();
        assert_eq!(
            fakes.store.get::<TaskSpec>(&key()).await.unwrap().metadata.resource_version,
            waiting.metadata.resource_version
        );

        let mut agent = fakes
            .store
            .get::<AgentSpec>(&ObjectKey::new(NS, "calc"))
            .await
            .unwrap();
        agent.status.ready = true;
        fakes.store.update_status(&agent).await.unwrap();

        assert_eq!(r.reconcile(&key()).await.unwrap(), Action::done());
        let task = fakes.store.get::<TaskSpec>(&key()).await.unwrap();
        assert!(task.status.ready);
        assert_eq!(task.status.status_detail, "Task run created");
        assert_eq!(task.status.task_run_ref.as_ref().unwrap().name, "calc-task-1");

        let run = fakes
            .store
            .get::<TaskRunSpec>(&ObjectKey::new(NS, "calc-task-1"))
            .await
            .unwrap();
        assert_eq!(run.spec.task_ref.name, "calc-task");
        assert_eq!(run.metadata.labels[LABEL_TASK], "calc-task");
        assert_eq!(run.metadata.controller_owner().unwrap().uid, task.metadata.uid);

        r.reconcile(&key()).await.unwrap();
        let runs = fakes
            .store
            .list::<TaskRunSpec>(NS, &LabelSelector::everything())
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn missing_agent_waits() {
        let (ctx, fakes) = context();
        seed_task(fakes.store.as_ref(), false).await;
        let r = TaskReconciler::new(ctx);

        r.reconcile(&key()).await.unwrap();
        r.reconcile(&key()).await.unwrap();
        let task = fakes.store.get::<TaskSpec>(&key()).await.unwrap();
        assert_eq!(task.status.status_detail, "Waiting for Agent to exist");
        assert!(task.status.task_run_ref.is_none());
    }

    #[tokio::test]
    async fn existing_labelled_run_is_adopted() {
        let (ctx, fakes) = context();
        seed_agent(fakes.store.as_ref(), true).await;
        seed_task(fakes.store.as_ref(), false).await;
        let mut run = TaskRun::new(
            NS,
            "calc-task-manual",
            TaskRunSpec {
                task_ref: LocalObjectReference::new("calc-task"),
                ..Default::default()
            },
        );
        run.metadata = run.metadata.with_label(LABEL_TASK, "calc-task");
        fakes.store.create(run).await.unwrap();
        let r = TaskReconciler::new(ctx);

        r.reconcile(&key()).await.unwrap();
        r.reconcile(&key()).await.unwrap();
        let task = fakes.store.get::<TaskSpec>(&key()).await.unwrap();
        assert_eq!(task.status.task_run_ref.unwrap().name, "calc-task-manual");
        assert!(fakes
            .store
            .try_get::<TaskRunSpec>(&ObjectKey::new(NS, "calc-task-1"))
            .await
            .unwrap()
            .is_none());
    }
}
