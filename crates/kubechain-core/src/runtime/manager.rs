//! Controller manager
//!
//! Owns a work queue and a worker pool per reconciler, turns store watch
//! events into queue adds, and applies each reconcile's requeue decision.

use anyhow::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::{Backoff, WorkQueue};
use super::Reconciler;
use crate::api::{Kind, ObjectKey};
use crate::error::{classify, ErrorClass};
use crate::store::{LabelSelector, ResourceStore, WatchEvent};

struct Controller {
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
    workers: usize,
}

/// Kinds whose objects must be re-checked when an object of `kind` changes
fn dependents(kind: Kind) -> &'static [Kind] {
    match kind {
        Kind::Llm | Kind::Tool | Kind::McpServer | Kind::ContactChannel => &[Kind::Agent],
        Kind::Secret => &[Kind::Llm, Kind::ContactChannel, Kind::McpServer],
        Kind::Agent => &[Kind::Task],
        _ => &[],
    }
}

pub struct ControllerManager {
    store: Arc<dyn ResourceStore>,
    controllers: HashMap<Kind, Controller>,
    backoff: Backoff,
    shutdown_tx: watch::Sender<bool>,
}

impl ControllerManager {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            controllers: HashMap::new(),
            backoff: Backoff::default(),
            shutdown_tx,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Register a reconciler with `workers` concurrent workers
    pub fn register(mut self, reconciler: Arc<dyn Reconciler>, workers: usize) -> Self {
        let kind = reconciler.kind();
        self.controllers.insert(
            kind,
            Controller {
                reconciler,
                queue: Arc::new(WorkQueue::new(self.backoff)),
                workers: workers.max(1),
            },
        );
        self
    }

    pub fn queue(&self, kind: Kind) -> Option<&Arc<WorkQueue>> {
        self.controllers.get(&kind).map(|c| &c.queue)
    }

    pub fn enqueue(&self, kind: Kind, key: ObjectKey) {
        if let Some(queue) = self.queue(kind) {
            queue.add(key);
        }
    }

    /// Handle that stops `run` when sent `true`
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn enqueue_all(&self, kind: Kind, namespace: Option<&str>) {
        match self
            .store
            .list_dynamic(kind, namespace, &LabelSelector::everything())
            .await
        {
            Ok(objects) => {
                for obj in objects {
                    self.enqueue(kind, obj.key());
                }
            }
            Err(e) => warn!("Failed to list {} objects: {}", kind, e),
        }
    }

    async fn route(&self, event: WatchEvent) {
        debug!("Watch event {:?} {} {}", event.change, event.kind, event.key);
        self.enqueue(event.kind, event.key.clone());

        for owner in event.owners.iter().filter(|o| o.controller) {
            self.enqueue(
                owner.kind,
                ObjectKey::new(&event.key.namespace, &owner.name),
            );
        }

        for dependent in dependents(event.kind) {
            if self.controllers.contains_key(dependent) {
                self.enqueue_all(*dependent, Some(&event.key.namespace)).await;
            }
        }
    }

    fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for controller in self.controllers.values() {
            for worker in 0..controller.workers {
                let reconciler = Arc::clone(&controller.reconciler);
                let queue = Arc::clone(&controller.queue);
                handles.push(tokio::spawn(run_worker(reconciler, queue, worker)));
            }
        }
        handles
    }

    /// Run until shutdown is signalled
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut events = self.store.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(
            "Starting controller manager with {} controllers",
            self.controllers.len()
        );
        let kinds: Vec<Kind> = self.controllers.keys().copied().collect();
        for kind in &kinds {
            self.enqueue_all(*kind, None).await;
        }

        let workers = self.spawn_workers();

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.route(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Watch lagged by {} events, resyncing", missed);
                        for kind in &kinds {
                            self.enqueue_all(*kind, None).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Watch channel closed");
                        break;
                    }
                },
            }
        }

        info!("Shutting down controller manager");
        for controller in self.controllers.values() {
            controller.queue.shutdown();
        }
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!("Worker task failed: {}", e);
            }
        }
        Ok(())
    }
}

async fn run_worker(reconciler: Arc<dyn Reconciler>, queue: Arc<WorkQueue>, worker: usize) {
    debug!("{} worker {} started", reconciler.name(), worker);

    while let Some(key) = queue.get().await {
        match reconciler.reconcile(&key).await {
            Ok(action) => {
                queue.forget(&key);
                if let Some(delay) = action.requeue_delay() {
                    queue.add_after(key.clone(), delay);
                }
            }
            Err(e) => match classify(&e) {
                ErrorClass::Conflict => {
                    debug!("{} {}: conflict, retrying: {}", reconciler.name(), key, e);
                    queue.add(key.clone());
                }
                class if !class.is_retryable() => {
                    // Picked up again when the object next changes
                    queue.forget(&key);
                    warn!(
                        "{} {} reconcile failed ({:?}), not retrying: {:#}",
                        reconciler.name(),
                        key,
                        class,
                        e
                    );
                }
                class => {
                    let delay = queue.retry_with_backoff(&key);
                    warn!(
                        "{} {} reconcile failed ({:?}): {:#} (retry in {:?})",
                        reconciler.name(),
                        key,
                        class,
                        e,
                        delay
                    );
                }
            },
        }
        queue.done(&key);
    }

    debug!("{} worker {} stopped", reconciler.name(), worker);
}
