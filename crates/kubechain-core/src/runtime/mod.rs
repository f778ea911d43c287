//! Reconcile runtime
//!
//! - `Reconciler`: one controller, invoked per object key
//! - `WorkQueue`: per-key exclusivity, de-duplication, delayed adds, backoff
//! - `ControllerManager`: watches the store and drives the workers

use async_trait::async_trait;
use std::time::Duration;

use crate::api::{Kind, ObjectKey};

mod manager;
mod queue;

pub use manager::ControllerManager;
pub use queue::{Backoff, WorkQueue};

/// Outcome of one reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing more to do until the object or a dependency changes
    pub fn done() -> Self {
        Self { requeue_after: None }
    }

    /// Reconcile again right away
    pub fn requeue() -> Self {
        Self {
            requeue_after: Some(Duration::ZERO),
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    pub fn requeue_delay(&self) -> Option<Duration> {
        self.requeue_after
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    fn kind(&self) -> Kind;

    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Read the object, compute the next state, write it. Must be idempotent.
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<Action>;
}
