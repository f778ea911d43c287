//! Resource store
//!
//! Generic object store with optimistic concurrency and watch notification:
//! - `ResourceStore`: object-safe trait over untyped objects
//! - `ResourceStoreExt`: typed helpers for `Object<S>`
//! - `MemoryStore`: in-process backend
//! - `SqliteStore`: persistent backend shared between CLI processes

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::api::{DynamicObject, Kind, Object, ObjectKey, OwnerReference, ResourceSpec};
use crate::error::StoreError;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{Database, SqliteStore};

pub type StoreResult<T> = Result<T, StoreError>;

/// Capacity of the watch broadcast channel
pub(crate) const WATCH_CAPACITY: usize = 1024;

/// Equality-based label selector; an empty selector matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchChange {
    Created,
    Updated,
    Deleted,
}

/// Change notification sent to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub kind: Kind,
    pub key: ObjectKey,
    pub owners: Vec<OwnerReference>,
    pub change: WatchChange,
}

impl WatchEvent {
    pub(crate) fn for_object(obj: &DynamicObject, change: WatchChange) -> Self {
        Self {
            kind: obj.kind,
            key: obj.key(),
            owners: obj.metadata.owner_references.clone(),
            change,
        }
    }
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_dynamic(&self, kind: Kind, key: &ObjectKey) -> StoreResult<DynamicObject>;

    /// List objects of `kind`, optionally restricted to one namespace
    async fn list_dynamic(
        &self,
        kind: Kind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<DynamicObject>>;

    /// Insert a new object; assigns uid, version 1 and creation time
    async fn create_dynamic(&self, obj: DynamicObject) -> StoreResult<DynamicObject>;

    /// Create, or replace spec/labels/owners of an existing object keeping its status
    async fn apply_dynamic(&self, obj: DynamicObject) -> StoreResult<DynamicObject>;

    /// Conditional status write against the version the caller last read
    async fn update_status_dynamic(
        &self,
        kind: Kind,
        key: &ObjectKey,
        status: Value,
        expected_version: u64,
    ) -> StoreResult<DynamicObject>;

    /// Delete an object and, recursively, everything it owns. Returns what was removed.
    async fn delete(&self, kind: Kind, key: &ObjectKey) -> StoreResult<Vec<(Kind, ObjectKey)>>;

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;
}

fn decode<S: ResourceSpec>(obj: DynamicObject) -> StoreResult<Object<S>> {
    obj.into_typed::<S>().map_err(|source| StoreError::Codec {
        kind: S::KIND,
        source,
    })
}

fn encode<S: ResourceSpec>(obj: Object<S>) -> StoreResult<DynamicObject> {
    obj.into_dynamic().map_err(|source| StoreError::Codec {
        kind: S::KIND,
        source,
    })
}

/// Typed access on top of any `ResourceStore`
#[async_trait]
pub trait ResourceStoreExt: ResourceStore {
    async fn get<S: ResourceSpec>(&self, key: &ObjectKey) -> StoreResult<Object<S>> {
        decode(self.get_dynamic(S::KIND, key).await?)
    }

    /// Like `get`, mapping NotFound to `None`
    async fn try_get<S: ResourceSpec>(&self, key: &ObjectKey) -> StoreResult<Option<Object<S>>> {
        match self.get_dynamic(S::KIND, key).await {
            Ok(obj) => decode(obj).map(Some),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list<S: ResourceSpec>(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<Object<S>>> {
        self.list_dynamic(S::KIND, Some(namespace), selector)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    async fn create<S: ResourceSpec>(&self, obj: Object<S>) -> StoreResult<Object<S>> {
        decode(self.create_dynamic(encode(obj)?).await?)
    }

    async fn apply<S: ResourceSpec>(&self, obj: Object<S>) -> StoreResult<Object<S>> {
        decode(self.apply_dynamic(encode(obj)?).await?)
    }

    /// Write `obj.status` if the stored version still equals `obj.metadata.resource_version`
    async fn update_status<S: ResourceSpec>(&self, obj: &Object<S>) -> StoreResult<Object<S>> {
        let status = serde_json::to_value(&obj.status).map_err(|source| StoreError::Codec {
            kind: S::KIND,
            source,
        })?;
        let updated = self
            .update_status_dynamic(S::KIND, &obj.key(), status, obj.metadata.resource_version)
            .await?;
        decode(updated)
    }
}

impl<T: ResourceStore + ?Sized> ResourceStoreExt for T {}
