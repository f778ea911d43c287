//! In-memory resource store

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    LabelSelector, ResourceStore, StoreResult, WatchChange, WatchEvent, WATCH_CAPACITY,
};
use crate::api::{DynamicObject, Kind, ObjectKey};
use crate::error::StoreError;

type Index = BTreeMap<(Kind, ObjectKey), DynamicObject>;

/// Store backed by a `BTreeMap`; all state is lost on drop
pub struct MemoryStore {
    objects: RwLock<Index>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn notify(&self, event: WatchEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_dynamic(&self, kind: Kind, key: &ObjectKey) -> StoreResult<DynamicObject> {
        self.objects
            .read()
            .get(&(kind, key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind,
                key: key.clone(),
            })
    }

    async fn list_dynamic(
        &self,
        kind: Kind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<DynamicObject>> {
        let objects = self.objects.read();
        Ok(objects
            .iter()
            .filter(|((k, key), _)| *k == kind && namespace.map_or(true, |ns| key.namespace == ns))
            .filter(|(_, obj)| selector.matches(&obj.metadata.labels))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create_dynamic(&self, mut obj: DynamicObject) -> StoreResult<DynamicObject> {
        let index_key = (obj.kind, obj.key());
        {
            let mut objects = self.objects.write();
            if objects.contains_key(&index_key) {
                return Err(StoreError::AlreadyExists {
                    kind: obj.kind,
                    key: obj.key(),
                });
            }
            obj.metadata.uid = uuid::Uuid::new_v4().to_string();
            obj.metadata.resource_version = 1;
            obj.metadata.creation_timestamp = Some(Utc::now());
            objects.insert(index_key, obj.clone());
        }
        debug!("Created {} {}", obj.kind, obj.key());
        self.notify(WatchEvent::for_object(&obj, WatchChange::Created));
        Ok(obj)
    }

    async fn apply_dynamic(&self, obj: DynamicObject) -> StoreResult<DynamicObject> {
        let index_key = (obj.kind, obj.key());
        let updated = {
            let mut objects = self.objects.write();
            match objects.get_mut(&index_key) {
                Some(existing) => {
                    existing.spec = obj.spec;
                    existing.metadata.labels = obj.metadata.labels;
                    if !obj.metadata.owner_references.is_empty() {
                        existing.metadata.owner_references = obj.metadata.owner_references;
                    }
                    existing.metadata.resource_version += 1;
                    Ok(existing.clone())
                }
                None => Err(obj),
            }
        };

        match updated {
            Ok(obj) => {
                self.notify(WatchEvent::for_object(&obj, WatchChange::Updated));
                Ok(obj)
            }
            Err(missing) => self.create_dynamic(missing).await,
        }
    }

    async fn update_status_dynamic(
        &self,
        kind: Kind,
        key: &ObjectKey,
        status: Value,
        expected_version: u64,
    ) -> StoreResult<DynamicObject> {
        let updated = {
            let mut objects = self.objects.write();
            let existing =
                objects
                    .get_mut(&(kind, key.clone()))
                    .ok_or_else(|| StoreError::NotFound {
                        kind,
                        key: key.clone(),
                    })?;
            if existing.metadata.resource_version != expected_version {
                return Err(StoreError::Conflict {
                    kind,
                    key: key.clone(),
                    expected: expected_version,
                    actual: existing.metadata.resource_version,
                });
            }
            existing.status = status;
            existing.metadata.resource_version += 1;
            existing.clone()
        };
        self.notify(WatchEvent::for_object(&updated, WatchChange::Updated));
        Ok(updated)
    }

    async fn delete(&self, kind: Kind, key: &ObjectKey) -> StoreResult<Vec<(Kind, ObjectKey)>> {
        let removed = {
            let mut objects = self.objects.write();
            let root = objects
                .remove(&(kind, key.clone()))
                .ok_or_else(|| StoreError::NotFound {
                    kind,
                    key: key.clone(),
                })?;

            let mut removed = vec![root];
            let mut owners: HashSet<String> = HashSet::from([removed[0].metadata.uid.clone()]);
            loop {
                let children: Vec<(Kind, ObjectKey)> = objects
                    .iter()
                    .filter(|(_, obj)| {
                        obj.metadata
                            .owner_references
                            .iter()
                            .any(|o| owners.contains(&o.uid))
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
                if children.is_empty() {
                    break;
                }
                for child in children {
                    if let Some(obj) = objects.remove(&child) {
                        owners.insert(obj.metadata.uid.clone());
                        removed.push(obj);
                    }
                }
            }
            removed
        };

        for obj in &removed {
            debug!("Deleted {} {}", obj.kind, obj.key());
            self.notify(WatchEvent::for_object(obj, WatchChange::Deleted));
        }
        Ok(removed.iter().map(|o| (o.kind, o.key())).collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
