//! Secret lookup

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::api::{ObjectKey, SecretKeyRef, SecretSpec};
use crate::store::{ResourceStore, ResourceStoreExt};

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Value of `key` in the Secret `namespace/name`
    async fn get(&self, namespace: &str, name: &str, key: &str) -> Result<String>;

    async fn get_ref(&self, namespace: &str, secret_ref: &SecretKeyRef) -> Result<String> {
        self.get(namespace, &secret_ref.name, &secret_ref.key).await
    }
}

/// Reads Secret resources from the resource store
pub struct StoreSecrets {
    store: Arc<dyn ResourceStore>,
}

impl StoreSecrets {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SecretStore for StoreSecrets {
    async fn get(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let secret = self
            .store
            .get::<SecretSpec>(&ObjectKey::new(namespace, name))
            .await?;
        secret
            .spec
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("key {:?} not found in secret {:?}", key, name))
    }
}
