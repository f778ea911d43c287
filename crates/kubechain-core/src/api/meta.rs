//! Object metadata shared by every resource kind
//!
//! Typed resources are `Object<S>` where `S` is the kind's spec type.
//! The store works on `DynamicObject`, the same shape with JSON spec/status.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_VERSION: &str = "kubechain.humanlayer.dev/v1alpha1";
pub const DEFAULT_NAMESPACE: &str = "default";

/// Resource kinds known to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Task,
    TaskRun,
    TaskRunToolCall,
    Agent,
    #[serde(rename = "LLM")]
    Llm,
    Tool,
    ContactChannel,
    #[serde(rename = "MCPServer")]
    McpServer,
    Secret,
}

impl Kind {
    pub const ALL: [Kind; 9] = [
        Kind::Task,
        Kind::TaskRun,
        Kind::TaskRunToolCall,
        Kind::Agent,
        Kind::Llm,
        Kind::Tool,
        Kind::ContactChannel,
        Kind::McpServer,
        Kind::Secret,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Task => "Task",
            Kind::TaskRun => "TaskRun",
            Kind::TaskRunToolCall => "TaskRunToolCall",
            Kind::Agent => "Agent",
            Kind::Llm => "LLM",
            Kind::Tool => "Tool",
            Kind::ContactChannel => "ContactChannel",
            Kind::McpServer => "MCPServer",
            Kind::Secret => "Secret",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    /// Accepts the kind name in any case, singular or plural (`taskrun`, `TaskRuns`, `llms`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let singular = lower.strip_suffix('s').unwrap_or(&lower);
        Kind::ALL
            .into_iter()
            .find(|k| {
                let name = k.as_str().to_ascii_lowercase();
                name == lower || name == singular
            })
            .ok_or_else(|| format!("unknown resource kind: {}", s))
    }
}

/// Namespaced object identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Link from a child object to the object that owns it.
///
/// Deleting the owner deletes every object carrying its uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: Kind,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner_references.push(owner);
        self
    }

    /// The owner marked as controller, if any
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|o| o.controller)
    }
}

/// Reference to another object in the same namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

impl LocalObjectReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A single key inside a Secret
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// `apiKeyFrom: { secretKeyRef: { name, key } }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySource {
    pub secret_key_ref: SecretKeyRef,
}

/// Coarse readiness shared by the dependency kinds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadinessStatus {
    #[default]
    Pending,
    Ready,
    Error,
}

impl fmt::Display for ReadinessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessStatus::Pending => write!(f, "Pending"),
            ReadinessStatus::Ready => write!(f, "Ready"),
            ReadinessStatus::Error => write!(f, "Error"),
        }
    }
}

/// Spec type of a resource kind; ties the spec to its kind and status type
pub trait ResourceSpec:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    const KIND: Kind;
    type Status: Serialize + DeserializeOwned + Clone + fmt::Debug + Default + Send + Sync + 'static;
}

/// A typed resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct Object<S: ResourceSpec> {
    pub metadata: ObjectMeta,
    pub spec: S,
    #[serde(default)]
    pub status: S::Status,
}

impl<S: ResourceSpec> Object<S> {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: S) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: S::Status::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Owner reference pointing at this object, marked as controller
    pub fn controller_ref(&self) -> OwnerReference {
        OwnerReference {
            kind: S::KIND,
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            controller: true,
        }
    }

    pub fn into_dynamic(self) -> serde_json::Result<DynamicObject> {
        Ok(DynamicObject {
            kind: S::KIND,
            metadata: self.metadata,
            spec: serde_json::to_value(self.spec)?,
            status: serde_json::to_value(self.status)?,
        })
    }
}

/// Untyped resource as held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicObject {
    pub kind: Kind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub status: Value,
}

impl DynamicObject {
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Decode into a typed object. A null status decodes as the default status.
    pub fn into_typed<S: ResourceSpec>(self) -> serde_json::Result<Object<S>> {
        let status = if self.status.is_null() {
            S::Status::default()
        } else {
            serde_json::from_value(self.status)?
        };
        Ok(Object {
            metadata: self.metadata,
            spec: serde_json::from_value(self.spec)?,
            status,
        })
    }
}
