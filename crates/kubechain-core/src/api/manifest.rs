//! YAML manifests
//!
//! A manifest file holds one or more `---`-separated documents of the form
//! `{ apiVersion, kind, metadata, spec }`.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::meta::{DynamicObject, Kind, ObjectMeta, API_VERSION};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest document {index}: {source}")]
    Parse {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("document {index}: unsupported apiVersion {found:?} (expected {})", API_VERSION)]
    ApiVersion { index: usize, found: String },
    #[error("document {index}: metadata.name is required")]
    MissingName { index: usize },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    api_version: Option<String>,
    kind: Kind,
    metadata: ObjectMeta,
    #[serde(default)]
    spec: Value,
}

/// Parse every document in `input`. Empty documents are skipped.
pub fn parse_manifests(input: &str) -> Result<Vec<DynamicObject>, ManifestError> {
    let mut objects = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(input).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|source| ManifestError::Parse { index, source })?;
        if value.is_null() {
            continue;
        }

        let manifest: Manifest = serde_yaml::from_value(value)
            .map_err(|source| ManifestError::Parse { index, source })?;

        if let Some(found) = manifest.api_version {
            if found != API_VERSION {
                return Err(ManifestError::ApiVersion { index, found });
            }
        }
        if manifest.metadata.name.is_empty() {
            return Err(ManifestError::MissingName { index });
        }

        objects.push(DynamicObject {
            kind: manifest.kind,
            metadata: manifest.metadata,
            spec: manifest.spec,
            status: Value::Null,
        });
    }

    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Task, TaskSpec};

    const SAMPLE: &str = r#"
apiVersion: kubechain.humanlayer.dev/v1alpha1
kind: Secret
metadata:
  name: openai
spec:
  data:
    OPENAI_API_KEY: sk-test
---
apiVersion: kubechain.humanlayer.dev/v1alpha1
kind: Task
metadata:
  name: add-numbers
  namespace: math
spec:
  agentRef:
    name: calculator
  userMessage: what is 2 + 3?
---
"#;

    #[test]
    fn parses_multi_document_file() {
        let objects = parse_manifests(SAMPLE).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind, Kind::Secret);
        assert_eq!(objects[0].metadata.namespace, "default");

        let task: Task = objects[1].clone().into_typed::<TaskSpec>().unwrap();
        assert_eq!(task.namespace(), "math");
        assert_eq!(task.spec.agent_ref.name, "calculator");
        assert_eq!(task.spec.user_message, "what is 2 + 3?");
    }

    #[test]
    fn rejects_foreign_api_version() {
        let err = parse_manifests("apiVersion: v1\nkind: Task\nmetadata: {name: x}\n").unwrap_err();
        assert!(matches!(err, ManifestError::ApiVersion { .. }));
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = parse_manifests("kind: Pod\nmetadata: {name: x}\n").unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }
}
