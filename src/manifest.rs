//! Fixture manifest synthesis
//!
//! Each fixture YAML is rendered through a dry run, stripped of fields the
//! client or server injected, rescoped to the run's namespace, labeled with
//! the run's ownership label and written next to the source as a pretty
//! printed `List`.
//!
//! ```text
//! widget.test.0.yaml  --render-->  {ConfigMap cm-alpha, namespace: default}
//!                     --prepare--> {ConfigMap cm-alpha, namespace: <run ns>, labels: {<key>: <unique>}}
//! widget.test.0.yaml.json          {"kind": "List", "apiVersion": "v1", "items": [...]}
//! ```

use kube::core::DynamicObject;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use crate::identity::{ManifestEntry, RunIdentity};
use crate::render::{ManifestRenderer, RenderError};

/// Annotation prefix written by `kubectl apply`
pub const KUBECTL_ANNOTATION_PREFIX: &str = "kubectl.kubernetes.io/";

/// Metadata the API server fills in on a dry run
const SERVER_POPULATED: &[&str] = &[
    "uid",
    "resourceVersion",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
];

/// Error type for manifest synthesis
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("{path}: invalid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: item {index} is not a JSON object")]
    NotAnObject { path: PathBuf, index: usize },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Run-scoped values injected into every fixture object
#[derive(Debug, Clone, Copy)]
pub struct RunScope<'a> {
    pub namespace: &'a str,
    pub label_key: &'a str,
    pub unique: &'a str,
}

impl<'a> From<&'a RunIdentity> for RunScope<'a> {
    fn from(identity: &'a RunIdentity) -> Self {
        Self {
            namespace: identity.namespace(),
            label_key: identity.label_key(),
            unique: identity.unique(),
        }
    }
}

/// Objects of a rendered document: the items of a `List`, else the document
#[must_use]
pub fn list_items(rendered: Value) -> Vec<Value> {
    match rendered {
        Value::Object(mut doc) if doc.get("kind").and_then(Value::as_str) == Some("List") => {
            match doc.remove("items") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            }
        }
        other => vec![other],
    }
}

/// `{"kind": "List", "apiVersion": "v1", "items": items}`
#[must_use]
pub fn wrap_list(items: Vec<Value>) -> Value {
    json!({
        "kind": "List",
        "apiVersion": "v1",
        "items": items,
    })
}

/// Strip injected metadata from `object` and apply the run scope
///
/// Returns `false` when `object` is not a JSON object.
pub fn prepare_object(object: &mut Value, scope: RunScope<'_>) -> bool {
    let Some(object) = object.as_object_mut() else {
        return false;
    };

    let metadata = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    let Some(metadata) = metadata.as_object_mut() else {
        return false;
    };

    for field in SERVER_POPULATED {
        metadata.remove(*field);
    }

    if let Some(Value::Object(annotations)) = metadata.get_mut("annotations") {
        annotations.retain(|key, _| !key.starts_with(KUBECTL_ANNOTATION_PREFIX));
    }
    let drop_annotations = match metadata.get("annotations") {
        Some(Value::Object(annotations)) => annotations.is_empty(),
        Some(Value::Null) => true,
        _ => false,
    };
    if drop_annotations {
        metadata.remove("annotations");
    }

    metadata.remove("namespace");
    metadata.insert(
        "namespace".to_string(),
        Value::String(scope.namespace.to_string()),
    );

    let labels = metadata
        .entry("labels")
        .or_insert_with(|| Value::Object(Map::new()));
    if !labels.is_object() {
        *labels = Value::Object(Map::new());
    }
    if let Some(labels) = labels.as_object_mut() {
        labels.insert(
            scope.label_key.to_string(),
            Value::String(scope.unique.to_string()),
        );
    }

    true
}

/// Turn one rendered document into the pretty JSON written to disk
pub fn synthesize_document(
    rendered: &str,
    scope: RunScope<'_>,
    path: &Path,
) -> Result<String, SynthesisError> {
    let doc: Value = serde_json::from_str(rendered).map_err(|source| SynthesisError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let mut items = list_items(doc);
    for (index, item) in items.iter_mut().enumerate() {
        if !prepare_object(item, scope) {
            return Err(SynthesisError::NotAnObject {
                path: path.to_path_buf(),
                index,
            });
        }
    }

    serde_json::to_string_pretty(&wrap_list(items)).map_err(|source| SynthesisError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Render, prepare and write one fixture
pub async fn synthesize_entry(
    renderer: &dyn ManifestRenderer,
    entry: &ManifestEntry,
    scope: RunScope<'_>,
) -> Result<(), SynthesisError> {
    let rendered = renderer.render(&entry.source).await?;
    let json = synthesize_document(&rendered, scope, &entry.source)?;

    tokio::fs::write(&entry.rendered, json)
        .await
        .map_err(|source| SynthesisError::Io {
            path: entry.rendered.clone(),
            source,
        })?;

    debug!(rendered = %entry.rendered.display(), "Wrote fixture");
    Ok(())
}

/// Synthesize every fixture of `identity`, one after another, in index order
#[instrument(skip_all, fields(namespace = %identity.namespace()))]
pub async fn synthesize(
    renderer: &dyn ManifestRenderer,
    identity: &RunIdentity,
) -> Result<Vec<PathBuf>, SynthesisError> {
    let scope = RunScope::from(identity);
    let mut written = Vec::with_capacity(identity.manifests().len());

    for entry in identity.manifests() {
        synthesize_entry(renderer, entry, scope).await?;
        written.push(entry.rendered.clone());
    }

    info!(count = written.len(), "Synthesized fixtures");
    Ok(written)
}

/// Objects of a synthesized fixture file
pub async fn read_manifest(path: &Path) -> Result<Vec<DynamicObject>, SynthesisError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SynthesisError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let doc: Value = serde_json::from_str(&text).map_err(|source| SynthesisError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    list_items(doc)
        .into_iter()
        .map(|item| {
            serde_json::from_value(item).map_err(|source| SynthesisError::Json {
                path: path.to_path_buf(),
                source,
            })
        })
        .collect()
}
