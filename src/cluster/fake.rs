//! In-memory cluster for unit tests

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::core::{DynamicObject, TypeMeta};
use serde_json::json;

use super::{object_name, ClusterApi, ClusterError, Gvk, ResourceKind};

type Key = (Gvk, Option<String>, String);

struct Stored {
    object: DynamicObject,
    /// Remaining `get` calls that still see the object after deletion
    terminating: Option<u32>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Stored>,
    served: BTreeMap<Gvk, ResourceKind>,
    forbidden: HashSet<Gvk>,
    unserved: HashSet<Gvk>,
    failing_gets: HashSet<Gvk>,
    failing_deletes: HashSet<Gvk>,
    deletion_delay: u32,
    deletes: Vec<String>,
    applies: Vec<String>,
}

/// Fake API server: deletion takes `deletion_delay` gets to complete
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Deleted objects stay visible for `gets` more get calls
    pub(crate) fn with_deletion_delay(self, gets: u32) -> Self {
        self.state().deletion_delay = gets;
        self
    }

    pub(crate) fn insert(&self, kind: &ResourceKind, mut object: DynamicObject) {
        set_types(kind, &mut object);
        let key = key(kind, &object);
        self.state().objects.insert(
            key,
            Stored {
                object,
                terminating: None,
            },
        );
    }

    /// Discovery reports `kind` as served
    pub(crate) fn serve(&self, kind: &ResourceKind) {
        self.state().served.insert(kind.gvk.clone(), kind.clone());
    }

    /// Listing `kind` answers 403
    pub(crate) fn forbid(&self, kind: &ResourceKind) {
        self.state().forbidden.insert(kind.gvk.clone());
    }

    /// Listing `kind` answers 404
    pub(crate) fn unserve(&self, kind: &ResourceKind) {
        self.state().unserved.insert(kind.gvk.clone());
    }

    /// Every get of `kind` answers 500
    pub(crate) fn fail_gets(&self, kind: &ResourceKind) {
        self.state().failing_gets.insert(kind.gvk.clone());
    }

    /// Every delete of `kind` answers 500
    pub(crate) fn fail_deletes(&self, kind: &ResourceKind) {
        self.state().failing_deletes.insert(kind.gvk.clone());
    }

    pub(crate) fn contains(&self, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> bool {
        let key = (
            kind.gvk.clone(),
            namespace.map(str::to_string),
            name.to_string(),
        );
        self.state().objects.contains_key(&key)
    }

    pub(crate) fn stored(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let key = (
            kind.gvk.clone(),
            namespace.map(str::to_string),
            name.to_string(),
        );
        self.state().objects.get(&key).map(|s| s.object.clone())
    }

    /// `Kind/ns/name` of every delete call, in order
    pub(crate) fn deletes(&self) -> Vec<String> {
        self.state().deletes.clone()
    }

    /// `Kind/ns/name` of every apply call, in order
    pub(crate) fn applies(&self) -> Vec<String> {
        self.state().applies.clone()
    }
}

fn set_types(kind: &ResourceKind, object: &mut DynamicObject) {
    if object.types.is_none() {
        object.types = Some(TypeMeta {
            api_version: kind.gvk.api_version(),
            kind: kind.gvk.kind.clone(),
        });
    }
}

fn key(kind: &ResourceKind, object: &DynamicObject) -> Key {
    (
        kind.gvk.clone(),
        object.metadata.namespace.clone(),
        object.metadata.name.clone().unwrap_or_default(),
    )
}

fn not_found(kind: &ResourceKind, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind: kind.name.clone(),
        name: name.to_string(),
    }
}

fn server_error(kind: &ResourceKind, name: &str) -> ClusterError {
    ClusterError::Api {
        kind: kind.name.clone(),
        name: name.to_string(),
        code: 500,
        message: "internal error".to_string(),
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list(&self, kind: &ResourceKind) -> Result<Vec<DynamicObject>, ClusterError> {
        let state = self.state();
        if state.forbidden.contains(&kind.gvk) {
            return Err(ClusterError::Forbidden {
                kind: kind.name.clone(),
                name: "*".to_string(),
                message: "forbidden".to_string(),
            });
        }
        if state.unserved.contains(&kind.gvk) {
            return Err(not_found(kind, "*"));
        }
        Ok(state
            .objects
            .iter()
            .filter(|((gvk, _, _), _)| *gvk == kind.gvk)
            .map(|(_, stored)| stored.object.clone())
            .collect())
    }

    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError> {
        let mut state = self.state();
        if state.failing_gets.contains(&kind.gvk) {
            return Err(server_error(kind, name));
        }

        let key = (
            kind.gvk.clone(),
            namespace.map(str::to_string),
            name.to_string(),
        );
        let finished = match state.objects.get_mut(&key) {
            None => return Err(not_found(kind, name)),
            Some(stored) => match stored.terminating.as_mut() {
                None => return Ok(stored.object.clone()),
                Some(0) => true,
                Some(remaining) => {
                    *remaining -= 1;
                    return Ok(stored.object.clone());
                }
            },
        };

        if finished {
            state.objects.remove(&key);
        }
        Err(not_found(kind, name))
    }

    async fn apply(
        &self,
        kind: &ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        object_name(kind, object)?;
        let mut object = object.clone();
        set_types(kind, &mut object);

        let mut state = self.state();
        state.applies.push(super::describe(kind, &object));
        state.objects.insert(
            key(kind, &object),
            Stored {
                object: object.clone(),
                terminating: None,
            },
        );
        Ok(object)
    }

    async fn delete(&self, kind: &ResourceKind, object: &DynamicObject) -> Result<(), ClusterError> {
        let name = object_name(kind, object)?;
        let mut state = self.state();
        if state.failing_deletes.contains(&kind.gvk) {
            return Err(server_error(kind, name));
        }

        let delay = state.deletion_delay;
        state.deletes.push(super::describe(kind, object));
        match state.objects.get_mut(&key(kind, object)) {
            None => Err(not_found(kind, name)),
            Some(stored) => {
                if stored.terminating.is_none() {
                    stored.terminating = Some(delay);
                }
                Ok(())
            }
        }
    }

    async fn resolve(&self, gvk: &Gvk) -> Result<Option<ResourceKind>, ClusterError> {
        Ok(self.state().served.get(gvk).cloned())
    }
}

/// Object of `kind` with the given labels
pub(crate) fn object(
    kind: &ResourceKind,
    namespace: Option<&str>,
    name: &str,
    labels: &[(&str, &str)],
) -> DynamicObject {
    let mut object = DynamicObject::new(name, &kind.to_api_resource());
    object.metadata.namespace = namespace.map(str::to_string);
    if !labels.is_empty() {
        object.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );
    }
    object
}

/// CustomResourceDefinition object serving `versions`
pub(crate) fn crd_object(
    group: &str,
    kind: &str,
    plural: &str,
    scope: &str,
    versions: &[&str],
) -> DynamicObject {
    let crd_kind = ResourceKind::builtin::<
        k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    >(false);
    let versions: Vec<_> = versions
        .iter()
        .enumerate()
        .map(|(i, v)| json!({ "name": v, "served": true, "storage": i == 0 }))
        .collect();

    let mut object = DynamicObject::new(&format!("{plural}.{group}"), &crd_kind.to_api_resource())
        .data(json!({
            "spec": {
                "group": group,
                "names": { "kind": kind, "plural": plural },
                "scope": scope,
                "versions": versions,
            }
        }));
    set_types(&crd_kind, &mut object);
    object
}
