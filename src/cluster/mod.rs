//! Cluster access for the lifecycle coordinator
//!
//! Everything the coordinator does to the cluster goes through the
//! [`ClusterApi`] trait: list, get, apply and delete of untyped objects of a
//! [`ResourceKind`]. [`KubeClusterApi`] implements it on a `kube::Client`;
//! tests use an in-memory fake.
//!
//! # Errors
//!
//! API failures are classified by HTTP status into [`ClusterError`]. Only
//! [`ClusterError::is_absent`] and [`ClusterError::is_excluded_from_listing`]
//! decide which statuses count as "expected".

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, GroupVersionKind, TypeMeta};
use kube::discovery::{self, Scope};
use kube::Client;
use tracing::debug;

pub mod kinds;
pub mod setup;
pub mod sweep;

#[cfg(test)]
pub(crate) mod fake;

pub use kinds::{discover_crd_kinds, Gvk, KindRegistry, ResourceKind};
pub use setup::{namespace_object, setup};
pub use sweep::{clean, SweepError, SweepReport, SweepScope};

/// Errors from cluster operations
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}': permission denied (check RBAC): {message}")]
    Forbidden {
        kind: String,
        name: String,
        message: String,
    },

    #[error("{kind} '{name}': method not allowed: {message}")]
    MethodNotAllowed {
        kind: String,
        name: String,
        message: String,
    },

    #[error("{kind} '{name}': API error {code}: {message}")]
    Api {
        kind: String,
        name: String,
        code: u16,
        message: String,
    },

    #[error("{kind} '{name}': {source}")]
    Transport {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to decode {kind}: {message}")]
    Decode { kind: String, message: String },

    #[error("{kind} object has no metadata.name")]
    Unnamed { kind: String },
}

impl ClusterError {
    /// Classify a kube error for `kind`/`name`
    #[must_use]
    pub fn from_kube(err: kube::Error, kind: &ResourceKind, name: &str) -> Self {
        let kind = kind.name.clone();
        let name = name.to_string();
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => ClusterError::NotFound { kind, name },
                403 => ClusterError::Forbidden {
                    kind,
                    name,
                    message: ae.message,
                },
                405 => ClusterError::MethodNotAllowed {
                    kind,
                    name,
                    message: ae.message,
                },
                code => ClusterError::Api {
                    kind,
                    name,
                    code,
                    message: ae.message,
                },
            },
            source => ClusterError::Transport { kind, name, source },
        }
    }

    /// HTTP status behind this error, if the API server answered
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            ClusterError::NotFound { .. } => Some(404),
            ClusterError::Forbidden { .. } => Some(403),
            ClusterError::MethodNotAllowed { .. } => Some(405),
            ClusterError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The object (or its kind) does not exist: 404 or 405
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self.status(), Some(404 | 405))
    }

    /// A kind that cannot be listed and is skipped by the sweep: 404, 403 or 405
    #[must_use]
    pub fn is_excluded_from_listing(&self) -> bool {
        matches!(self.status(), Some(403 | 404 | 405))
    }
}

/// Untyped cluster operations used by the coordinator
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every object of `kind` across all namespaces
    async fn list(&self, kind: &ResourceKind) -> Result<Vec<DynamicObject>, ClusterError>;

    /// Get one object
    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError>;

    /// Create or update `object`
    async fn apply(
        &self,
        kind: &ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    /// Request deletion of `object`
    async fn delete(&self, kind: &ResourceKind, object: &DynamicObject) -> Result<(), ClusterError>;

    /// How the server serves `gvk`, `None` when it does not
    async fn resolve(&self, _gvk: &Gvk) -> Result<Option<ResourceKind>, ClusterError> {
        Ok(None)
    }
}

/// `true` once `object` can no longer be fetched
///
/// 404/405 mean gone; any other error is returned.
pub async fn is_gone(
    api: &dyn ClusterApi,
    kind: &ResourceKind,
    object: &DynamicObject,
) -> Result<bool, ClusterError> {
    let name = object_name(kind, object)?;
    match api
        .get(kind, object.metadata.namespace.as_deref(), name)
        .await
    {
        Ok(_) => Ok(false),
        Err(e) if e.is_absent() => Ok(true),
        Err(e) => Err(e),
    }
}

/// `metadata.name` of `object`
pub fn object_name<'a>(
    kind: &ResourceKind,
    object: &'a DynamicObject,
) -> Result<&'a str, ClusterError> {
    object
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ClusterError::Unnamed {
            kind: kind.name.clone(),
        })
}

/// `kind/namespace/name` for log lines
#[must_use]
pub fn describe(kind: &ResourceKind, object: &DynamicObject) -> String {
    let name = object.metadata.name.as_deref().unwrap_or("<unnamed>");
    match object.metadata.namespace.as_deref() {
        Some(ns) => format!("{}/{ns}/{name}", kind.name),
        None => format!("{}/{name}", kind.name),
    }
}

/// [`ClusterApi`] backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    field_manager: String,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    /// Connect using the default kubeconfig / in-cluster config
    pub async fn connect(field_manager: impl Into<String>) -> Result<Self, kube::Error> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, field_manager))
    }

    /// Underlying client
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.to_api_resource();
        match (kind.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (true, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (false, _) => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list(&self, kind: &ResourceKind) -> Result<Vec<DynamicObject>, ClusterError> {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &kind.to_api_resource());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::from_kube(e, kind, "*"))?;

        debug!(kind = %kind.name, count = list.items.len(), "Listed resources");
        Ok(list.items)
    }

    async fn get(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClusterError> {
        self.api(kind, namespace)
            .get(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, kind, name))
    }

    async fn apply(
        &self,
        kind: &ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let name = object_name(kind, object)?;

        let mut object = object.clone();
        if object.types.is_none() {
            object.types = Some(TypeMeta {
                api_version: kind.gvk.api_version(),
                kind: kind.gvk.kind.clone(),
            });
        }

        let patch_params = PatchParams::apply(&self.field_manager).force();
        self.api(kind, object.metadata.namespace.as_deref())
            .patch(name, &patch_params, &Patch::Apply(&object))
            .await
            .map_err(|e| ClusterError::from_kube(e, kind, name))
    }

    async fn delete(&self, kind: &ResourceKind, object: &DynamicObject) -> Result<(), ClusterError> {
        let name = object_name(kind, object)?;
        self.api(kind, object.metadata.namespace.as_deref())
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube(e, kind, name))
    }

    async fn resolve(&self, gvk: &Gvk) -> Result<Option<ResourceKind>, ClusterError> {
        let target = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        match discovery::pinned_kind(&self.client, &target).await {
            Ok((ar, caps)) => {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                debug!(gvk = %gvk, namespaced, "Resolved kind through discovery");
                Ok(Some(ResourceKind::served(ar, namespaced)))
            }
            Err(kube::Error::Discovery(e)) => {
                debug!(gvk = %gvk, error = %e, "Kind not served");
                Ok(None)
            }
            Err(e) => {
                let guess = ResourceKind::served(ApiResource::from_gvk(&target), true);
                let err = ClusterError::from_kube(e, &guess, "*");
                if err.is_absent() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }
}
