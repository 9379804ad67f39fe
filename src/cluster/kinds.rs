//! Resource kind registry
//!
//! The sweep enumerates "every kind the cluster knows about". That set is the
//! built-in kinds plus one entry per version of every installed
//! CustomResourceDefinition, discovered at clean time.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, LimitRange, Namespace, PersistentVolume, PersistentVolumeClaim, Pod,
    ResourceQuota, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::{ApiResource, DynamicObject};
use tracing::{debug, instrument};

use super::{ClusterApi, ClusterError};

/// Group/Version/Kind triple
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Split an `apiVersion` ("apps/v1", "v1") and pair it with `kind`
    pub fn from_api_version(api_version: &str, kind: impl Into<String>) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// `apiVersion` as written in manifests
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// A listable kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKind {
    /// Registry name: the kind for built-ins, `<Version><Kind>` for CRD kinds
    pub name: String,
    pub gvk: Gvk,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceKind {
    /// Kind for a k8s-openapi type
    pub fn builtin<K>(namespaced: bool) -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Self::served(ApiResource::erase::<K>(&()), namespaced)
    }

    /// Kind as reported by API discovery
    pub fn served(ar: ApiResource, namespaced: bool) -> Self {
        Self {
            name: ar.kind.clone(),
            gvk: Gvk::new(ar.group, ar.version, ar.kind),
            plural: ar.plural,
            namespaced,
        }
    }

    /// Kind served by one version of a CRD
    pub fn custom(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
        namespaced: bool,
    ) -> Self {
        let gvk = Gvk::new(group, version, kind);
        Self {
            name: format!("{}{}", capitalize(&gvk.version), gvk.kind),
            gvk,
            plural: plural.into(),
            namespaced,
        }
    }

    /// `ApiResource` for dynamic API calls
    #[must_use]
    pub fn to_api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.gvk.group.clone(),
            version: self.gvk.version.clone(),
            api_version: self.gvk.api_version(),
            kind: self.gvk.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Set of kinds known to this run
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<Gvk, ResourceKind>,
}

impl KindRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the built-in kinds
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in [
            ResourceKind::builtin::<Namespace>(false),
            ResourceKind::builtin::<ConfigMap>(true),
            ResourceKind::builtin::<Secret>(true),
            ResourceKind::builtin::<ServiceAccount>(true),
            ResourceKind::builtin::<Service>(true),
            ResourceKind::builtin::<Endpoints>(true),
            ResourceKind::builtin::<Pod>(true),
            ResourceKind::builtin::<PersistentVolumeClaim>(true),
            ResourceKind::builtin::<PersistentVolume>(false),
            ResourceKind::builtin::<LimitRange>(true),
            ResourceKind::builtin::<ResourceQuota>(true),
            ResourceKind::builtin::<Deployment>(true),
            ResourceKind::builtin::<StatefulSet>(true),
            ResourceKind::builtin::<DaemonSet>(true),
            ResourceKind::builtin::<ReplicaSet>(true),
            ResourceKind::builtin::<Job>(true),
            ResourceKind::builtin::<CronJob>(true),
            ResourceKind::builtin::<Ingress>(true),
            ResourceKind::builtin::<NetworkPolicy>(true),
            ResourceKind::builtin::<Role>(true),
            ResourceKind::builtin::<RoleBinding>(true),
            ResourceKind::builtin::<ClusterRole>(false),
            ResourceKind::builtin::<ClusterRoleBinding>(false),
            ResourceKind::builtin::<MutatingWebhookConfiguration>(false),
            ResourceKind::builtin::<ValidatingWebhookConfiguration>(false),
            ResourceKind::builtin::<PodDisruptionBudget>(true),
            ResourceKind::builtin::<HorizontalPodAutoscaler>(true),
            ResourceKind::builtin::<StorageClass>(false),
            ResourceKind::builtin::<CustomResourceDefinition>(false),
        ] {
            registry.register(kind);
        }
        registry
    }

    /// Add `kind`; returns `false` if its GVK was already registered
    pub fn register(&mut self, kind: ResourceKind) -> bool {
        if self.kinds.contains_key(&kind.gvk) {
            return false;
        }
        self.kinds.insert(kind.gvk.clone(), kind);
        true
    }

    /// Kind registered for `gvk`
    #[must_use]
    pub fn get(&self, gvk: &Gvk) -> Option<&ResourceKind> {
        self.kinds.get(gvk)
    }

    /// Kind registered for a manifest's `apiVersion`/`kind`
    #[must_use]
    pub fn lookup(&self, api_version: &str, kind: &str) -> Option<&ResourceKind> {
        self.get(&Gvk::from_api_version(api_version, kind))
    }

    /// Kind for an object's type metadata
    #[must_use]
    pub fn kind_of(&self, object: &DynamicObject) -> Option<&ResourceKind> {
        let types = object.types.as_ref()?;
        self.lookup(&types.api_version, &types.kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceKind> {
        self.kinds.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Register one kind per version of every installed CRD
///
/// A cluster that refuses to list CRDs (404/403/405) contributes nothing.
/// Returns the number of newly registered kinds.
#[instrument(skip_all)]
pub async fn discover_crd_kinds(
    api: &dyn ClusterApi,
    registry: &mut KindRegistry,
) -> Result<usize, ClusterError> {
    let crd_kind = ResourceKind::builtin::<CustomResourceDefinition>(false);
    let objects = match api.list(&crd_kind).await {
        Ok(objects) => objects,
        Err(e) if e.is_excluded_from_listing() => {
            debug!(error = %e, "CRDs not listable, skipping discovery");
            return Ok(0);
        }
        Err(e) => return Err(e),
    };

    let mut added = 0;
    for object in objects {
        let crd = decode_crd(&crd_kind, object)?;
        let spec = &crd.spec;
        let namespaced = spec.scope == "Namespaced";
        for version in &spec.versions {
            let kind = ResourceKind::custom(
                &spec.group,
                &version.name,
                &spec.names.kind,
                &spec.names.plural,
                namespaced,
            );
            let name = kind.name.clone();
            if registry.register(kind) {
                debug!(kind = %name, "Registered CRD kind");
                added += 1;
            }
        }
    }

    Ok(added)
}

fn decode_crd(
    crd_kind: &ResourceKind,
    object: DynamicObject,
) -> Result<CustomResourceDefinition, ClusterError> {
    let decode = |e: serde_json::Error| ClusterError::Decode {
        kind: crd_kind.name.clone(),
        message: e.to_string(),
    };
    let value = serde_json::to_value(object).map_err(decode)?;
    serde_json::from_value(value).map_err(decode)
}
