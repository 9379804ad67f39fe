//! Label-driven resource sweep
//!
//! `clean` removes every object a run owns, plus the system namespace, and
//! only returns once the API server confirms each one is gone. Terminating
//! namespaces block re-creation, so "delete requested" is not enough.

use futures::future::{join_all, try_join_all};
use kube::core::DynamicObject;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use super::kinds::{discover_crd_kinds, KindRegistry, ResourceKind};
use super::{describe, is_gone, ClusterApi, ClusterError};
use crate::config::{OwnershipMatch, RunConfig};
use crate::identity::{label_prefix, RunIdentity};
use crate::poll::{PollError, WaitOptions};

/// Error type for the sweep
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("{object} still present: {reason}")]
    NotConverged { object: String, reason: String },
}

/// Which objects a sweep removes
#[derive(Debug, Clone)]
pub struct SweepScope {
    pub label_key: String,
    pub matching: OwnershipMatch,
    pub system_namespace: String,
}

impl SweepScope {
    pub fn new(label_key: impl Into<String>, system_namespace: impl Into<String>) -> Self {
        Self {
            label_key: label_key.into(),
            matching: OwnershipMatch::default(),
            system_namespace: system_namespace.into(),
        }
    }

    /// Scope for a run identity under `config`
    pub fn for_run(identity: &RunIdentity, config: &RunConfig) -> Self {
        Self {
            label_key: identity.label_key().to_string(),
            matching: config.ownership_match,
            system_namespace: config.system_namespace.clone(),
        }
    }

    #[must_use]
    pub fn matching(mut self, matching: OwnershipMatch) -> Self {
        self.matching = matching;
        self
    }

    /// Does the sweep remove `object` of `kind`?
    #[must_use]
    pub fn owns(&self, kind: &ResourceKind, object: &DynamicObject) -> bool {
        if self.is_system_namespace(kind, object) {
            return true;
        }

        let Some(labels) = &object.metadata.labels else {
            return false;
        };
        match self.matching {
            OwnershipMatch::ExactKey => labels.contains_key(&self.label_key),
            OwnershipMatch::KeyPrefix => {
                let prefix = label_prefix(&self.label_key);
                labels.keys().any(|key| label_prefix(key) == prefix)
            }
        }
    }

    fn is_system_namespace(&self, kind: &ResourceKind, object: &DynamicObject) -> bool {
        kind.gvk.group.is_empty()
            && kind.gvk.kind == "Namespace"
            && object.metadata.name.as_deref() == Some(self.system_namespace.as_str())
    }
}

/// What a sweep did
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Kinds listed successfully
    pub kinds_listed: usize,
    /// Kinds skipped because listing answered 404/403/405
    pub kinds_skipped: Vec<String>,
    /// `Kind/ns/name` of every removed object
    pub removed: Vec<String>,
}

/// Remove every object in `scope` and wait until all are gone
///
/// CRD kinds are discovered into `registry` first. Deletes are issued
/// concurrently; the waits for absence also run concurrently.
#[instrument(skip_all, fields(label_key = %scope.label_key))]
pub async fn clean(
    api: &dyn ClusterApi,
    registry: &mut KindRegistry,
    scope: &SweepScope,
    wait: &WaitOptions,
) -> Result<SweepReport, SweepError> {
    let discovered = discover_crd_kinds(api, registry).await?;
    debug!(discovered, kinds = registry.len(), "Candidate kinds ready");

    let mut report = SweepReport::default();

    let listings = join_all(registry.iter().map(|kind| async move {
        let listed = api.list(kind).await;
        (kind, listed)
    }))
    .await;

    let mut owned: Vec<(&ResourceKind, DynamicObject)> = Vec::new();
    for (kind, listed) in listings {
        match listed {
            Ok(objects) => {
                report.kinds_listed += 1;
                owned.extend(
                    objects
                        .into_iter()
                        .filter(|object| scope.owns(kind, object))
                        .map(|object| (kind, object)),
                );
            }
            Err(e) if e.is_excluded_from_listing() => {
                debug!(kind = %kind.name, error = %e, "Skipping kind");
                report.kinds_skipped.push(kind.name.clone());
            }
            Err(e) => return Err(e.into()),
        }
    }

    if owned.is_empty() {
        info!(kinds = report.kinds_listed, "Nothing to clean");
        return Ok(report);
    }

    info!(count = owned.len(), "Deleting owned resources");

    try_join_all(owned.iter().map(|(kind, object)| async move {
        match api.delete(kind, object).await {
            Ok(()) => {
                debug!(object = %describe(kind, object), "Delete requested");
                Ok(())
            }
            Err(e) if e.is_absent() => {
                debug!(object = %describe(kind, object), "Already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }))
    .await?;

    report.removed = try_join_all(
        owned
            .iter()
            .map(|(kind, object)| await_absence(api, kind, object, wait)),
    )
    .await?;

    info!(removed = report.removed.len(), "Sweep complete");
    Ok(report)
}

async fn await_absence(
    api: &dyn ClusterApi,
    kind: &ResourceKind,
    object: &DynamicObject,
    wait: &WaitOptions,
) -> Result<String, SweepError> {
    let name = describe(kind, object);
    match wait
        .poll(|| is_gone(api, kind, object))
        .await_condition()
        .await
    {
        Ok(()) => {
            debug!(object = %name, "Confirmed gone");
            Ok(name)
        }
        Err(PollError::Predicate(e)) => Err(e.into()),
        Err(e) => {
            warn!(object = %name, error = %e, "Gave up waiting for deletion");
            Err(SweepError::NotConverged {
                object: name,
                reason: e.to_string(),
            })
        }
    }
}

/// Removed object count per kind
#[must_use]
pub fn summarize(report: &SweepReport) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for removed in &report.removed {
        let kind = removed.split('/').next().unwrap_or_default().to_string();
        *counts.entry(kind).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{crd_object, object, FakeCluster};
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const LABEL_KEY: &str = "capability-name/test-transient";

    fn wait() -> WaitOptions {
        WaitOptions::new(CancellationToken::new()).interval(Duration::from_millis(10))
    }

    fn config_map() -> ResourceKind {
        ResourceKind::builtin::<ConfigMap>(true)
    }

    fn namespace() -> ResourceKind {
        ResourceKind::builtin::<Namespace>(false)
    }

    fn scope() -> SweepScope {
        SweepScope::new(LABEL_KEY, "pepr-system")
    }

    #[test]
    fn test_owns_by_label_prefix() {
        let kind = config_map();
        let scope = scope();

        let exact = object(&kind, Some("ns"), "a", &[(LABEL_KEY, "123")]);
        let legacy = object(&kind, Some("ns"), "b", &[("capability-name/other", "x")]);
        let foreign = object(&kind, Some("ns"), "c", &[("other-name/test-transient", "1")]);
        let unlabeled = object(&kind, Some("ns"), "d", &[]);

        assert!(scope.owns(&kind, &exact));
        assert!(scope.owns(&kind, &legacy));
        assert!(!scope.owns(&kind, &foreign));
        assert!(!scope.owns(&kind, &unlabeled));
    }

    #[test]
    fn test_owns_by_exact_key() {
        let kind = config_map();
        let scope = scope().matching(OwnershipMatch::ExactKey);

        let exact = object(&kind, Some("ns"), "a", &[(LABEL_KEY, "")]);
        let legacy = object(&kind, Some("ns"), "b", &[("capability-name/other", "x")]);

        assert!(scope.owns(&kind, &exact));
        assert!(!scope.owns(&kind, &legacy));
    }

    #[test]
    fn test_system_namespace_is_always_owned() {
        let scope = scope();

        assert!(scope.owns(&namespace(), &object(&namespace(), None, "pepr-system", &[])));
        assert!(!scope.owns(&namespace(), &object(&namespace(), None, "default", &[])));
        // Only the Namespace kind takes the fast path
        let cm = object(&config_map(), Some("x"), "pepr-system", &[]);
        assert!(!scope.owns(&config_map(), &cm));
    }

    #[tokio::test]
    async fn test_clean_removes_owned_and_keeps_the_rest() {
        let api = FakeCluster::new().with_deletion_delay(2);
        let cm = config_map();
        let ns = namespace();

        api.insert(&ns, object(&ns, None, "run-ns", &[(LABEL_KEY, "1")]));
        api.insert(&ns, object(&ns, None, "pepr-system", &[]));
        api.insert(&ns, object(&ns, None, "default", &[]));
        api.insert(&cm, object(&cm, Some("run-ns"), "owned", &[(LABEL_KEY, "1")]));
        api.insert(&cm, object(&cm, Some("default"), "kept", &[("app", "x")]));

        let mut registry = KindRegistry::with_builtins();
        let report = clean(&api, &mut registry, &scope(), &wait()).await.unwrap();

        assert_eq!(report.removed.len(), 3);
        assert!(!api.contains(&ns, None, "run-ns"));
        assert!(!api.contains(&ns, None, "pepr-system"));
        assert!(!api.contains(&cm, Some("run-ns"), "owned"));
        assert!(api.contains(&ns, None, "default"));
        assert!(api.contains(&cm, Some("default"), "kept"));

        let counts = summarize(&report);
        assert_eq!(counts.get("Namespace"), Some(&2));
        assert_eq!(counts.get("ConfigMap"), Some(&1));
    }

    #[tokio::test]
    async fn test_clean_sweeps_crd_derived_kinds() {
        let api = FakeCluster::new();
        let crd_kind = ResourceKind::builtin::<CustomResourceDefinition>(false);
        api.insert(
            &crd_kind,
            crd_object("pepr.dev", "CrdTest", "crdtests", "Namespaced", &["v1"]),
        );

        let custom = ResourceKind::custom("pepr.dev", "v1", "CrdTest", "crdtests", true);
        api.insert(&custom, object(&custom, Some("run-ns"), "cr", &[(LABEL_KEY, "1")]));
        api.insert(&custom, object(&custom, Some("run-ns"), "other", &[]));

        let mut registry = KindRegistry::with_builtins();
        clean(&api, &mut registry, &scope(), &wait()).await.unwrap();

        assert!(registry.lookup("pepr.dev/v1", "CrdTest").is_some());
        assert!(!api.contains(&custom, Some("run-ns"), "cr"));
        assert!(api.contains(&custom, Some("run-ns"), "other"));
    }

    #[tokio::test]
    async fn test_clean_skips_unlistable_kinds() {
        let api = FakeCluster::new();
        let secret = ResourceKind::builtin::<Secret>(true);
        let cm = config_map();
        api.forbid(&secret);
        api.unserve(&namespace());
        api.insert(&cm, object(&cm, Some("ns"), "owned", &[(LABEL_KEY, "1")]));

        let mut registry = KindRegistry::with_builtins();
        let report = clean(&api, &mut registry, &scope(), &wait()).await.unwrap();

        assert!(report.kinds_skipped.contains(&"Secret".to_string()));
        assert!(report.kinds_skipped.contains(&"Namespace".to_string()));
        assert_eq!(report.removed, vec!["ConfigMap/ns/owned".to_string()]);
    }

    #[tokio::test]
    async fn test_clean_with_nothing_owned_deletes_nothing() {
        let api = FakeCluster::new();
        let cm = config_map();
        api.insert(&cm, object(&cm, Some("default"), "kept", &[]));

        let mut registry = KindRegistry::with_builtins();
        let report = clean(&api, &mut registry, &scope(), &wait()).await.unwrap();

        assert!(report.removed.is_empty());
        assert!(api.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_existence_check_error_aborts() {
        let api = FakeCluster::new().with_deletion_delay(5);
        let cm = config_map();
        api.insert(&cm, object(&cm, Some("ns"), "owned", &[(LABEL_KEY, "1")]));
        api.fail_gets(&cm);

        let mut registry = KindRegistry::with_builtins();
        let err = clean(&api, &mut registry, &scope(), &wait())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SweepError::Cluster(ClusterError::Api { code: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_error_aborts() {
        let api = FakeCluster::new();
        let cm = config_map();
        api.insert(&cm, object(&cm, Some("ns"), "owned", &[(LABEL_KEY, "1")]));
        api.fail_deletes(&cm);

        let mut registry = KindRegistry::with_builtins();
        let err = clean(&api, &mut registry, &scope(), &wait())
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::Cluster(_)));
    }

    #[tokio::test]
    async fn test_stuck_deletion_times_out() {
        let api = FakeCluster::new().with_deletion_delay(u32::MAX);
        let cm = config_map();
        api.insert(&cm, object(&cm, Some("ns"), "stuck", &[(LABEL_KEY, "1")]));

        let mut registry = KindRegistry::with_builtins();
        let wait = wait().timeout(Some(Duration::from_millis(100)));
        let err = clean(&api, &mut registry, &scope(), &wait)
            .await
            .unwrap_err();

        match err {
            SweepError::NotConverged { object, .. } => assert_eq!(object, "ConfigMap/ns/stuck"),
            other => panic!("expected NotConverged, got {other:?}"),
        }
    }
}
