//! Run namespace provisioning

use k8s_openapi::api::core::v1::Namespace;
use kube::core::DynamicObject;
use std::collections::BTreeMap;
use tracing::{info, instrument};

use super::kinds::ResourceKind;
use super::{ClusterApi, ClusterError};
use crate::identity::RunIdentity;

/// The run's Namespace, labeled `{label_key: unique}`
#[must_use]
pub fn namespace_object(identity: &RunIdentity) -> DynamicObject {
    let kind = ResourceKind::builtin::<Namespace>(false);
    let mut namespace = DynamicObject::new(identity.namespace(), &kind.to_api_resource());
    namespace.metadata.labels = Some(BTreeMap::from([(
        identity.label_key().to_string(),
        identity.unique().to_string(),
    )]));
    namespace
}

/// Create or update the run's namespace
///
/// Does not wait for the namespace to become active.
#[instrument(skip_all, fields(namespace = %identity.namespace()))]
pub async fn setup(
    api: &dyn ClusterApi,
    identity: &RunIdentity,
) -> Result<DynamicObject, ClusterError> {
    let kind = ResourceKind::builtin::<Namespace>(false);
    let applied = api.apply(&kind, &namespace_object(identity)).await?;
    info!("Applied run namespace");
    Ok(applied)
}
