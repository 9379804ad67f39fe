//! Module deployment and rollout checks

use regex::Regex;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::kubectl::{Kubectl, KubectlError};

/// Error type for deployment
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("no pepr-module*.yaml in {0}")]
    ModuleNotFound(PathBuf),

    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Kubectl(#[from] KubectlError),

    #[error(transparent)]
    Pattern(#[from] regex::Error),
}

/// First `pepr-module*.yaml` in `build_dir`, by file name
pub async fn find_module_manifest(build_dir: &Path) -> Result<PathBuf, DeployError> {
    let pattern = Regex::new(r"pepr-module.*\.yaml")?;
    let io_error = |source| DeployError::Io {
        path: build_dir.to_path_buf(),
        source,
    };

    let mut dir = tokio::fs::read_dir(build_dir).await.map_err(io_error)?;
    let mut matches = Vec::new();
    while let Some(entry) = dir.next_entry().await.map_err(io_error)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if pattern.is_match(&name) {
            matches.push(name);
        }
    }

    matches.sort();
    matches
        .into_iter()
        .next()
        .map(|name| build_dir.join(name))
        .ok_or_else(|| DeployError::ModuleNotFound(build_dir.to_path_buf()))
}

/// `kubectl apply -f <build_dir>/pepr-module*.yaml`
#[instrument(skip(kubectl), fields(build_dir = %build_dir.display()))]
pub async fn deploy(kubectl: &Kubectl, build_dir: &Path) -> Result<PathBuf, DeployError> {
    let manifest = find_module_manifest(build_dir).await?;
    kubectl
        .run([OsStr::new("apply"), OsStr::new("-f"), manifest.as_os_str()])
        .await?;
    info!(manifest = %manifest.display(), "Deployed module");
    Ok(manifest)
}

/// Block until every deployment in `namespace` has rolled out
#[instrument(skip(kubectl))]
pub async fn ready(kubectl: &Kubectl, namespace: &str) -> Result<(), DeployError> {
    kubectl
        .run(["rollout", "status", "deployment", "-n", namespace])
        .await?;
    info!("Rollout complete");
    Ok(())
}
