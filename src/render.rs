//! Dry-run rendering of fixture YAML
//!
//! A renderer turns a YAML file into the JSON the cluster's admission and
//! defaulting pipeline would produce, without persisting anything.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::config::{DryRun, RunConfig};
use crate::kubectl::{Kubectl, KubectlError};

/// Error type for rendering
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("rendering {path}: {source}")]
    Kubectl {
        path: PathBuf,
        #[source]
        source: KubectlError,
    },

    #[error("rendering {path}: {message}")]
    Other { path: PathBuf, message: String },
}

/// Renders a manifest file to JSON text
#[async_trait]
pub trait ManifestRenderer: Send + Sync {
    async fn render(&self, path: &Path) -> Result<String, RenderError>;
}

/// `kubectl apply -f <path> --dry-run=<mode> --output json`
#[derive(Debug, Clone)]
pub struct KubectlRenderer {
    kubectl: Kubectl,
    dry_run: DryRun,
}

impl KubectlRenderer {
    pub fn new(kubectl: Kubectl, dry_run: DryRun) -> Self {
        Self { kubectl, dry_run }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(Kubectl::from_config(config), config.dry_run)
    }

    fn args<'a>(&self, path: &'a Path) -> Vec<&'a OsStr> {
        let dry_run = match self.dry_run {
            DryRun::Server => "--dry-run=server",
            DryRun::Client => "--dry-run=client",
        };
        vec![
            OsStr::new("apply"),
            OsStr::new("-f"),
            path.as_os_str(),
            OsStr::new(dry_run),
            OsStr::new("--output"),
            OsStr::new("json"),
        ]
    }
}

#[async_trait]
impl ManifestRenderer for KubectlRenderer {
    #[instrument(skip(self), fields(dry_run = self.dry_run.as_flag()))]
    async fn render(&self, path: &Path) -> Result<String, RenderError> {
        let rendered = self
            .kubectl
            .run(self.args(path))
            .await
            .map_err(|source| RenderError::Kubectl {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(bytes = rendered.len(), "Rendered manifest");
        Ok(rendered)
    }
}
