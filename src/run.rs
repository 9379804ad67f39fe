//! Test run lifecycle
//!
//! [`TestRun`] strings the pieces together in the order a test needs them:
//!
//! ```text
//! lock -> clean -> setup -> synthesize -> [deploy -> ready] -> test body -> release
//! ```
//!
//! Each step finishes before the next starts. Waits are bounded by the run's
//! cancellation token and, when configured, `step_timeout`.
//!
//! # Example
//!
//! ```ignore
//! use kube_testrun::TestRun;
//!
//! let run = TestRun::connect(file!()).await?;
//! run.prepare().await?;
//!
//! run.apply_manifest(0u64).await?;
//! // assertions...
//!
//! run.release().await;
//! ```

use kube::core::DynamicObject;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{
    self, discover_crd_kinds, ClusterApi, ClusterError, Gvk, KindRegistry, KubeClusterApi,
    ResourceKind, SweepError, SweepReport, SweepScope,
};
use crate::config::{ConfigError, RunConfig};
use crate::deploy::{self, DeployError};
use crate::identity::{FixtureIndex, IdentityError, RunIdentity};
use crate::kubectl::Kubectl;
use crate::lock::{ClusterLock, LockError};
use crate::manifest::{self, SynthesisError};
use crate::poll::{PollError, WaitOptions};
use crate::render::{KubectlRenderer, ManifestRenderer};

/// Error type for test run operations
#[derive(Debug, thiserror::Error)]
pub enum TestRunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("failed to connect to cluster: {0}")]
    Connect(#[source] kube::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Sweep(#[from] SweepError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("no fixture with index {0}")]
    NoSuchManifest(FixtureIndex),

    #[error("no registered kind for {api_version} {kind}")]
    UnknownKind { api_version: String, kind: String },

    #[error("object has no apiVersion/kind")]
    Untyped,

    #[error("{step} cancelled")]
    Cancelled { step: &'static str },

    #[error("{step} did not finish within {timeout:?}")]
    StepTimeout {
        step: &'static str,
        timeout: Duration,
    },
}

/// One test run against the shared cluster
pub struct TestRun {
    identity: RunIdentity,
    config: RunConfig,
    api: Arc<dyn ClusterApi>,
    renderer: Arc<dyn ManifestRenderer>,
    kubectl: Kubectl,
    registry: Mutex<KindRegistry>,
    lock: ClusterLock,
    held: AtomicBool,
    cancel: CancellationToken,
}

impl TestRun {
    /// Assemble a run from its collaborators
    pub fn new(
        identity: RunIdentity,
        config: RunConfig,
        api: Arc<dyn ClusterApi>,
        renderer: Arc<dyn ManifestRenderer>,
    ) -> Self {
        let lock = ClusterLock::new(identity.lock_path(), identity.lock_owner())
            .interval(config.poll_interval)
            .timeout(config.step_timeout);

        Self {
            kubectl: Kubectl::from_config(&config),
            registry: Mutex::new(KindRegistry::with_builtins()),
            held: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            identity,
            config,
            api,
            renderer,
            lock,
        }
    }

    /// Connect to the default cluster with `TESTRUN_*` configuration
    pub async fn connect(source_file: impl AsRef<Path>) -> Result<Self, TestRunError> {
        let config = RunConfig::from_env()?;
        Self::connect_with(source_file, config).await
    }

    /// Connect to the default cluster with explicit configuration
    pub async fn connect_with(
        source_file: impl AsRef<Path>,
        config: RunConfig,
    ) -> Result<Self, TestRunError> {
        let identity = RunIdentity::new(source_file, &config)?;
        let api = KubeClusterApi::connect(config.field_manager.clone())
            .await
            .map_err(TestRunError::Connect)?;
        let renderer = KubectlRenderer::from_config(&config);

        info!(namespace = %identity.namespace(), "Connected test run");
        Ok(Self::new(identity, config, Arc::new(api), Arc::new(renderer)))
    }

    /// Use `token` to cancel every wait of this run
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replace the kubectl used for deploy and rollout checks
    #[must_use]
    pub fn with_kubectl(mut self, kubectl: Kubectl) -> Self {
        self.kubectl = kubectl;
        self
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn api(&self) -> &dyn ClusterApi {
        self.api.as_ref()
    }

    /// The run's namespace
    pub fn namespace(&self) -> &str {
        self.identity.namespace()
    }

    /// Token that cancels every wait of this run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether this run currently holds the cluster lock
    pub fn holds_lock(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    fn wait_options(&self) -> WaitOptions {
        WaitOptions::new(self.cancel.clone())
            .interval(self.config.poll_interval)
            .timeout(self.config.step_timeout)
    }

    /// Wait for the cluster lock
    pub async fn lock(&self) -> Result<(), TestRunError> {
        self.lock.acquire(&self.cancel).await?;
        self.held.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Release the cluster lock if this run holds it
    ///
    /// Failures are logged; a lock that cannot be removed needs a human.
    pub async fn release(&self) {
        if !self.held.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "Failed to release cluster lock");
        }
    }

    /// Remove everything previous runs of this capability left behind
    pub async fn clean(&self) -> Result<SweepReport, TestRunError> {
        let scope = SweepScope::for_run(&self.identity, &self.config);
        let mut registry = self.registry.lock().await;
        let report = cluster::clean(
            self.api.as_ref(),
            &mut registry,
            &scope,
            &self.wait_options(),
        )
        .await?;

        for (kind, count) in cluster::sweep::summarize(&report) {
            info!(kind = %kind, count, "Removed");
        }
        Ok(report)
    }

    /// Create the run's namespace
    pub async fn setup(&self) -> Result<(), TestRunError> {
        cluster::setup(self.api.as_ref(), &self.identity).await?;
        Ok(())
    }

    /// Write the run-scoped JSON for every fixture
    pub async fn synthesize(&self) -> Result<Vec<PathBuf>, TestRunError> {
        Ok(manifest::synthesize(self.renderer.as_ref(), &self.identity).await?)
    }

    /// lock, clean, setup and synthesize, in that order
    #[instrument(skip(self), fields(namespace = %self.identity.namespace()))]
    pub async fn prepare(&self) -> Result<(), TestRunError> {
        self.lock().await?;
        self.clean().await?;
        self.setup().await?;
        self.synthesize().await?;
        info!("Test run prepared");
        Ok(())
    }

    /// Apply the module manifest found in `build_dir`
    pub async fn deploy(&self, build_dir: &Path) -> Result<PathBuf, TestRunError> {
        let work = deploy::deploy(&self.kubectl, build_dir);
        self.bounded("deploy", async { work.await.map_err(TestRunError::from) })
            .await
    }

    /// Wait for the system namespace's deployments to roll out
    pub async fn ready(&self) -> Result<(), TestRunError> {
        let work = deploy::ready(&self.kubectl, &self.config.system_namespace);
        self.bounded("ready", async { work.await.map_err(TestRunError::from) })
            .await
    }

    /// Path of the synthesized fixture with `index`
    pub fn manifest(&self, index: impl Into<FixtureIndex>) -> Result<&Path, TestRunError> {
        let index = index.into();
        self.identity
            .manifest(index.clone())
            .ok_or(TestRunError::NoSuchManifest(index))
    }

    /// Apply every object of the synthesized fixture with `index`
    #[instrument(skip(self, index))]
    pub async fn apply_manifest(
        &self,
        index: impl Into<FixtureIndex>,
    ) -> Result<Vec<DynamicObject>, TestRunError> {
        let path = self.manifest(index)?;
        let objects = manifest::read_manifest(path).await?;

        let mut applied = Vec::with_capacity(objects.len());
        for object in &objects {
            let kind = self.kind_of(object).await?;
            applied.push(self.api.apply(&kind, object).await?);
            info!(object = %cluster::describe(&kind, object), "Applied");
        }
        Ok(applied)
    }

    /// `true` once `object` is no longer served
    pub async fn is_gone(&self, object: &DynamicObject) -> Result<bool, TestRunError> {
        let kind = self.kind_of(object).await?;
        Ok(cluster::is_gone(self.api.as_ref(), &kind, object).await?)
    }

    /// Poll `condition` with the run's interval, deadline and cancellation
    pub async fn wait_for<F, Fut, E>(&self, condition: F) -> Result<(), PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        self.wait_options().poll(condition).await_condition().await
    }

    /// Registered kind for `object`
    ///
    /// On a miss, CRDs are rediscovered once and then the server is asked
    /// directly; a kind found either way is kept in the registry.
    async fn kind_of(&self, object: &DynamicObject) -> Result<ResourceKind, TestRunError> {
        let types = object.types.as_ref().ok_or(TestRunError::Untyped)?;

        let mut registry = self.registry.lock().await;
        if let Some(kind) = registry.lookup(&types.api_version, &types.kind) {
            return Ok(kind.clone());
        }

        discover_crd_kinds(self.api.as_ref(), &mut registry).await?;
        if let Some(kind) = registry.lookup(&types.api_version, &types.kind) {
            return Ok(kind.clone());
        }

        let gvk = Gvk::from_api_version(&types.api_version, types.kind.clone());
        match self.api.resolve(&gvk).await? {
            Some(kind) => {
                debug!(kind = %kind.name, "Registered served kind");
                registry.register(kind.clone());
                Ok(kind)
            }
            None => Err(TestRunError::UnknownKind {
                api_version: types.api_version.clone(),
                kind: types.kind.clone(),
            }),
        }
    }

    async fn bounded<T, F>(&self, step: &'static str, work: F) -> Result<T, TestRunError>
    where
        F: Future<Output = Result<T, TestRunError>>,
    {
        let timed = async {
            match self.config.step_timeout {
                Some(timeout) => tokio::time::timeout(timeout, work)
                    .await
                    .unwrap_or(Err(TestRunError::StepTimeout { step, timeout })),
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TestRunError::Cancelled { step }),
            result = timed => result,
        }
    }
}
