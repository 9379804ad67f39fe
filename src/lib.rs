//! kube-testrun - shared-cluster lifecycle for Kubernetes end-to-end tests
//!
//! Many test suites can share one cluster safely: a lock file serializes
//! them, a label-driven sweep removes whatever earlier runs left behind
//! (including custom resources of CRDs discovered at runtime), each run gets
//! a private labeled namespace, and fixture manifests are rescoped to it.
//!
//! # Example
//!
//! ```ignore
//! use kube_testrun::TestRun;
//!
//! // tests/widget_test.rs, next to widget.test.0.yaml
//! #[kube_testrun::test]
//! async fn widget_applies(run: &TestRun) {
//!     let applied = run.apply_manifest(0u64).await.unwrap();
//!     assert_eq!(applied[0].metadata.namespace.as_deref(), Some(run.namespace()));
//! }
//! ```
//!
//! # Without the macro
//!
//! ```ignore
//! use kube_testrun::TestRun;
//!
//! let run = TestRun::connect("tests/widget_test.rs").await?;
//! run.prepare().await?;   // lock, clean, setup, synthesize
//! run.deploy("dist".as_ref()).await?;
//! run.ready().await?;
//! // ...
//! run.release().await;
//! ```

pub mod cluster;
pub mod config;
pub mod deploy;
pub mod identity;
pub mod kubectl;
pub mod lock;
pub mod manifest;
pub mod poll;
pub mod render;
pub mod run;
pub mod telemetry;

// Re-export commonly used types
pub use cluster::{
    clean, is_gone, setup, ClusterApi, ClusterError, Gvk, KindRegistry, KubeClusterApi,
    ResourceKind, SweepError, SweepReport, SweepScope,
};
pub use config::{ConfigError, DryRun, OwnershipMatch, RunConfig};
pub use deploy::{deploy, ready, DeployError};
pub use identity::{FixtureIndex, IdentityError, ManifestEntry, RunIdentity};
pub use kubectl::{Kubectl, KubectlError};
pub use lock::{ClusterLock, LockError};
pub use manifest::{synthesize, SynthesisError};
pub use poll::{poll_until, PollError, WaitOptions};
pub use render::{KubectlRenderer, ManifestRenderer, RenderError};
pub use run::{TestRun, TestRunError};
pub use telemetry::init_logging;

/// Attribute macro wiring the run lifecycle into a tokio test
pub use kube_testrun_macros::test;

#[doc(hidden)]
pub mod __private {
    pub use futures::FutureExt;
    pub use tokio;
}
