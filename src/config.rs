//! Configuration types for test runs
//!
//! `RunConfig` controls how a run identity is derived, how fixtures are
//! rendered and how long the coordinator waits between convergence checks.
//! Build it programmatically, or overlay environment variables with
//! [`RunConfig::from_env`].
//!
//! # Example
//!
//! ```
//! use kube_testrun::config::{DryRun, OwnershipMatch, RunConfig};
//! use std::time::Duration;
//!
//! let config = RunConfig::new()
//!     .marker_file("package.json")
//!     .test_suffix(".test.ts")
//!     .dry_run(DryRun::Client)
//!     .ownership_match(OwnershipMatch::ExactKey)
//!     .poll_interval(Duration::from_millis(500));
//!
//! assert_eq!(config.lock_file_name, "cluster.lock");
//! ```

use std::time::Duration;

/// Environment variable overriding the kubectl binary
pub const ENV_KUBECTL: &str = "TESTRUN_KUBECTL";
/// Environment variable selecting `client` or `server` dry-run rendering
pub const ENV_DRY_RUN: &str = "TESTRUN_DRY_RUN";
/// Environment variable overriding the poll interval in milliseconds
pub const ENV_POLL_INTERVAL_MS: &str = "TESTRUN_POLL_INTERVAL_MS";
/// Environment variable bounding every waiting step, in seconds
pub const ENV_STEP_TIMEOUT_SECS: &str = "TESTRUN_STEP_TIMEOUT_SECS";
/// Environment variable supplying an explicit unique run token
pub const ENV_UNIQUE: &str = "TESTRUN_UNIQUE";
/// Environment variable that, when `true`, keeps the cluster lock after a test
pub const ENV_KEEP_LOCK: &str = "TESTRUN_KEEP_LOCK";

/// `true` when `TESTRUN_KEEP_LOCK=true`
#[must_use]
pub fn keep_lock() -> bool {
    std::env::var(ENV_KEEP_LOCK).is_ok_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// How fixture YAML is rendered before synthesis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DryRun {
    /// `kubectl apply --dry-run=server`: admission and defaulting run server-side
    #[default]
    Server,
    /// `kubectl apply --dry-run=client`: rendered locally by kubectl
    Client,
}

impl DryRun {
    /// Value passed to kubectl's `--dry-run` flag
    #[must_use]
    pub fn as_flag(self) -> &'static str {
        match self {
            DryRun::Server => "server",
            DryRun::Client => "client",
        }
    }
}

impl std::str::FromStr for DryRun {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "server" => Ok(DryRun::Server),
            "client" => Ok(DryRun::Client),
            other => Err(format!("expected 'client' or 'server', got '{other}'")),
        }
    }
}

/// Which labels prove that the sweep owns a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OwnershipMatch {
    /// Any label whose key shares the ownership key's prefix (the part before `/`)
    #[default]
    KeyPrefix,
    /// Only the exact ownership label key
    ExactKey,
}

/// Test run configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// File marking the project root (searched upward from the test's directory)
    pub marker_file: String,

    /// Recognized test-file suffixes, tried in order
    pub test_suffixes: Vec<String>,

    /// Lock file name, created in the project root
    pub lock_file_name: String,

    /// System namespace swept on every clean and watched for rollout
    pub system_namespace: String,

    /// Fixed interval between convergence checks
    pub poll_interval: Duration,

    /// Field manager for server-side apply
    pub field_manager: String,

    /// kubectl binary used for rendering and deployment
    pub kubectl: String,

    /// Dry-run mode used when rendering fixtures
    pub dry_run: DryRun,

    /// Ownership predicate used by the sweep
    pub ownership_match: OwnershipMatch,

    /// Optional deadline applied to each waiting step
    pub step_timeout: Option<Duration>,

    /// Explicit unique token (defaults to the current timestamp)
    pub unique: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            marker_file: "Cargo.toml".to_string(),
            test_suffixes: vec!["_test.rs".to_string()],
            lock_file_name: "cluster.lock".to_string(),
            system_namespace: "pepr-system".to_string(),
            poll_interval: Duration::from_secs(1),
            field_manager: "kube-testrun".to_string(),
            kubectl: "kubectl".to_string(),
            dry_run: DryRun::default(),
            ownership_match: OwnershipMatch::default(),
            step_timeout: None,
            unique: None,
        }
    }
}

impl RunConfig {
    /// Create config with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `TESTRUN_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_source(|var| std::env::var(var).ok())
    }

    /// Overlay values from an arbitrary variable source
    pub fn with_env_source<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kubectl) = lookup(ENV_KUBECTL) {
            self.kubectl = kubectl;
        }

        if let Some(value) = lookup(ENV_DRY_RUN) {
            self.dry_run = value.parse().map_err(|reason| ConfigError::InvalidEnv {
                var: ENV_DRY_RUN,
                value: value.clone(),
                reason,
            })?;
        }

        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            let ms: u64 = value.trim().parse().map_err(|e| ConfigError::InvalidEnv {
                var: ENV_POLL_INTERVAL_MS,
                value: value.clone(),
                reason: format!("{e}"),
            })?;
            self.poll_interval = Duration::from_millis(ms);
        }

        if let Some(value) = lookup(ENV_STEP_TIMEOUT_SECS) {
            let secs: u64 = value.trim().parse().map_err(|e| ConfigError::InvalidEnv {
                var: ENV_STEP_TIMEOUT_SECS,
                value: value.clone(),
                reason: format!("{e}"),
            })?;
            self.step_timeout = Some(Duration::from_secs(secs));
        }

        if let Some(unique) = lookup(ENV_UNIQUE).filter(|u| !u.is_empty()) {
            self.unique = Some(unique);
        }

        Ok(self)
    }

    /// Set the project root marker file
    #[must_use]
    pub fn marker_file(mut self, name: impl Into<String>) -> Self {
        self.marker_file = name.into();
        self
    }

    /// Replace the recognized test-file suffixes with a single suffix
    #[must_use]
    pub fn test_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.test_suffixes = vec![suffix.into()];
        self
    }

    /// Replace the recognized test-file suffixes
    #[must_use]
    pub fn test_suffixes(mut self, suffixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.test_suffixes = suffixes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the lock file name
    #[must_use]
    pub fn lock_file_name(mut self, name: impl Into<String>) -> Self {
        self.lock_file_name = name.into();
        self
    }

    /// Set the system namespace
    #[must_use]
    pub fn system_namespace(mut self, ns: impl Into<String>) -> Self {
        self.system_namespace = ns.into();
        self
    }

    /// Set the poll interval
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the server-side apply field manager
    #[must_use]
    pub fn field_manager(mut self, manager: impl Into<String>) -> Self {
        self.field_manager = manager.into();
        self
    }

    /// Set the kubectl binary
    #[must_use]
    pub fn kubectl(mut self, path: impl Into<String>) -> Self {
        self.kubectl = path.into();
        self
    }

    /// Set the dry-run mode
    #[must_use]
    pub fn dry_run(mut self, mode: DryRun) -> Self {
        self.dry_run = mode;
        self
    }

    /// Set the sweep ownership predicate
    #[must_use]
    pub fn ownership_match(mut self, mode: OwnershipMatch) -> Self {
        self.ownership_match = mode;
        self
    }

    /// Bound each waiting step
    #[must_use]
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Use an explicit unique token
    #[must_use]
    pub fn unique(mut self, unique: impl Into<String>) -> Self {
        self.unique = Some(unique.into());
        self
    }
}
