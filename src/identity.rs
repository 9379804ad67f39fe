//! Run identity derivation
//!
//! A [`RunIdentity`] is derived from the location of a test file and names
//! everything one test run owns: its namespace, its ownership label, the lock
//! file it contends for and the fixture manifests it will synthesize.
//!
//! Derivation is local path arithmetic plus filesystem existence checks. No
//! cluster access happens here.
//!
//! # Example
//!
//! ```ignore
//! use kube_testrun::{RunConfig, RunIdentity};
//!
//! let identity = RunIdentity::new("/repo/capabilities/widget/widget_test.rs", &RunConfig::new())?;
//!
//! // "widget-widget-1700000000000"
//! println!("{}", identity.namespace());
//! // "widget/test-transient"
//! println!("{}", identity.label_key());
//! ```

use regex::Regex;
use std::cmp::Ordering;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::RunConfig;

/// Suffix appended to a label key's capability prefix
pub const LABEL_KEY_SUFFIX: &str = "test-transient";

/// Longest namespace name the API server accepts
pub const MAX_NAMESPACE_LEN: usize = 63;

/// Longest label key prefix the API server accepts
pub const MAX_LABEL_PREFIX_LEN: usize = 253;

const DNS_LABEL: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";
const DNS_SUBDOMAIN: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";

/// Error type for identity derivation
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("{path} does not end in a recognized test suffix ({suffixes})")]
    UnrecognizedSuffix { path: PathBuf, suffixes: String },

    #[error("{0} has no containing directory")]
    NoParent(PathBuf),

    #[error("no ancestor of {start} contains {marker}")]
    MarkerNotFound { marker: String, start: PathBuf },

    #[error("{what} '{name}' is not a valid Kubernetes name: {reason}")]
    InvalidName {
        what: &'static str,
        name: String,
        reason: &'static str,
    },

    #[error("invalid fixture pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Numeric index of a fixture file
///
/// Stored as a normalized digit string so indices of any size compare as
/// integers: `09 == 9`, `8 < 09 < 1009`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FixtureIndex(String);

impl FixtureIndex {
    /// Parse a string of ASCII digits
    #[must_use]
    pub fn parse(digits: &str) -> Option<Self> {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let trimmed = digits.trim_start_matches('0');
        Some(Self(if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        }))
    }

    /// The index as a `u64`, if it fits
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl From<u64> for FixtureIndex {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl Ord for FixtureIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for FixtureIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FixtureIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One indexed fixture file and where its synthesized form is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Index parsed from the file name
    pub index: FixtureIndex,
    /// Fixture YAML as authored (never modified)
    pub source: PathBuf,
    /// Synthesized JSON, `<source>.json`
    pub rendered: PathBuf,
}

/// Immutable identity of one test run
#[derive(Debug, Clone)]
pub struct RunIdentity {
    source_file: PathBuf,
    capability: String,
    work_dir: PathBuf,
    project_root: PathBuf,
    unique: String,
    namespace: String,
    label_key: String,
    lock_path: PathBuf,
    manifests: Vec<ManifestEntry>,
}

impl RunIdentity {
    /// Derive an identity for the test file at `source_file`
    ///
    /// The unique token comes from `config.unique`, or the current time in
    /// milliseconds when unset.
    pub fn new(source_file: impl AsRef<Path>, config: &RunConfig) -> Result<Self, IdentityError> {
        let unique = config
            .unique
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis().to_string());
        Self::with_unique(source_file, unique, config)
    }

    /// Derive an identity with an explicit unique token
    pub fn with_unique(
        source_file: impl AsRef<Path>,
        unique: impl Into<String>,
        config: &RunConfig,
    ) -> Result<Self, IdentityError> {
        let source_file = absolute(source_file.as_ref())?;
        let unique = unique.into();

        let capability = capability_name(&source_file, &config.test_suffixes)?;
        let work_dir = source_file
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| IdentityError::NoParent(source_file.clone()))?;
        let dir_name = work_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| IdentityError::NoParent(work_dir.clone()))?;

        let marker = nearest_ancestor(&config.marker_file, &work_dir)?;
        let project_root = marker
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| IdentityError::NoParent(marker.clone()))?;

        let manifests = discover_fixtures(&work_dir, &capability)?;

        let prefix = kube_name(&capability);
        let namespace = format!("{}-{prefix}-{unique}", kube_name(&dir_name));
        validate_name("namespace", &namespace, DNS_LABEL, MAX_NAMESPACE_LEN)?;
        validate_name("label key prefix", &prefix, DNS_SUBDOMAIN, MAX_LABEL_PREFIX_LEN)?;

        Ok(Self {
            label_key: format!("{prefix}/{LABEL_KEY_SUFFIX}"),
            namespace,
            lock_path: project_root.join(&config.lock_file_name),
            source_file,
            capability,
            work_dir,
            project_root,
            unique,
            manifests,
        })
    }

    /// Absolute path of the test file
    #[must_use]
    pub fn source_file(&self) -> &Path {
        &self.source_file
    }

    /// Capability name, the test file name without its suffix
    #[must_use]
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Directory containing the test file
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Nearest ancestor directory holding the project marker
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Unique token of this run
    #[must_use]
    pub fn unique(&self) -> &str {
        &self.unique
    }

    /// Private namespace: `<workDir basename>-<capability>-<unique>`
    ///
    /// Both names pass through [`kube_name`].
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Ownership label key: `<kube_name(capability)>/test-transient`
    #[must_use]
    pub fn label_key(&self) -> &str {
        &self.label_key
    }

    /// Part of the ownership label key before `/`
    #[must_use]
    pub fn label_prefix(&self) -> &str {
        label_prefix(&self.label_key)
    }

    /// Path of the cross-process lock file
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Advisory lock content, `<sourceFile>:<unique>`
    #[must_use]
    pub fn lock_owner(&self) -> String {
        format!("{}:{}", self.source_file.display(), self.unique)
    }

    /// Discovered fixtures in ascending index order
    #[must_use]
    pub fn manifests(&self) -> &[ManifestEntry] {
        &self.manifests
    }

    /// Rendered path of the fixture with index `index`
    ///
    /// Only meaningful for indices that were discovered.
    #[must_use]
    pub fn manifest(&self, index: impl Into<FixtureIndex>) -> Option<&Path> {
        let index = index.into();
        self.manifests
            .iter()
            .find(|m| m.index == index)
            .map(|m| m.rendered.as_path())
    }
}

/// Map a file or directory name onto Kubernetes naming: lowercase, `_` as `-`
///
/// Fixture discovery keeps using the unmapped capability name.
#[must_use]
pub fn kube_name(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '_' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

fn validate_name(
    what: &'static str,
    name: &str,
    pattern: &str,
    max_len: usize,
) -> Result<(), IdentityError> {
    let invalid = |reason| IdentityError::InvalidName {
        what,
        name: name.to_string(),
        reason,
    };
    if name.len() > max_len {
        return Err(invalid("too long"));
    }
    if !Regex::new(pattern)?.is_match(name) {
        return Err(invalid("must be lowercase alphanumerics and '-', starting and ending alphanumeric"));
    }
    Ok(())
}

/// Part of a label key before `/`, or the whole key if it has none
#[must_use]
pub fn label_prefix(key: &str) -> &str {
    key.split_once('/').map_or(key, |(prefix, _)| prefix)
}

/// Walk upward from `start` (inclusive) looking for `marker`
///
/// Returns the full path of the marker file.
pub fn nearest_ancestor(marker: &str, start: &Path) -> Result<PathBuf, IdentityError> {
    start
        .ancestors()
        .map(|dir| dir.join(marker))
        .find(|candidate| candidate.exists())
        .ok_or_else(|| IdentityError::MarkerNotFound {
            marker: marker.to_string(),
            start: start.to_path_buf(),
        })
}

/// Resolve a `file!()` path against a crate's manifest directory
///
/// Workspace members see `file!()` relative to the workspace root, so the
/// manifest directory and each of its ancestors are tried in turn.
#[must_use]
pub fn locate_source(manifest_dir: impl AsRef<Path>, file: impl AsRef<Path>) -> Option<PathBuf> {
    let file = file.as_ref();
    if file.is_absolute() {
        return file.is_file().then(|| file.to_path_buf());
    }
    manifest_dir
        .as_ref()
        .ancestors()
        .map(|dir| dir.join(file))
        .find(|candidate| candidate.is_file())
}

/// List `<capability>.*test.<n>.yaml` fixtures in `dir`, ordered by index
pub fn discover_fixtures(dir: &Path, capability: &str) -> Result<Vec<ManifestEntry>, IdentityError> {
    let pattern = fixture_pattern(capability)?;
    let io_err = |source| IdentityError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let name = entry.map_err(io_err)?.file_name();
        let name = name.to_string_lossy();

        let Some(index) = pattern
            .captures(&name)
            .and_then(|c| c.get(1))
            .and_then(|m| FixtureIndex::parse(m.as_str()))
        else {
            continue;
        };

        let source = dir.join(name.as_ref());
        entries.push(ManifestEntry {
            index,
            rendered: with_json_suffix(&source),
            source,
        });
    }

    entries.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.source.cmp(&b.source)));
    Ok(entries)
}

fn fixture_pattern(capability: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"^{}\.(?:.*\.)?test\.(\d+)\.yaml$",
        regex::escape(capability)
    ))
}

fn with_json_suffix(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(".json");
    PathBuf::from(os)
}

fn capability_name(source: &Path, suffixes: &[String]) -> Result<String, IdentityError> {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    suffixes
        .iter()
        .filter_map(|suffix| file_name.strip_suffix(suffix.as_str()))
        .find(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| IdentityError::UnrecognizedSuffix {
            path: source.to_path_buf(),
            suffixes: suffixes.join(", "),
        })
}

fn absolute(path: &Path) -> Result<PathBuf, IdentityError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        })
}
