//! Cross-process cluster lock
//!
//! The lock is a single file whose existence means "held". Acquisition is an
//! atomic create-exclusive; contention (the file already exists) is a normal
//! outcome that is retried at a fixed interval. The lock never expires: a
//! holder that crashes leaves the file behind until someone removes it.
//!
//! The file content (`<sourceFile>:<unique>`) only helps a human see who holds
//! the lock.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::poll::{poll_until, PollError, DEFAULT_INTERVAL};

/// Error type for lock operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("gave up waiting for {path} (held by {holder})")]
    Cancelled { path: PathBuf, holder: String },

    #[error("lock {path} still held by {holder} after {timeout:?}")]
    Timeout {
        path: PathBuf,
        holder: String,
        timeout: Duration,
    },
}

/// File-existence mutex guarding the shared cluster
#[derive(Debug, Clone)]
pub struct ClusterLock {
    path: PathBuf,
    owner: String,
    interval: Duration,
    timeout: Option<Duration>,
}

impl ClusterLock {
    /// Lock at `path`, written with `owner` when acquired
    pub fn new(path: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            owner: owner.into(),
            interval: DEFAULT_INTERVAL,
            timeout: None,
        }
    }

    /// Set the retry interval while contended
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Give up after `timeout` (`None` waits indefinitely)
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Lock file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content written when this lock is acquired
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Single acquisition attempt
    ///
    /// Returns `Ok(false)` when another holder already has the file.
    pub async fn try_acquire(&self) -> Result<bool, LockError> {
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await;

        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(self.io_error(e)),
        };

        let written = async {
            file.write_all(self.owner.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            // Don't leave a half-written lock behind
            let _ = tokio::fs::remove_file(&self.path).await;
            return Err(self.io_error(e));
        }

        Ok(true)
    }

    /// Wait until the lock is acquired
    #[instrument(skip(self, cancel), fields(path = %self.path.display(), owner = %self.owner))]
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        if self.try_acquire().await? {
            info!("Acquired cluster lock");
            return Ok(());
        }

        let holder = self.describe_holder().await;
        info!(
            holder = %holder,
            "Cluster lock held, waiting"
        );

        let result = poll_until(cancel, || self.try_acquire())
            .interval(self.interval)
            .timeout(self.timeout)
            .await_condition()
            .await;

        match result {
            Ok(()) => {
                info!("Acquired cluster lock");
                Ok(())
            }
            Err(PollError::Predicate(e)) => Err(e),
            Err(PollError::Cancelled { .. }) => Err(LockError::Cancelled {
                path: self.path.clone(),
                holder: self.describe_holder().await,
            }),
            Err(PollError::DeadlineExceeded { timeout, .. }) => Err(LockError::Timeout {
                path: self.path.clone(),
                holder: self.describe_holder().await,
                timeout,
            }),
        }
    }

    /// Release the lock by deleting the file
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn release(&self) -> Result<(), LockError> {
        match self.holder().await? {
            None => {
                warn!("Cluster lock already released");
                return Ok(());
            }
            Some(holder) if holder != self.owner => {
                warn!(holder = %holder, owner = %self.owner, "Releasing lock written by another owner");
            }
            Some(_) => {}
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Released cluster lock");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Lock file vanished before release");
                Ok(())
            }
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Current lock content, `None` when the lock is free
    pub async fn holder(&self) -> Result<Option<String>, LockError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn describe_holder(&self) -> String {
        match self.holder().await {
            Ok(Some(holder)) => holder,
            Ok(None) => "nobody".to_string(),
            Err(e) => format!("unknown ({e})"),
        }
    }

    fn io_error(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
