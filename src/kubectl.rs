//! kubectl invocation
//!
//! Fixture rendering, module deployment and rollout checks shell out to
//! kubectl. Output is captured; a non-zero exit becomes an error carrying
//! stderr.

use std::ffi::OsStr;
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::debug;

use crate::config::RunConfig;

/// Error type for kubectl invocations
#[derive(Debug, thiserror::Error)]
pub enum KubectlError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// A kubectl binary
#[derive(Debug, Clone)]
pub struct Kubectl {
    program: String,
}

impl Kubectl {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The binary named by `config.kubectl`
    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.kubectl.clone())
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run with `args` and return stdout
    pub async fn run<I, S>(&self, args: I) -> Result<String, KubectlError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let command = self.command_line(&args);
        debug!(command = %command, "Running kubectl");

        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| KubectlError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(KubectlError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn command_line<S: AsRef<OsStr>>(&self, args: &[S]) -> String {
        let mut line = self.program.clone();
        for arg in args {
            line.push(' ');
            line.push_str(&arg.as_ref().to_string_lossy());
        }
        line
    }
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new("kubectl")
    }
}
