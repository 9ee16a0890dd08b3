//! Evaluation engine backed by an external executable.
//!
//! Each evaluation spawns the evaluator once, writes a single JSON payload
//! `{"policy", "resource", "params"}` to its stdin and reads the verdict from
//! stdout. A non-zero exit status is an evaluation error carrying stderr.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{EngineError, EvaluationEngine};

/// Default time an evaluation may take.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct Payload<'a> {
    policy: &'a str,
    resource: &'a str,
    params: &'a str,
}

/// Runs an evaluator executable per evaluation.
#[derive(Debug)]
pub struct ProcessEngine {
    command: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    resolved: OnceLock<PathBuf>,
}

impl ProcessEngine {
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
            resolved: OnceLock::new(),
        }
    }

    /// Locate the executable: as given when it contains a path separator,
    /// otherwise the first match on `PATH`.
    fn locate(&self) -> Result<PathBuf, EngineError> {
        if self.command.components().count() > 1 {
            return if is_executable(&self.command) {
                Ok(self.command.clone())
            } else {
                Err(EngineError::Load(format!(
                    "{} is not an executable file",
                    self.command.display()
                )))
            };
        }

        let path = std::env::var_os("PATH").unwrap_or_default();
        std::env::split_paths(&path)
            .map(|dir| dir.join(&self.command))
            .find(|candidate| is_executable(candidate))
            .ok_or_else(|| {
                EngineError::Load(format!("{} not found on PATH", self.command.display()))
            })
    }

    #[instrument(skip(self), fields(command = %self.command.display()))]
    async fn load_inner(&self) -> Result<(), EngineError> {
        let path = self.locate()?;
        debug!(path = %path.display(), "Resolved evaluator executable");
        let _ = self.resolved.set(path);
        Ok(())
    }

    #[instrument(skip_all)]
    async fn run(&self, policy: &str, resource: &str, params: &str) -> Result<String, EngineError> {
        let program = self
            .resolved
            .get()
            .ok_or_else(|| EngineError::Load("engine has not been loaded".to_string()))?;

        let payload = serde_json::to_vec(&Payload {
            policy,
            resource,
            params,
        })
        .map_err(|e| EngineError::Io(e.to_string()))?;

        let mut child = Command::new(program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Io(format!("failed to spawn evaluator: {e}")))?;

        // Feed stdin while stdout is drained so neither pipe can fill up
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let exchange = async move { tokio::join!(feed, child.wait_with_output()) };
        let (fed, output) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?;
        let output = output.map_err(|e| EngineError::Io(e.to_string()))?;
        // The evaluator may exit without consuming all of its input
        if let Err(e) = fed
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(EngineError::Io(format!("failed to write to evaluator: {e}")));
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(status = %output.status, "Evaluator exited with failure");
            return Err(EngineError::Evaluation(if stderr.is_empty() {
                format!("evaluator exited with {}", output.status)
            } else {
                stderr
            }));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl EvaluationEngine for ProcessEngine {
    fn load(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        self.load_inner().boxed()
    }

    fn evaluate<'a>(
        &'a self,
        policy: &'a str,
        resource: &'a str,
        params: &'a str,
    ) -> BoxFuture<'a, Result<String, EngineError>> {
        self.run(policy, resource, params).boxed()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
