use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::{LaunchError, RunError};

use super::models::{ProcessHandle, RunUpdate};
use super::registry::RunRegistry;

/// Environment variable carrying the run id into the child process.
pub const RUN_ID_ENV: &str = "RESEARCH_RUN_ID";

/// How to launch a research job. The payload is appended as the final
/// argument at submit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn working_dir(&self) -> PathBuf {
        self.cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Launches research jobs as child processes and drives their run records
/// to a terminal state.
#[derive(Debug, Clone)]
pub struct JobSupervisor {
    registry: RunRegistry,
}

impl JobSupervisor {
    pub fn new(registry: RunRegistry) -> Self {
        Self { registry }
    }

    /// Mark the run as running and hand the child off to a supervising task.
    ///
    /// Returns as soon as the bookkeeping is done. The returned handle
    /// resolves once the run has reached a terminal status.
    pub fn submit(
        &self,
        run_id: &str,
        spec: &CommandSpec,
        log_path: impl Into<PathBuf>,
        payload: impl Into<String>,
    ) -> Result<JoinHandle<()>, RunError> {
        self.registry.update(run_id, RunUpdate::started(Utc::now()))?;

        let registry = self.registry.clone();
        let run_id = run_id.to_string();
        let spec = spec.clone();
        let log_path = log_path.into();
        let payload = payload.into();

        Ok(tokio::spawn(async move {
            supervise(registry, run_id, spec, log_path, payload).await;
        }))
    }
}

async fn supervise(
    registry: RunRegistry,
    run_id: String,
    spec: CommandSpec,
    log_path: PathBuf,
    payload: String,
) {
    match run_child(&registry, &run_id, &spec, &log_path, &payload).await {
        Ok(exit_code) => {
            info!(run_id = %run_id, exit_code, "Research job finished");
            if let Err(e) = registry.update(&run_id, RunUpdate::finished(exit_code, Utc::now())) {
                warn!(run_id = %run_id, error = %e, "Failed to record job exit");
            }
        }
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "Research job failed to run");
            append_failure(&log_path, &e).await;
            if let Err(e) = registry.update(&run_id, RunUpdate::aborted(Utc::now())) {
                warn!(run_id = %run_id, error = %e, "Failed to record job failure");
            }
        }
    }
}

async fn run_child(
    registry: &RunRegistry,
    run_id: &str,
    spec: &CommandSpec,
    log_path: &Path,
    payload: &str,
) -> Result<i32, LaunchError> {
    let log_err = |source| LaunchError::LogFile {
        path: log_path.to_path_buf(),
        source,
    };

    if let Some(parent) = log_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(log_err)?;
    }
    tokio::fs::write(log_path, preamble(run_id, spec, payload))
        .await
        .map_err(log_err)?;

    let stdout = tokio::fs::OpenOptions::new()
        .append(true)
        .open(log_path)
        .await
        .map_err(log_err)?
        .into_std()
        .await;
    let stderr = stdout.try_clone().map_err(log_err)?;

    let mut cmd = Command::new(&spec.executable);
    cmd.args(&spec.args)
        .arg(payload)
        .current_dir(spec.working_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .env(RUN_ID_ENV, run_id);

    let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        executable: spec.executable.clone(),
        source,
    })?;
    // The Command holds the parent's copies of the log handles; release them now.
    drop(cmd);

    let (notifier, handle) = ProcessHandle::channel(child.id());
    info!(run_id = %run_id, pid = ?handle.pid(), "Research job started");
    if let Err(e) = registry.update(run_id, RunUpdate::attach(handle)) {
        warn!(run_id = %run_id, error = %e, "Failed to attach process handle");
    }

    let status = child.wait().await.map_err(LaunchError::Wait)?;
    let exit_code = status.code().unwrap_or(-1);
    notifier.notify(exit_code);
    Ok(exit_code)
}

/// Fixed header written to every run log before any child output.
fn preamble(run_id: &str, spec: &CommandSpec, payload: &str) -> String {
    let target = spec
        .args
        .iter()
        .map(String::as_str)
        .chain(std::iter::once("<research content>"))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "Starting research run {} at {}\n\
         Executable: {}\n\
         Target: {}\n\
         Working directory: {}\n\
         Research content length: {}\n\
         {}\n",
        run_id,
        Utc::now().to_rfc3339(),
        spec.executable.display(),
        target,
        spec.working_dir().display(),
        payload.chars().count(),
        "=".repeat(80),
    )
}

async fn append_failure(log_path: &Path, error: &LaunchError) {
    let result = async {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;
        file.write_all(format!("\nResearch job failed to run: {}\n", error).as_bytes())
            .await?;
        file.flush().await
    }
    .await;
    if let Err(e) = result {
        warn!(path = %log_path.display(), error = %e, "Could not write failure to run log");
    }
}
