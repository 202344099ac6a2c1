use playlab_core::PlayError;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// How long `stop` waits after the graceful signal before force-killing.
const GRACEFUL_EXIT_WAIT: Duration = Duration::from_secs(10);

/// Owns the lifecycle of one external child process: start, merged log
/// capture, liveness polling, idempotent stop.
pub struct ProcessSupervisor {
    name: String,
    log_path: PathBuf,
    child: Option<Child>,
    exit_status: Option<ExitStatus>,
}

impl ProcessSupervisor {
    pub fn new(name: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        ProcessSupervisor {
            name: name.into(),
            log_path: log_path.into(),
            child: None,
            exit_status: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Spawns the child with stdout and stderr appended to the service log.
    /// A single merged stream keeps later log-scanning simple. The child is
    /// spawned with `kill_on_drop`, so even an unexpected unwind of the
    /// orchestrating process reaps it.
    ///
    /// Starting an already started supervisor is a no-op.
    pub async fn start(
        &mut self,
        command: &Path,
        args: &[String],
        workdir: &Path,
    ) -> Result<(), PlayError> {
        if self.child.is_some() {
            return Ok(());
        }

        if let Some(dir) = self.log_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| PlayError::ProcessStart {
            service: self.name.clone(),
            reason: format!("{}: {e}", command.display()),
        })?;

        match child.id() {
            Some(pid) => info!(service = %self.name, pid, command = %command.display(), "started process"),
            None => warn!(service = %self.name, "process exited before a PID could be read"),
        }

        self.exit_status = None;
        self.child = Some(child);
        Ok(())
    }

    /// Non-blocking liveness poll. Records the exit status once the child is
    /// gone so crash diagnostics can report it.
    pub fn is_alive(&mut self) -> Result<bool, PlayError> {
        match self.child.as_mut() {
            Some(child) => match child.try_wait()? {
                None => Ok(true),
                Some(status) => {
                    self.exit_status = Some(status);
                    Ok(false)
                }
            },
            None => Ok(false),
        }
    }

    /// Exit status observed by `is_alive` or `stop`, if the child has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Sends a graceful termination signal and waits for the child to exit,
    /// escalating to a hard kill if it lingers.
    ///
    /// Idempotent: calling `stop` when already stopped, or never started, is
    /// a safe no-op. Shutdown can reach here from the normal exit path, an
    /// interrupt, and an error unwind, in any combination.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => info!(service = %self.name, pid, "sent SIGTERM"),
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(service = %self.name, pid, "SIGTERM failed: {e}"),
            }
        }
        #[cfg(not(unix))]
        if let Err(e) = child.start_kill() {
            warn!(service = %self.name, "kill failed: {e}");
        }

        match tokio::time::timeout(GRACEFUL_EXIT_WAIT, child.wait()).await {
            Ok(Ok(status)) => {
                info!(service = %self.name, %status, "process stopped");
                self.exit_status = Some(status);
            }
            Ok(Err(e)) => warn!(service = %self.name, "error waiting for exit: {e}"),
            Err(_) => {
                warn!(service = %self.name, "did not exit in time, killing");
                if let Err(e) = child.kill().await {
                    warn!(service = %self.name, "kill failed: {e}");
                }
            }
        }
    }

    /// Last `lines` lines of the service log, for failure diagnostics.
    /// Returns an empty string when the log does not exist yet. Child output
    /// is arbitrary bytes, so invalid UTF-8 is replaced rather than dropped.
    pub fn log_tail(&self, lines: usize) -> String {
        let Ok(bytes) = std::fs::read(&self.log_path) else {
            return String::new();
        };
        let content = String::from_utf8_lossy(&bytes);
        let all: Vec<&str> = content.lines().collect();
        let skip = all.len().saturating_sub(lines);
        all[skip..].join("\n")
    }
}
