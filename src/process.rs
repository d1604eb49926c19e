/// One live service process: spawn it, wait for it, kill it.
use crate::service::{ServiceDescriptor, ServiceKind};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::process::{Child, Command};

/// Errors that can occur while running a service process.
#[derive(Debug)]
pub enum ProcessError {
    /// The executable is missing or could not be started.
    Spawn {
        kind: ServiceKind,
        executable: PathBuf,
        source: std::io::Error,
    },
    /// Waiting on the child failed.
    Wait {
        kind: ServiceKind,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn {
                kind,
                executable,
                source,
            } => write!(
                f,
                "failed to start {} service ({}): {}",
                kind,
                executable.display(),
                source
            ),
            ProcessError::Wait { kind, source } => {
                write!(f, "failed to wait on {} service: {}", kind, source)
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn { source, .. } => Some(source),
            ProcessError::Wait { source, .. } => Some(source),
        }
    }
}

/// A started service process. Owned by exactly one watcher.
#[derive(Debug)]
pub struct ProcessHandle {
    descriptor: ServiceDescriptor,
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
    /// Set once `wait` has collected the exit status; the pid may be reused
    /// from then on.
    reaped: bool,
}

impl ProcessHandle {
    /// Spawn the service described by `descriptor` and return without waiting.
    ///
    /// Output is inherited when the descriptor asks for echo and discarded
    /// otherwise. The child gets its own process group so [`terminate`]
    /// reaches anything it forks.
    ///
    /// [`terminate`]: ProcessHandle::terminate
    pub fn start(descriptor: ServiceDescriptor) -> Result<Self, ProcessError> {
        let (stdout, stderr) = if descriptor.echo_output() {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };

        tracing::info!(
            service = %descriptor.kind(),
            command = %descriptor.command_line(),
            "starting service"
        );

        let child = Command::new(descriptor.executable())
            .args(descriptor.args())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                kind: descriptor.kind(),
                executable: descriptor.executable().to_path_buf(),
                source: e,
            })?;

        let pid = child.id();
        tracing::debug!(service = %descriptor.kind(), pid = ?pid, "service process started");

        Ok(Self {
            descriptor,
            child,
            pid,
            started_at: Instant::now(),
            reaped: false,
        })
    }

    pub fn kind(&self) -> ServiceKind {
        self.descriptor.kind()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        let status = self.child.wait().await.map_err(|e| ProcessError::Wait {
            kind: self.descriptor.kind(),
            source: e,
        })?;
        self.reaped = true;
        Ok(status)
    }

    fn group(&self) -> Option<Pid> {
        self.pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw)
    }

    /// Forcefully kill the process and its group. Best-effort: errors (for
    /// example the process already being gone) are ignored. Does nothing once
    /// the process has been reaped.
    pub fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        if let Some(pgid) = self.group() {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
        let _ = self.child.start_kill();
    }

    /// Kill whatever the service left running in its process group after it
    /// exited on its own. Best-effort, errors are ignored.
    ///
    /// Only call this right after `wait` returns: the group id cannot be
    /// reused while any member of the group is still alive.
    pub fn kill_leftovers(&self) {
        if let Some(pgid) = self.group() {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(kind: ServiceKind, script: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(kind, "sh", vec!["-c".to_string(), script.to_string()], false)
    }

    #[tokio::test]
    async fn test_start_and_wait_success() {
        let mut handle = ProcessHandle::start(sh(ServiceKind::Storage, "exit 0")).unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(handle.kind(), ServiceKind::Storage);
        let status = handle.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_wait_reports_nonzero_exit() {
        let mut handle = ProcessHandle::start(sh(ServiceKind::Api, "exit 42")).unwrap();
        let status = handle.wait().await.unwrap();
        assert_eq!(status.code(), Some(42));
    }

    #[tokio::test]
    async fn test_start_missing_executable() {
        let desc = ServiceDescriptor::new(
            ServiceKind::Controller,
            "/nonexistent/devstack-test-binary",
            Vec::new(),
            false,
        );
        let err = ProcessHandle::start(desc).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Spawn {
                kind: ServiceKind::Controller,
                ..
            }
        ));
        assert!(err.to_string().contains("failed to start controller service"));
    }

    #[tokio::test]
    async fn test_terminate_kills_running_process() {
        let mut handle = ProcessHandle::start(sh(ServiceKind::Storage, "sleep 30")).unwrap();
        handle.terminate();
        let status = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("terminated process should exit promptly")
            .unwrap();
        assert!(!status.success());
        assert_eq!(status.code(), None);
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_a_no_op() {
        let mut handle = ProcessHandle::start(sh(ServiceKind::Api, "exit 0")).unwrap();
        assert!(!handle.reaped);
        let status = handle.wait().await.unwrap();
        assert!(status.success());
        assert!(handle.reaped);

        // The pid may belong to someone else now; terminate must not signal it.
        handle.terminate();
        handle.terminate();
        assert!(handle.reaped);
    }

    #[tokio::test]
    async fn test_kill_leftovers_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("leftover-alive");
        let script = format!("(sleep 1; touch {}) & exit 0", marker.display());
        let mut handle = ProcessHandle::start(sh(ServiceKind::Storage, &script)).unwrap();

        let status = handle.wait().await.unwrap();
        assert!(status.success());
        handle.kill_leftovers();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_terminate_reaches_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("grandchild-alive");
        // The grandchild would create the marker after one second if it survived.
        let script = format!("(sleep 1; touch {}) & wait", marker.display());
        let mut handle = ProcessHandle::start(sh(ServiceKind::Storage, &script)).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.terminate();
        handle.wait().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
