//! Starting workers
//!
//! [`Launcher`] is the seam between the supervisor and whatever runs the
//! worker: a child process in production, an in-process task in tests.

use std::future::Future;
use std::path::PathBuf;

use imaged_core::config::WorkerConfig;
use imaged_core::{ImagedError, ImagedResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::transport::{BoxedReader, BoxedWriter};

/// A running worker and the two streams that talk to it.
pub struct WorkerLink {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub handle: WorkerHandle,
}

pub enum WorkerHandle {
    Process(Child),
    Task(JoinHandle<()>),
}

impl WorkerHandle {
    /// True once the worker is gone. Never blocks.
    pub fn has_exited(&mut self) -> bool {
        match self {
            WorkerHandle::Process(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::warn!(%status, "worker process exited");
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!("failed to poll worker process: {e}");
                    true
                }
            },
            WorkerHandle::Task(task) => task.is_finished(),
        }
    }

    pub fn id(&self) -> Option<u32> {
        match self {
            WorkerHandle::Process(child) => child.id(),
            WorkerHandle::Task(_) => None,
        }
    }

    /// Stop the worker and reap it.
    pub async fn terminate(&mut self) {
        match self {
            WorkerHandle::Process(child) => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!("worker kill: {e}");
                }
                if let Err(e) = child.wait().await {
                    tracing::debug!("worker wait: {e}");
                }
            }
            WorkerHandle::Task(task) => {
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Child is spawned with kill_on_drop
        if let WorkerHandle::Task(task) = self {
            task.abort();
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHandle::Process(child) => write!(f, "Process({:?})", child.id()),
            WorkerHandle::Task(_) => write!(f, "Task"),
        }
    }
}

pub trait Launcher: Send + Sync {
    fn launch(&self) -> impl Future<Output = ImagedResult<WorkerLink>> + Send;
}

/// Launches the worker executable with piped standard streams.
///
/// The worker's stderr is forwarded into this process's log.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

impl Launcher for ProcessLauncher {
    async fn launch(&self) -> ImagedResult<WorkerLink> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ImagedError::ProcessDied(format!("spawning {}: {e}", self.program.display()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ImagedError::ProcessDied("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ImagedError::ProcessDied("worker stdout unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "imaged_worker", "{line}");
                }
            });
        }

        tracing::info!(
            program = %self.program.display(),
            pid = child.id(),
            "worker process started"
        );

        Ok(WorkerLink {
            reader: Box::new(BufReader::new(stdout)),
            writer: Box::new(stdin),
            handle: WorkerHandle::Process(child),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_process_death() {
        let launcher = ProcessLauncher::new("/nonexistent/imaged-worker", Vec::new());
        let err = launcher.launch().await.err().unwrap();
        assert!(matches!(err, ImagedError::ProcessDied(m) if m.contains("spawning")));
    }

    #[tokio::test]
    async fn test_task_handle_reports_exit() {
        let mut handle = WorkerHandle::Task(tokio::spawn(async {}));
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(handle.has_exited());
        handle.terminate().await;
    }
}
