//! Supervision of long-lived processes started for a device
//! (app launches, screen recordings).

use std::ffi::OsStr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Notify};

use hub_core::prelude::*;

use crate::command::{display_args, spawn_error};

/// A spawned child process owned by a dedicated wait task.
///
/// The `Child` is moved into the wait task, which captures the exit code.
/// `LaunchedProcess` keeps a kill channel, an atomic exit flag for
/// synchronous checks, and a [`Notify`] to await exit without polling.
pub struct LaunchedProcess {
    label: String,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl std::fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl LaunchedProcess {
    /// Spawn `program args...`. Output lines are logged, stdin is closed.
    pub fn spawn<P, S>(program: P, args: &[S], label: impl Into<String>) -> Result<Self>
    where
        P: AsRef<OsStr>,
        S: AsRef<OsStr>,
    {
        let label = label.into();
        let program_name = program.as_ref().to_string_lossy().into_owned();
        info!("Launching [{}]: {} {}", label, program_name, display_args(args));

        let mut child = Command::new(program.as_ref())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&program_name, e))?;

        let pid = child.id();
        debug!("[{}] started with PID {:?}", label, pid);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Self::stdout_reader(stdout, label.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::stderr_reader(stderr, label.clone()));
        }

        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let exit_code = Arc::new(Mutex::new(None));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(Self::wait_task(
            child,
            kill_rx,
            label.clone(),
            Arc::clone(&exited),
            Arc::clone(&exit_notify),
            Arc::clone(&exit_code),
        ));

        Ok(Self {
            label,
            pid,
            kill_tx: Some(kill_tx),
            exited,
            exit_notify,
            exit_code,
        })
    }

    /// Background task: owns `child` until it exits or is killed
    async fn wait_task(
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        label: String,
        exited: Arc<AtomicBool>,
        exit_notify: Arc<Notify>,
        exit_code: Arc<Mutex<Option<i32>>>,
    ) {
        let code = tokio::select! {
            result = child.wait() => match result {
                Ok(status) => {
                    info!("[{}] exited with status: {}", label, status);
                    status.code()
                }
                Err(e) => {
                    error!("[{}] error waiting for process: {}", label, e);
                    None
                }
            },
            _ = kill_rx => {
                warn!("[{}] force-killing process", label);
                if let Err(e) = child.kill().await {
                    error!("[{}] failed to kill process: {}", label, e);
                }
                child.wait().await.ok().and_then(|s| s.code())
            }
        };

        *exit_code.lock().unwrap_or_else(|e| e.into_inner()) = code;
        exited.store(true, Ordering::Release);
        exit_notify.notify_waiters();
    }

    async fn stdout_reader(stdout: tokio::process::ChildStdout, label: String) {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            trace!("[{}] stdout: {}", label, line);
        }
    }

    async fn stderr_reader(stderr: tokio::process::ChildStderr, label: String) {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{}] stderr: {}", label, line);
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code once the process has exited (`None` if killed by a signal)
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask the process to terminate gracefully (SIGINT on unix)
    pub fn interrupt(&mut self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            let Some(pid) = self.pid else {
                return Err(Error::process(format!("[{}] has no PID", self.label)));
            };
            let raw = i32::try_from(pid).map_err(|_| {
                Error::process(format!("[{}] PID {} out of range", self.label, pid))
            })?;
            debug!("[{}] sending SIGINT to {}", self.label, pid);
            match kill(Pid::from_raw(raw), Signal::SIGINT) {
                // Already gone
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(Error::process(format!(
                        "[{}] failed to interrupt PID {}: {}",
                        self.label, pid, e
                    )));
                }
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            self.force_kill();
            Ok(())
        }
    }

    /// Wait up to `limit` for the process to exit
    pub async fn wait_for_exit(&self, limit: Duration) -> Result<()> {
        // Create the notified future before checking the flag so a
        // notification in between cannot be missed
        let notified = self.exit_notify.notified();
        if self.has_exited() {
            return Ok(());
        }

        tokio::time::timeout(limit, notified).await.map_err(|_| {
            Error::process(format!(
                "[{}] did not exit within {:?}",
                self.label, limit
            ))
        })
    }

    /// Tell the wait task to kill the child
    pub fn force_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Interrupt, wait up to `grace`, then force-kill.
    ///
    /// The returned error describes the first step that failed; the process
    /// is killed either way.
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }

        let result = match self.interrupt() {
            Ok(()) => self.wait_for_exit(grace).await,
            Err(e) => Err(e),
        };

        if result.is_err() {
            self.force_kill();
            let _ = self.wait_for_exit(grace).await;
        }
        result
    }
}

impl Drop for LaunchedProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            debug!("[{}] dropped while running, killing", self.label);
            self.force_kill();
        }
    }
}
