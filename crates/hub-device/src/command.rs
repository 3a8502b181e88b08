//! Platform tool invocation (`xcrun`, `adb`, `open`, ...)
//!
//! Every invocation is logged at debug level with its full argument list.
//! Tool stderr is logged line by line with the tool as a field.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use hub_core::prelude::*;

/// Default upper bound for one tool invocation
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured result of one tool run
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Convert a failed exit status into [`Error::Process`]
    pub fn check(self, tool: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::process(format!(
                "{} exited with code {:?}: {}",
                tool,
                self.code,
                self.stderr.trim()
            )))
        }
    }
}

/// Run `tool args...` to completion with the default timeout
pub async fn run<S: AsRef<OsStr>>(tool: &str, args: &[S]) -> Result<ToolOutput> {
    run_with_timeout(tool, args, TOOL_TIMEOUT).await
}

/// Run `tool args...` and fail unless it exits successfully
pub async fn run_checked<S: AsRef<OsStr>>(tool: &str, args: &[S]) -> Result<ToolOutput> {
    run(tool, args).await?.check(tool)
}

/// Run `tool args...` to completion, killing it after `limit`
pub async fn run_with_timeout<S: AsRef<OsStr>>(
    tool: &str,
    args: &[S],
    limit: Duration,
) -> Result<ToolOutput> {
    debug!("Running: {} {}", tool, display_args(args));

    let child = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = timeout(limit, child)
        .await
        .map_err(|_| Error::process(format!("{tool} timed out after {limit:?}")))?
        .map_err(|e| spawn_error(tool, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
        debug!(tool = %tool, "stderr: {}", line);
    }

    Ok(ToolOutput {
        code: output.status.code(),
        success: output.status.success(),
        stdout,
        stderr,
    })
}

/// Map a spawn failure to `ToolNotFound` or `ProcessSpawn`
pub(crate) fn spawn_error(tool: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::tool_not_found(tool)
    } else {
        Error::ProcessSpawn {
            reason: format!("{tool}: {e}"),
        }
    }
}

pub(crate) fn display_args<S: AsRef<OsStr>>(args: &[S]) -> String {
    args.iter()
        .map(|a| a.as_ref().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_tool_is_tool_not_found() {
        let err = run("hub-tool-that-does-not-exist", &["--version"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_stdout_and_status() {
        let output = run("sh", &["-c", "echo hello; echo oops >&2; exit 3"])
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.code, Some(3));
        assert!(!output.success);

        let err = output.check("sh").unwrap_err();
        assert!(err.to_string().contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_process_error() {
        let err = run_with_timeout("sleep", &["5"], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Process { .. }));
    }

    #[test]
    fn test_display_args() {
        assert_eq!(
            display_args(&["simctl", "list", "devices"]),
            "simctl list devices"
        );
    }
}
