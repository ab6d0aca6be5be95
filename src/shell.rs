//! Shell execution boundary
//!
//! Runs a raw command string in the user's shell with the session working
//! directory, returning stdout/stderr/exit code. The core routes to this
//! boundary, it does not implement a shell. Directory changes are detected
//! here but applied by the orchestrator: `cd` reports the resolved target in
//! `new_cwd` and session state is only mutated on success.

use crate::error::Result;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Exit code reported when a command exceeds its timeout (shell convention)
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Result of one shell invocation
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,

    /// Resolved target of a successful `cd`; the orchestrator applies it
    pub new_cwd: Option<PathBuf>,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: 1,
            new_cwd: None,
        }
    }
}

/// Executor for the shell boundary with a per-command timeout
pub struct ShellExecutor {
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Execute one command with `cwd` as working directory
    pub async fn execute(&self, command: &str, cwd: &Path) -> Result<ShellOutput> {
        // cd and pwd need session-state awareness a child process cannot give
        if let Some(output) = self.run_builtin(command, cwd) {
            return Ok(output);
        }

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        debug!("Executing via {}: {}", shell, command);

        let mut child = Command::new(&shell)
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let result = tokio::time::timeout(self.timeout, async {
            let output = child.wait_with_output().await?;
            Ok::<_, std::io::Error>(output)
        })
        .await;

        match result {
            Ok(output) => {
                let output = output?;
                Ok(ShellOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code().unwrap_or(-1),
                    new_cwd: None,
                })
            }
            Err(_) => Ok(ShellOutput {
                stdout: String::new(),
                stderr: format!(
                    "command timed out after {} seconds",
                    self.timeout.as_secs()
                ),
                exit_code: TIMEOUT_EXIT_CODE,
                new_cwd: None,
            }),
        }
    }

    /// Handle builtins whose effect lives in session state
    fn run_builtin(&self, command: &str, cwd: &Path) -> Option<ShellOutput> {
        let tokens = shell_words::split(command).ok()?;
        match tokens.first().map(String::as_str) {
            Some("cd") => Some(self.change_directory(tokens.get(1).map(String::as_str), cwd)),
            Some("pwd") if tokens.len() == 1 => Some(ShellOutput {
                stdout: format!("{}\n", cwd.display()),
                stderr: String::new(),
                exit_code: 0,
                new_cwd: None,
            }),
            _ => None,
        }
    }

    fn change_directory(&self, target: Option<&str>, cwd: &Path) -> ShellOutput {
        let target = match target {
            Some(t) => {
                let path = Path::new(t);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    cwd.join(path)
                }
            }
            None => match dirs::home_dir() {
                Some(home) => home,
                None => return ShellOutput::failure("cd: cannot determine home directory"),
            },
        };

        match target.canonicalize() {
            Ok(resolved) if resolved.is_dir() => ShellOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                new_cwd: Some(resolved),
            },
            _ => ShellOutput::failure(format!("cd: no such directory: {}", target.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor() -> ShellExecutor {
        ShellExecutor::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let output = executor().execute("echo hello", dir.path()).await.unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.exit_code, 0);
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let dir = TempDir::new().unwrap();
        let output = executor().execute("false", dir.path()).await.unwrap();
        assert_ne!(output.exit_code, 0);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_runs_in_given_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let output = executor().execute("ls", dir.path()).await.unwrap();
        assert!(output.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_cd_reports_new_cwd_on_success() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let output = executor().execute("cd sub", dir.path()).await.unwrap();
        assert!(output.success());
        assert_eq!(output.new_cwd, Some(sub.canonicalize().unwrap()));
    }

    #[tokio::test]
    async fn test_cd_missing_directory_fails_without_cwd_change() {
        let dir = TempDir::new().unwrap();
        let output = executor()
            .execute("cd does-not-exist", dir.path())
            .await
            .unwrap();
        assert!(!output.success());
        assert!(output.new_cwd.is_none());
        assert!(output.stderr.contains("no such directory"));
    }

    #[tokio::test]
    async fn test_pwd_reports_session_directory() {
        let dir = TempDir::new().unwrap();
        let output = executor().execute("pwd", dir.path()).await.unwrap();
        assert_eq!(
            output.stdout.trim(),
            dir.path().to_string_lossy().as_ref()
        );
    }

    #[tokio::test]
    async fn test_timeout_yields_conventional_exit_code() {
        let dir = TempDir::new().unwrap();
        let executor = ShellExecutor::new(Duration::from_millis(200));
        let output = executor.execute("sleep 5", dir.path()).await.unwrap();
        assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
        assert!(output.stderr.contains("timed out"));
    }
}
