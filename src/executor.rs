//! Async process executor underlying the CLI-based Docker gateway.
//!
//! Every Docker interaction in this crate goes through here: a single
//! `docker` binary invocation, executed with `tokio::process`, with
//! optional timeout and streaming support.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::errors::{EngineError, EngineResult};

/// Configuration for one command execution.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Command timeout (`None` for no timeout).
    pub timeout: Option<Duration>,
    /// Environment variables to set.
    pub environment: HashMap<String, String>,
    /// Working directory for the command.
    pub working_dir: Option<std::path::PathBuf>,
    /// Whether to capture stdout.
    pub capture_stdout: bool,
    /// Whether to capture stderr.
    pub capture_stderr: bool,
    /// Input data to send to stdin.
    pub stdin_data: Option<Vec<u8>>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            environment: HashMap::new(),
            working_dir: None,
            capture_stdout: true,
            capture_stderr: true,
            stdin_data: None,
        }
    }
}

/// Result of one command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code of the process.
    pub exit_code: i32,
    /// Captured stdout, if enabled.
    pub stdout: String,
    /// Captured stderr, if enabled.
    pub stderr: String,
    /// Whether the command exited zero.
    pub success: bool,
}

impl CommandOutput {
    /// Construct from raw parts.
    #[must_use]
    pub fn new(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: exit_code == 0,
        }
    }

    /// stdout and stderr concatenated, for diagnostics.
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Streaming handle returned by [`ProcessExecutor::execute_streaming`].
pub struct StreamingOutput {
    /// Receiver yielding stdout lines as they arrive.
    pub stdout: mpsc::Receiver<String>,
    /// Receiver yielding stderr lines as they arrive.
    pub stderr: mpsc::Receiver<String>,
    /// Handle to the child process, for killing or waiting on it.
    pub child: Child,
}

/// Async runner for `docker` subcommands.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    /// Path to the `docker` binary.
    pub docker_path: std::path::PathBuf,
    default_config: ExecutionConfig,
}

impl ProcessExecutor {
    /// Build an executor against the given `docker` binary path.
    #[must_use]
    pub fn new(docker_path: std::path::PathBuf) -> Self {
        Self {
            docker_path,
            default_config: ExecutionConfig::default(),
        }
    }

    /// Override the default per-command timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_config.timeout = Some(timeout);
        self
    }

    /// Run `docker <args>` to completion and collect its output.
    pub async fn execute(
        &self,
        args: &[String],
        config: Option<ExecutionConfig>,
    ) -> EngineResult<CommandOutput> {
        let config = config.unwrap_or_else(|| self.default_config.clone());
        let command_str = format!("docker {}", args.join(" "));

        debug!(command = %command_str, "executing docker command");

        let mut command = Command::new(&self.docker_path);
        command.args(args);
        command.stdin(if config.stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(if config.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stderr(if config.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        for (key, value) in &config.environment {
            command.env(key, value);
        }
        if let Some(working_dir) = &config.working_dir {
            command.current_dir(working_dir);
        }

        let mut child = command.spawn().map_err(|source| EngineError::EngineUnavailable {
            message: format!("failed to spawn `{command_str}`: {source}"),
        })?;

        if let Some(stdin_data) = config.stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(&stdin_data).await {
                        warn!(error = %e, "failed to write to docker stdin");
                    }
                    if let Err(e) = stdin.shutdown().await {
                        warn!(error = %e, "failed to close docker stdin");
                    }
                });
            }
        }

        let output = if let Some(timeout_duration) = config.timeout {
            match timeout(timeout_duration, self.wait_for_output(child)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(EngineError::DeadlineExceeded {
                        elapsed: timeout_duration,
                        message: command_str,
                    });
                }
            }
        } else {
            self.wait_for_output(child).await?
        };

        trace!(exit_code = output.exit_code, "docker command completed");

        if !output.success {
            return Err(EngineError::EngineUnavailable {
                message: format!(
                    "`{command_str}` exited {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }

        Ok(output)
    }

    /// Like [`Self::execute`] but returns only trimmed stdout on success.
    pub async fn execute_stdout(&self, args: &[String]) -> EngineResult<String> {
        Ok(self.execute(args, None).await?.stdout.trim().to_string())
    }

    /// Run `docker <args>` with stdout/stderr streamed line-by-line instead
    /// of collected, used for `docker logs --follow` and long execs.
    pub async fn execute_streaming(
        &self,
        args: &[String],
        config: Option<ExecutionConfig>,
    ) -> EngineResult<StreamingOutput> {
        let config = config.unwrap_or_else(|| self.default_config.clone());
        let command_str = format!("docker {}", args.join(" "));

        debug!(command = %command_str, "executing streaming docker command");

        let mut command = Command::new(&self.docker_path);
        command.args(args);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        for (key, value) in &config.environment {
            command.env(key, value);
        }
        if let Some(working_dir) = &config.working_dir {
            command.current_dir(working_dir);
        }

        let mut child = command.spawn().map_err(|source| EngineError::EngineUnavailable {
            message: format!("failed to spawn `{command_str}`: {source}"),
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let (stdout_tx, stdout_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let stderr = child.stderr.take().expect("piped stderr");
        let (stderr_tx, stderr_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        Ok(StreamingOutput {
            stdout: stdout_rx,
            stderr: stderr_rx,
            child,
        })
    }

    async fn wait_for_output(&self, mut child: Child) -> EngineResult<CommandOutput> {
        let stdout_handle = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut output = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&line);
                }
                output
            })
        });

        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut output = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&line);
                }
                output
            })
        });

        let status = child.wait().await.map_err(|source| EngineError::Io {
            operation: "wait for docker process".to_string(),
            source,
        })?;

        let stdout = match stdout_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(CommandOutput::new(status.code().unwrap_or(-1), stdout, stderr))
    }

    /// `docker --version`, used as the lifecycle's preflight reachability check.
    pub async fn check_docker_available(&self) -> EngineResult<()> {
        let output = self
            .execute(&["--version".to_string()], None)
            .await
            .map_err(|_| EngineError::EngineUnavailable {
                message: format!("{} is not executable", self.docker_path.display()),
            })?;
        debug!(version = %output.stdout.trim(), "docker available");
        Ok(())
    }
}

/// Locate the `docker` binary, preferring common install locations before
/// falling back to a `PATH` search.
pub fn find_docker_binary() -> EngineResult<std::path::PathBuf> {
    let possible_paths = ["docker", "/usr/bin/docker", "/usr/local/bin/docker"];
    for path in possible_paths {
        let path_buf = std::path::PathBuf::from(path);
        if path_buf.exists() {
            return Ok(path_buf);
        }
    }
    which::which("docker").map_err(|_| EngineError::EngineUnavailable {
        message: "docker not found on PATH".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_output_combines_streams() {
        let output = CommandOutput::new(0, "out".to_string(), "err".to_string());
        assert_eq!(output.combined_output(), "out\nerr");
        assert!(output.success);
    }

    #[test]
    fn execution_config_defaults_capture_both_streams() {
        let config = ExecutionConfig::default();
        assert!(config.capture_stdout);
        assert!(config.capture_stderr);
        assert!(config.timeout.is_some());
    }

    #[tokio::test]
    async fn find_docker_binary_does_not_panic() {
        let _ = find_docker_binary();
    }
}
