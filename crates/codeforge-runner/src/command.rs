//! Allowlisted subprocess execution for reviewer tooling.
//!
//! The runner never lets model-driven input escape the workspace: only
//! allowlisted executables run, the working directory must resolve inside
//! the workspace root, and every run is bounded by a wall-clock timeout and
//! an output cap.

use async_trait::async_trait;
use chrono::Utc;
use codeforge_core::{CodeforgeError, CodeforgeResult, EventKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Default executables the reviewer may invoke.
pub const DEFAULT_ALLOWED_COMMANDS: [&str; 4] = ["ruff", "pytest", "python", "python3"];

/// Full record of one command run, emitted as the `command_log` artifact
/// and the `command_finished` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Whether the process actually ran to completion.
    pub ran: bool,
    /// The command line, space-joined.
    pub command: String,
    /// Exit code, when the process ran.
    pub exit_code: Option<i32>,
    /// Captured stdout, possibly truncated.
    pub stdout: String,
    /// Captured stderr, possibly truncated.
    pub stderr: String,
    /// Wall-clock duration in seconds.
    pub duration_seconds: f64,
    /// Whether the timeout fired.
    pub timed_out: bool,
    /// Whether the allowlist refused the command before spawn.
    pub blocked: bool,
    /// Failure classification, when any.
    pub error: Option<String>,
    /// Whether stdout was truncated to the cap.
    pub stdout_truncated: bool,
    /// Whether stderr was truncated to the cap.
    pub stderr_truncated: bool,
    /// Unique id for correlating events and review reports.
    pub run_id: String,
    /// Start timestamp, ISO-8601.
    pub started_at: String,
    /// End timestamp, ISO-8601.
    pub finished_at: String,
    /// Caller-supplied purpose tag (`ruff`, `pytest`, ...).
    pub purpose: Option<String>,
}

/// Receiver for command events and artifacts.
#[async_trait]
pub trait RunnerSink: Send + Sync {
    /// Observe a `command_started`/`command_finished` event.
    async fn event(&self, kind: EventKind, payload: Value);

    /// Observe the `command_log` artifact for a finished run.
    async fn artifact(&self, record: &CommandRecord);
}

/// Allowlisted subprocess runner bound to one task workspace.
pub struct CommandRunner {
    workspace_path: PathBuf,
    allowed_commands: HashSet<String>,
    timeout: Duration,
    max_output_bytes: usize,
    sink: Option<Arc<dyn RunnerSink>>,
}

impl CommandRunner {
    /// Build a runner rooted at `workspace_path` with the default limits.
    pub fn new(workspace_path: impl Into<PathBuf>) -> Self {
        Self {
            workspace_path: workspace_path.into(),
            allowed_commands: DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            timeout: Duration::from_secs(60),
            max_output_bytes: 20_000,
            sink: None,
        }
    }

    /// Override the allowlist; empty entries are ignored.
    pub fn with_allowed_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands: HashSet<String> = commands
            .into_iter()
            .map(Into::into)
            .map(|s: String| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !commands.is_empty() {
            self.allowed_commands = commands;
        }
        self
    }

    /// Override the wall-clock timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the per-stream output cap.
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Attach an event/artifact sink.
    pub fn with_sink(mut self, sink: Arc<dyn RunnerSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn is_allowed(&self, command: &[String]) -> bool {
        let Some(executable) = command.first() else {
            return false;
        };
        let basename = Path::new(executable)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        self.allowed_commands.contains(basename)
    }

    fn ensure_workspace(&self, cwd: &Path) -> CodeforgeResult<PathBuf> {
        let workspace = self.workspace_path.canonicalize()?;
        let resolved = cwd.canonicalize()?;
        if resolved != workspace && !resolved.starts_with(&workspace) {
            return Err(CodeforgeError::UnsafePath(format!(
                "command cwd must stay within the workspace: {}",
                cwd.display()
            )));
        }
        Ok(resolved)
    }

    fn truncate_output(&self, data: &[u8]) -> (String, bool) {
        let text = String::from_utf8_lossy(data);
        let bytes = text.as_bytes();
        if bytes.len() <= self.max_output_bytes {
            return (text.into_owned(), false);
        }
        let mut end = self.max_output_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        (text[..end].to_string(), true)
    }

    async fn emit_event(&self, kind: EventKind, payload: Value) {
        if let Some(sink) = &self.sink {
            sink.event(kind, payload).await;
        }
    }

    async fn emit_record(&self, record: &CommandRecord) {
        if let Some(sink) = &self.sink {
            let payload = serde_json::to_value(record).unwrap_or_default();
            sink.event(EventKind::CommandFinished, payload).await;
            sink.artifact(record).await;
        }
    }

    /// Run one command inside the workspace.
    ///
    /// Never returns an error for command failures; every outcome is
    /// captured in the [`CommandRecord`]. Only a cwd outside the workspace
    /// is a hard error. Exit-code-based classification is the caller's job.
    pub async fn run(
        &self,
        command: &[String],
        cwd: Option<&Path>,
        purpose: Option<&str>,
        env: &[(String, String)],
    ) -> CodeforgeResult<CommandRecord> {
        let run_id = Uuid::new_v4().to_string();
        let cwd = self.ensure_workspace(cwd.unwrap_or(&self.workspace_path))?;
        let command_line = command.join(" ");
        let started_at = Utc::now().to_rfc3339();

        self.emit_event(
            EventKind::CommandStarted,
            serde_json::json!({
                "run_id": &run_id,
                "command": &command_line,
                "cwd": cwd.display().to_string(),
                "purpose": purpose,
                "started_at": &started_at,
            }),
        )
        .await;

        if !self.is_allowed(command) {
            warn!(command = %command_line, "command not in allowlist, refusing to spawn");
            let record = CommandRecord {
                ran: false,
                command: command_line,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration_seconds: 0.0,
                timed_out: false,
                blocked: true,
                error: Some("command_not_allowed".to_string()),
                stdout_truncated: false,
                stderr_truncated: false,
                run_id,
                started_at,
                finished_at: Utc::now().to_rfc3339(),
                purpose: purpose.map(str::to_string),
            };
            self.emit_record(&record).await;
            return Ok(record);
        }

        info!(command = %command_line, timeout_s = self.timeout.as_secs(), "running command");
        let start = Instant::now();
        let mut ran = true;
        let mut timed_out = false;
        let mut exit_code = None;
        let mut error = None;
        let mut stdout_raw: Vec<u8> = Vec::new();
        let mut stderr_raw: Vec<u8> = Vec::new();

        let mut process = tokio::process::Command::new(&command[0]);
        process
            .args(&command[1..])
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            process.env(key, value);
        }

        match process.spawn() {
            Ok(child) => {
                match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
                    Ok(Ok(output)) => {
                        exit_code = output.status.code();
                        stdout_raw = output.stdout;
                        stderr_raw = output.stderr;
                    }
                    Ok(Err(err)) => {
                        ran = false;
                        error = Some(err.to_string());
                    }
                    Err(_) => {
                        // kill_on_drop reaps the child when the future is
                        // dropped by the timeout.
                        ran = false;
                        timed_out = true;
                        error = Some("timeout".to_string());
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                ran = false;
                error = Some("command_not_found".to_string());
            }
            Err(err) => {
                ran = false;
                error = Some(err.to_string());
            }
        }

        let (stdout, stdout_truncated) = self.truncate_output(&stdout_raw);
        let (stderr, stderr_truncated) = self.truncate_output(&stderr_raw);
        let record = CommandRecord {
            ran,
            command: command_line,
            exit_code,
            stdout,
            stderr,
            duration_seconds: start.elapsed().as_secs_f64(),
            timed_out,
            blocked: false,
            error,
            stdout_truncated,
            stderr_truncated,
            run_id,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            purpose: purpose.map(str::to_string),
        };
        self.emit_record(&record).await;
        Ok(record)
    }
}

/// Convenience for building a command line from string literals.
pub fn command_line<S: Into<String>>(parts: impl IntoIterator<Item = S>) -> Vec<String> {
    parts.into_iter().map(Into::into).collect()
}
