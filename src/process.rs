//! Data structures describing supervised tasks.
//!
//! This module defines what to run (`TaskSpec`), where a supervisor is in its
//! lifecycle (`TaskState`), and what a finished supervision produced
//! (`TaskResult`).

use std::collections::HashMap;
use std::path::PathBuf;

/// Specification for a task to be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Friendly name, also used for the service log file.
    pub title: String,
    /// Command line handed to the platform shell.
    pub command: String,
    /// Extra arguments, shell-quoted and appended to `command`.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Environment overlay merged onto the inherited environment.
    pub env: HashMap<String, String>,
    /// Whether the task is a server expected to keep running.
    pub background: bool,
}

impl TaskSpec {
    /// Creates a foreground task with no arguments and no environment overlay.
    pub fn new(title: impl Into<String>, command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
            background: false,
        }
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The full command line passed to the shell.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            return self.command.clone();
        }
        format!("{} {}", self.command, shell_words::join(&self.args))
    }
}

/// The lifecycle state of a supervisor.
///
/// Transitions are `Created → Running → {Ready, Exited}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Supervisor exists but nothing has been spawned.
    Created,
    /// Process spawned, no verdict yet.
    Running,
    /// Readiness pattern matched before the process exited.
    Ready,
    /// Process exited before becoming ready (or was never asked to).
    Exited,
}

/// Outcome of one supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub success: bool,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// `None` when the process was still running at resolution.
    pub exit_code: Option<i32>,
}

impl TaskResult {
    /// The last `lines` lines of stderr, joined for display.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let start = self.stderr.len().saturating_sub(lines);
        self.stderr[start..].join("\n")
    }
}
