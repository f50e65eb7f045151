//! Crate-wide error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::process::TaskResult;

/// Lines of stderr shown when a task fails.
pub const STDERR_TAIL_LINES: usize = 20;

/// Failure of a single supervised task.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{title} failed with exit code {code}", code = display_code(.result.exit_code))]
    Failed {
        title: String,
        result: TaskResult,
        log_file: Option<PathBuf>,
    },

    #[error("{title} did not become ready within {}ms", .timeout.as_millis())]
    ReadinessTimeout {
        title: String,
        timeout: Duration,
        log_file: Option<PathBuf>,
    },

    #[error("{title}: {message}")]
    Rejected {
        title: String,
        message: String,
        log_file: Option<PathBuf>,
    },
}

impl TaskError {
    pub fn title(&self) -> &str {
        match self {
            TaskError::Failed { title, .. }
            | TaskError::ReadinessTimeout { title, .. }
            | TaskError::Rejected { title, .. } => title,
        }
    }

    pub fn log_file(&self) -> Option<&PathBuf> {
        match self {
            TaskError::Failed { log_file, .. }
            | TaskError::ReadinessTimeout { log_file, .. }
            | TaskError::Rejected { log_file, .. } => log_file.as_ref(),
        }
    }

    /// Captured stderr tail, if the error carries a result.
    pub fn stderr_tail(&self) -> Option<String> {
        match self {
            TaskError::Failed { result, .. } if !result.stderr.is_empty() => {
                Some(result.stderr_tail(STDERR_TAIL_LINES))
            }
            _ => None,
        }
    }
}

fn display_code(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "<running>".to_string())
}

/// Failure of a preview session.
#[derive(Error, Debug)]
pub enum RackError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("{} task(s) failed: {}", .0.len(), join_titles(.0))]
    Tasks(Vec<TaskError>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RackError {
    /// Every task failure carried by this error, in order.
    pub fn task_errors(&self) -> Vec<&TaskError> {
        match self {
            RackError::Task(err) => vec![err],
            RackError::Tasks(errs) => errs.iter().collect(),
            _ => Vec::new(),
        }
    }
}

fn join_titles(errors: &[TaskError]) -> String {
    errors
        .iter()
        .map(TaskError::title)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, RackError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(title: &str, code: Option<i32>) -> TaskError {
        TaskError::Failed {
            title: title.to_string(),
            result: TaskResult {
                success: false,
                stdout: Vec::new(),
                stderr: vec!["npm ERR! missing script".into()],
                exit_code: code,
            },
            log_file: None,
        }
    }

    #[test]
    fn messages_name_the_task() {
        assert_eq!(
            failed("Frontend Install", Some(1)).to_string(),
            "Frontend Install failed with exit code 1"
        );
        let timeout = TaskError::ReadinessTimeout {
            title: "Bot Start".into(),
            timeout: Duration::from_millis(1500),
            log_file: None,
        };
        assert_eq!(timeout.to_string(), "Bot Start did not become ready within 1500ms");
    }

    #[test]
    fn grouped_errors_list_titles() {
        let err = RackError::Tasks(vec![failed("a", Some(1)), failed("b", Some(2))]);
        assert_eq!(err.to_string(), "2 task(s) failed: a, b");
        assert_eq!(err.task_errors().len(), 2);
        assert_eq!(
            err.task_errors()[0].stderr_tail().as_deref(),
            Some("npm ERR! missing script")
        );
    }
}
