//! Progress reporting and the hooks that drive it.
//!
//! `ProgressHooks` is the production `TaskHooks`: it reports `start`, `next`
//! and `end` for each task, records outcome properties in a shared bag, and
//! can run a diagnostic over the result that turns an apparently successful
//! run into a failure.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::errors::TaskError;
use crate::process::{TaskResult, TaskSpec};
use crate::readiness::ReadinessPattern;
use crate::service_log::ServiceLogWriter;
use crate::supervisor::{BoxFuture, TaskHooks};

/// Receives task lifecycle updates for display.
///
/// For every task `start` comes first, any number of `next` follow, and
/// `end` is called exactly once.
pub trait ProgressReporter: Send + Sync {
    fn start(&self, title: &str);
    fn next(&self, title: &str, detail: &str);
    fn end(&self, title: &str, success: bool);
}

/// Prints progress lines to stdout.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleProgress {
    use_symbols: bool,
}

impl ConsoleProgress {
    pub fn new(use_symbols: bool) -> Self {
        Self { use_symbols }
    }

    fn print(&self, title: &str, text: &str) {
        if self.use_symbols {
            println!("◆ {}: {}", title, text);
        } else {
            println!("[{}] {}", title, text);
        }
    }
}

impl ProgressReporter for ConsoleProgress {
    fn start(&self, title: &str) {
        self.print(title, "started");
    }

    fn next(&self, title: &str, detail: &str) {
        self.print(title, detail);
    }

    fn end(&self, title: &str, success: bool) {
        self.print(title, if success { "done" } else { "failed" });
    }
}

/// Shared string properties describing a session, e.g. for a summary.
#[derive(Debug, Clone, Default)]
pub struct Properties(Arc<Mutex<BTreeMap<String, String>>>);

impl Properties {
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut map) = self.0.lock() {
            map.insert(key.into(), value.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.0.lock().ok().and_then(|map| map.get(key).cloned())
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.0.lock().map(|map| map.clone()).unwrap_or_default()
    }
}

/// Inspects a finished run; `Some(message)` marks it failed.
pub type Diagnostic = Box<dyn Fn(&TaskResult) -> Option<String> + Send + Sync>;

/// `TaskHooks` that report progress and record outcome properties.
pub struct ProgressHooks {
    progress: Arc<dyn ProgressReporter>,
    properties: Properties,
    diagnostic: Option<Diagnostic>,
}

impl ProgressHooks {
    pub fn new(progress: Arc<dyn ProgressReporter>, properties: Properties) -> Self {
        Self {
            progress,
            properties,
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: Diagnostic) -> Self {
        self.diagnostic = Some(diagnostic);
        self
    }
}

impl TaskHooks for ProgressHooks {
    fn on_start<'a>(
        &'a self,
        spec: &'a TaskSpec,
        pattern: Option<&'a ReadinessPattern>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let title = spec.title.as_str();
            self.progress.start(title);
            self.progress.next(
                title,
                &format!("running {} in {}", spec.command_line(), spec.cwd.display()),
            );
            match pattern {
                Some(pattern) if pattern.is_on_start() => {
                    self.progress.next(title, "ready once the process starts")
                }
                Some(pattern) => self.progress.next(
                    title,
                    &format!("waiting for output matching {}", pattern.describe()),
                ),
                None => {}
            }
        })
    }

    fn on_stop<'a>(
        &'a self,
        title: &'a str,
        background: bool,
        result: &'a TaskResult,
        logs: Option<&'a ServiceLogWriter>,
    ) -> BoxFuture<'a, Result<(), TaskError>> {
        Box::pin(async move {
            let log_file = logs.and_then(|logs| logs.log_file(title));
            let rejection = if result.success {
                self.diagnostic
                    .as_ref()
                    .and_then(|diagnostic| diagnostic(result))
            } else {
                None
            };
            let success = result.success && rejection.is_none();

            self.properties.set(format!("{title}.background"), background.to_string());
            self.properties.set(format!("{title}.success"), success.to_string());
            if let Some(code) = result.exit_code {
                self.properties.set(format!("{title}.exit-code"), code.to_string());
            }

            if !success {
                if let Some(path) = &log_file {
                    self.progress
                        .next(title, &format!("see log at {}", path.display()));
                }
            }
            self.progress.end(title, success);

            match rejection {
                Some(message) => Err(TaskError::Rejected {
                    title: title.to_string(),
                    message,
                    log_file,
                }),
                None => Ok(()),
            }
        })
    }
}

/// Flags a service whose stderr shows its port was already taken, which
/// dev servers often report while still printing their ready banner.
pub fn address_in_use(result: &TaskResult) -> Option<String> {
    let hit = result.stderr.iter().any(|line| {
        let line = line.to_ascii_lowercase();
        line.contains("eaddrinuse") || line.contains("address already in use")
    });
    hit.then(|| "port is already in use by another process".to_string())
}
