//! Supervised execution of one task.
//!
//! A `TaskSupervisor` ties together a `ProcessHandle`, a `ReadinessMatcher`
//! and the `ServiceLogWriter`. `wait_for` resolves on whichever comes first:
//! the readiness pattern matching the cumulative stdout, or the process
//! exiting. The start/stop hooks bracket every run, and the stop hook gets
//! the final say on whether the run counts as a failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::TaskError;
use crate::events::ProcessEvent;
use crate::handle::{ProcessControl, ProcessHandle, ShutdownConfig, SPAWN_FAILURE_CODE};
use crate::output::{OutputCapture, StreamKind};
use crate::process::{TaskResult, TaskSpec, TaskState};
use crate::readiness::{ReadinessMatcher, ReadinessPattern};
use crate::service_log::ServiceLogWriter;

/// Lines of each stream kept in a `TaskResult`.
pub const DEFAULT_MAX_LINES: usize = 1000;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Extension points invoked around every supervised run.
pub trait TaskHooks: Send + Sync {
    /// Called before the process is spawned. `pattern` is `None` when the
    /// run waits for exit.
    fn on_start<'a>(
        &'a self,
        spec: &'a TaskSpec,
        pattern: Option<&'a ReadinessPattern>,
    ) -> BoxFuture<'a, ()>;

    /// Called once the run resolved. An error replaces the run's own verdict.
    fn on_stop<'a>(
        &'a self,
        title: &'a str,
        background: bool,
        result: &'a TaskResult,
        logs: Option<&'a ServiceLogWriter>,
    ) -> BoxFuture<'a, Result<(), TaskError>>;
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl TaskHooks for NoopHooks {
    fn on_start<'a>(
        &'a self,
        _spec: &'a TaskSpec,
        _pattern: Option<&'a ReadinessPattern>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn on_stop<'a>(
        &'a self,
        _title: &'a str,
        _background: bool,
        _result: &'a TaskResult,
        _logs: Option<&'a ServiceLogWriter>,
    ) -> BoxFuture<'a, Result<(), TaskError>> {
        Box::pin(async { Ok(()) })
    }
}

enum Outcome {
    Ready,
    Exited(i32),
    TimedOut(Duration),
}

/// The unit of supervised execution.
#[derive(Debug)]
pub struct TaskSupervisor {
    spec: TaskSpec,
    shutdown: ShutdownConfig,
    ready_timeout: Option<Duration>,
    max_lines: usize,
    state: Mutex<TaskState>,
    control: Mutex<Option<ProcessControl>>,
    terminate_requested: AtomicBool,
}

impl TaskSupervisor {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            shutdown: ShutdownConfig::default(),
            ready_timeout: None,
            max_lines: DEFAULT_MAX_LINES,
            state: Mutex::new(TaskState::Created),
            control: Mutex::new(None),
            terminate_requested: AtomicBool::new(false),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownConfig) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Bounds how long `wait_for` waits for the pattern. Unbounded by default.
    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn title(&self) -> &str {
        &self.spec.title
    }

    pub fn state(&self) -> TaskState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(TaskState::Exited)
    }

    pub fn pid(&self) -> Option<u32> {
        self.current_control().and_then(|control| control.pid())
    }

    /// Runs the task until `pattern` matches its stdout or it exits.
    ///
    /// There is no deadline unless one was set with `with_ready_timeout`.
    pub async fn wait_for(
        &self,
        pattern: &ReadinessPattern,
        hooks: &dyn TaskHooks,
        logs: Option<Arc<ServiceLogWriter>>,
    ) -> Result<TaskResult, TaskError> {
        self.supervise(Some(pattern), hooks, logs).await
    }

    /// Runs the task until it exits.
    pub async fn wait(
        &self,
        hooks: &dyn TaskHooks,
        logs: Option<Arc<ServiceLogWriter>>,
    ) -> Result<TaskResult, TaskError> {
        self.supervise(None, hooks, logs).await
    }

    /// Terminates the process tree, if one is running.
    ///
    /// Safe to call any number of times from any task. Calling it before the
    /// run started makes the run stop as soon as it spawns. Returns whether
    /// this call issued the kill.
    pub async fn terminate(&self) -> bool {
        self.terminate_requested.store(true, Ordering::SeqCst);
        match self.current_control() {
            Some(control) => control.terminate().await,
            None => false,
        }
    }

    async fn supervise(
        &self,
        pattern: Option<&ReadinessPattern>,
        hooks: &dyn TaskHooks,
        logs: Option<Arc<ServiceLogWriter>>,
    ) -> Result<TaskResult, TaskError> {
        let title = self.spec.title.as_str();
        let background = self.spec.background;
        hooks.on_start(&self.spec, pattern).await;

        let mut handle = ProcessHandle::spawn(&self.spec, self.shutdown);
        let control = handle.control();
        if let Ok(mut slot) = self.control.lock() {
            *slot = Some(control.clone());
        }
        self.set_state(TaskState::Running);
        if self.terminate_requested.load(Ordering::SeqCst) {
            control.terminate().await;
        }

        let mut capture = OutputCapture::new(self.max_lines);
        let observe = self.observe(&mut handle, pattern, &mut capture, logs.as_deref());
        let outcome = match self.ready_timeout.filter(|_| pattern.is_some()) {
            Some(timeout) => tokio::time::timeout(timeout, observe)
                .await
                .unwrap_or(Outcome::TimedOut(timeout)),
            None => observe.await,
        };

        let (stdout, stderr) = capture.finish();
        let mut timed_out = None;
        let (state, success, exit_code) = match outcome {
            Outcome::Ready => (TaskState::Ready, true, None),
            Outcome::Exited(code) => (TaskState::Exited, code == 0, Some(code)),
            Outcome::TimedOut(timeout) => {
                info!(task = %title, timeout_ms = timeout.as_millis() as u64, "task not ready in time");
                timed_out = Some(timeout);
                control.terminate().await;
                (TaskState::Exited, false, control.exit_code())
            }
        };
        self.set_state(state);
        if state == TaskState::Ready {
            tokio::spawn(drain_to_log(
                self.spec.title.clone(),
                handle.into_events(),
                logs.clone(),
            ));
        }

        let result = TaskResult {
            success,
            stdout,
            stderr,
            exit_code,
        };
        info!(
            task = %title,
            success = result.success,
            exit_code = ?result.exit_code,
            "task resolved"
        );

        hooks.on_stop(title, background, &result, logs.as_deref()).await?;

        let log_file = logs.as_ref().and_then(|logs| logs.log_file(title));
        if let Some(timeout) = timed_out {
            return Err(TaskError::ReadinessTimeout {
                title: title.to_string(),
                timeout,
                log_file,
            });
        }
        if !result.success {
            return Err(TaskError::Failed {
                title: title.to_string(),
                result,
                log_file,
            });
        }
        Ok(result)
    }

    async fn observe(
        &self,
        handle: &mut ProcessHandle,
        pattern: Option<&ReadinessPattern>,
        capture: &mut OutputCapture,
        logs: Option<&ServiceLogWriter>,
    ) -> Outcome {
        if pattern.is_some_and(ReadinessPattern::is_on_start) && !handle.spawn_failed() {
            return Outcome::Ready;
        }
        let mut matcher = pattern.cloned().map(ReadinessMatcher::new);
        while let Some(event) = handle.next_event().await {
            match event {
                ProcessEvent::Output { stream, data } => {
                    if let Some(logs) = logs {
                        logs.write(&self.spec.title, &data).await;
                    }
                    capture.push(stream, &data);
                    let ready = stream == StreamKind::Stdout
                        && matcher.as_mut().is_some_and(|m| m.feed(&data));
                    if ready {
                        debug!(task = %self.spec.title, "readiness pattern matched");
                        return Outcome::Ready;
                    }
                }
                ProcessEvent::Exited { code } => return Outcome::Exited(code),
            }
        }
        Outcome::Exited(handle.control().exit_code().unwrap_or(SPAWN_FAILURE_CODE))
    }

    fn current_control(&self) -> Option<ProcessControl> {
        self.control.lock().ok().and_then(|control| control.clone())
    }

    fn set_state(&self, state: TaskState) {
        if let Ok(mut slot) = self.state.lock() {
            *slot = state;
        }
    }
}

// Output after readiness only goes to the service log.
async fn drain_to_log(
    title: String,
    mut events: mpsc::Receiver<ProcessEvent>,
    logs: Option<Arc<ServiceLogWriter>>,
) {
    while let Some(event) = events.recv().await {
        if let (ProcessEvent::Output { data, .. }, Some(logs)) = (&event, &logs) {
            logs.write(&title, data).await;
        }
    }
    debug!(task = %title, "background output drained");
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<String>>,
        reject: bool,
    }

    impl RecordingHooks {
        fn rejecting() -> Self {
            Self {
                reject: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TaskHooks for RecordingHooks {
        fn on_start<'a>(
            &'a self,
            spec: &'a TaskSpec,
            _pattern: Option<&'a ReadinessPattern>,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .unwrap()
                    .push(format!("start:{}:{}", spec.title, spec.background));
            })
        }

        fn on_stop<'a>(
            &'a self,
            title: &'a str,
            _background: bool,
            result: &'a TaskResult,
            _logs: Option<&'a ServiceLogWriter>,
        ) -> BoxFuture<'a, Result<(), TaskError>> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .unwrap()
                    .push(format!("stop:{title}:{}", result.success));
                if self.reject {
                    return Err(TaskError::Rejected {
                        title: title.to_string(),
                        message: "port 3978 is already in use".to_string(),
                        log_file: None,
                    });
                }
                Ok(())
            })
        }
    }

    fn supervisor(command: &str) -> TaskSupervisor {
        TaskSupervisor::new(TaskSpec::new("svc", command, std::env::temp_dir()).background(true))
            .with_shutdown(ShutdownConfig::new(100))
    }

    fn pattern(raw: &str) -> ReadinessPattern {
        ReadinessPattern::regex(raw).unwrap()
    }

    #[tokio::test]
    async fn pattern_match_wins_over_later_failure() {
        let task = supervisor("echo ready && sleep 1 && exit 1");
        let started = Instant::now();
        let result = task.wait_for(&pattern("ready"), &NoopHooks, None).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(900));
        assert!(result.success);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.stdout, vec!["ready"]);
        assert_eq!(task.state(), TaskState::Ready);
        task.terminate().await;
    }

    #[tokio::test]
    async fn exit_before_match_reports_exit_code() {
        let task = supervisor("echo starting; echo boom 1>&2; exit 2");
        let err = task
            .wait_for(&pattern("listening"), &NoopHooks, None)
            .await
            .unwrap_err();
        match err {
            TaskError::Failed { result, .. } => {
                assert!(!result.success);
                assert_eq!(result.exit_code, Some(2));
                assert_eq!(result.stderr, vec!["boom"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(task.state(), TaskState::Exited);
    }

    #[tokio::test]
    async fn clean_exit_without_match_succeeds() {
        let task = supervisor("echo done");
        let result = task.wait_for(&pattern("never"), &NoopHooks, None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(task.state(), TaskState::Exited);
    }

    #[tokio::test]
    async fn wait_resolves_only_on_exit() {
        let task = supervisor("echo ready; sleep 0.2; echo installed");
        let result = task.wait(&NoopHooks, None).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, vec!["ready", "installed"]);
    }

    #[tokio::test]
    async fn hooks_bracket_the_run() {
        let hooks = RecordingHooks::default();
        let task = supervisor("exit 0");
        task.wait(&hooks, None).await.unwrap();
        assert_eq!(hooks.calls(), vec!["start:svc:true", "stop:svc:true"]);
    }

    #[tokio::test]
    async fn stop_hook_error_overrides_success() {
        let hooks = RecordingHooks::rejecting();
        let task = supervisor("echo ready; sleep 5");
        let err = task.wait_for(&pattern("ready"), &hooks, None).await.unwrap_err();
        assert!(matches!(err, TaskError::Rejected { .. }));
        assert_eq!(hooks.calls(), vec!["start:svc:true", "stop:svc:true"]);
        task.terminate().await;
    }

    #[tokio::test]
    async fn on_start_pattern_is_ready_immediately() {
        let task = supervisor("sleep 5");
        let result = task
            .wait_for(&ReadinessPattern::OnStart, &NoopHooks, None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, None);
        assert_eq!(task.state(), TaskState::Ready);
        assert!(task.terminate().await);
    }

    #[tokio::test]
    async fn on_start_pattern_still_reports_spawn_failure() {
        let task = TaskSupervisor::new(TaskSpec::new("svc", "sleep 5", "/no/such/dir"));
        let err = task
            .wait_for(&ReadinessPattern::OnStart, &NoopHooks, None)
            .await
            .unwrap_err();
        match err {
            TaskError::Failed { result, .. } => {
                assert_eq!(result.exit_code, Some(SPAWN_FAILURE_CODE));
                assert!(result.stderr[0].contains("failed to spawn svc"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn ready_timeout_terminates_the_process() {
        let task = supervisor("sleep 30").with_ready_timeout(Some(Duration::from_millis(200)));
        let err = task.wait_for(&pattern("never"), &NoopHooks, None).await.unwrap_err();
        assert!(matches!(err, TaskError::ReadinessTimeout { .. }));
        assert_eq!(task.state(), TaskState::Exited);
        assert!(!task.terminate().await);
    }

    #[tokio::test]
    async fn terminate_from_another_task_resolves_wait() {
        let task = Arc::new(supervisor("sleep 30"));
        let waiter = {
            let task = task.clone();
            tokio::spawn(async move { task.wait_for(&pattern("never"), &NoopHooks, None).await })
        };
        while task.pid().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(task.terminate().await);
        assert!(!task.terminate().await);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TaskError::Failed { .. }));
    }

    #[tokio::test]
    async fn terminate_before_start_stops_the_run() {
        let task = supervisor("sleep 30");
        assert!(!task.terminate().await);
        let started = Instant::now();
        let err = task.wait(&NoopHooks, None).await.unwrap_err();
        assert!(matches!(err, TaskError::Failed { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn output_is_logged_before_and_after_readiness() {
        let root = tempfile::tempdir().unwrap();
        let mut writer = ServiceLogWriter::new(root.path(), 10);
        writer.init().await;
        let logs = Arc::new(writer);

        let task = supervisor("echo booting; echo ready; sleep 0.2; echo later; sleep 5");
        task.wait_for(&pattern("ready"), &NoopHooks, Some(logs.clone()))
            .await
            .unwrap();

        let path = logs.log_file("svc").unwrap();
        let mut logged = String::new();
        for _ in 0..40 {
            logged = std::fs::read_to_string(&path).unwrap();
            if logged.contains("later") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(logged, "booting\nready\nlater\n");
        task.terminate().await;
    }
}
