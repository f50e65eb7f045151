//! Spawning, observing and terminating a single OS process.
//!
//! `ProcessHandle::spawn` runs a task's command line through the platform
//! shell in its own process group, and bridges the child's pipes and exit
//! status into a channel of `ProcessEvent`s. Spawning never fails from the
//! caller's point of view: a failed spawn produces a handle whose only events
//! are the error text on stderr followed by a synthetic exit.
//!
//! `ProcessControl` is the cloneable half used to terminate the whole process
//! tree from any task, independently of whoever is consuming the events.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::env::merge_process_env;
use crate::events::ProcessEvent;
use crate::output::StreamKind;
use crate::process::TaskSpec;

/// Exit code reported when the process could not be spawned or reaped.
pub const SPAWN_FAILURE_CODE: i32 = -1;

const READ_CHUNK_BYTES: usize = 8 * 1024;

// How long pipes may stay open after the process exited before we stop
// waiting for them (a forked child can inherit and hold them).
const STREAM_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// How long `terminate` waits after the graceful signal before killing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    grace_ms: u64,
}

impl ShutdownConfig {
    pub fn new(grace_ms: u64) -> Self {
        Self { grace_ms }
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::new(1500)
    }
}

/// One spawned process and the stream of its events.
pub struct ProcessHandle {
    events: mpsc::Receiver<ProcessEvent>,
    control: ProcessControl,
}

impl ProcessHandle {
    /// Spawns `spec` through the platform shell.
    pub fn spawn(spec: &TaskSpec, shutdown: ShutdownConfig) -> Self {
        let (event_tx, events) = mpsc::channel(256);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        let command_line = spec.command_line();

        let mut command = shell_command(&command_line);
        command.current_dir(&spec.cwd);
        if !spec.env.is_empty() {
            command.env_clear();
            command.envs(merge_process_env(&spec.env));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let pid = match command.spawn() {
            Ok(child) => {
                let pid = child.id();
                info!(
                    task = %spec.title,
                    pid = pid.unwrap_or(0),
                    cmd = %command_line,
                    cwd = %spec.cwd.display(),
                    "spawned task process"
                );
                tokio::spawn(watch_child(
                    spec.title.clone(),
                    child,
                    event_tx,
                    exit_tx,
                    kill_rx,
                ));
                pid
            }
            Err(err) => {
                warn!(task = %spec.title, error = %err, "failed to spawn task process");
                let message = format!("failed to spawn {}: {}\n", spec.title, err);
                // Fresh channel with spare capacity, so these cannot fail.
                let _ = event_tx.try_send(ProcessEvent::Output {
                    stream: StreamKind::Stderr,
                    data: message.into_bytes(),
                });
                let _ = event_tx.try_send(ProcessEvent::Exited {
                    code: SPAWN_FAILURE_CODE,
                });
                let _ = exit_tx.send(Some(SPAWN_FAILURE_CODE));
                None
            }
        };

        let control = ProcessControl {
            inner: Arc::new(ControlInner {
                title: spec.title.clone(),
                pid,
                exit: exit_rx,
                kill_tx: Mutex::new(Some(kill_tx)),
                terminated: AtomicBool::new(false),
                shutdown,
            }),
        };
        Self { events, control }
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    /// Whether the spawn itself failed.
    pub fn spawn_failed(&self) -> bool {
        self.control.pid().is_none()
    }

    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }

    /// Next output chunk or the exit; `None` once the channel is drained.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    /// Gives up the event stream, e.g. to keep draining it elsewhere.
    pub fn into_events(self) -> mpsc::Receiver<ProcessEvent> {
        self.events
    }
}

/// Cloneable handle used to terminate a process tree.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    inner: Arc<ControlInner>,
}

#[derive(Debug)]
struct ControlInner {
    title: String,
    pid: Option<u32>,
    exit: watch::Receiver<Option<i32>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    terminated: AtomicBool,
    shutdown: ShutdownConfig,
}

impl ProcessControl {
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.inner.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Waits until the process has been reaped.
    pub async fn wait_exit(&self) -> Option<i32> {
        let mut exit = self.inner.exit.clone();
        let code = match exit.wait_for(Option::is_some).await {
            Ok(code) => *code,
            Err(_) => self.exit_code(),
        };
        code
    }

    /// Terminates the process and everything in its process group.
    ///
    /// Sends the graceful signal first and escalates to a hard kill after the
    /// configured grace period. Returns `true` only for the call that actually
    /// issued the signals; later calls, and calls after the process exited,
    /// do nothing.
    pub async fn terminate(&self) -> bool {
        if self.has_exited() {
            return false;
        }
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(pid) = self.inner.pid else {
            return false;
        };

        info!(task = %self.inner.title, pid, "terminating task process tree");
        let grace = self.inner.shutdown.grace();
        if !grace.is_zero() {
            send_graceful_signal(pid);
            if tokio::time::timeout(grace, self.wait_exit()).await.is_err() {
                debug!(
                    task = %self.inner.title,
                    pid,
                    grace_ms = grace.as_millis() as u64,
                    "process still running after grace period; killing"
                );
            }
        }
        // Children that ignored the graceful signal may outlive the leader.
        kill_tree(pid, self.has_exited()).await;
        let kill_tx = self.inner.kill_tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        true
    }
}

fn shell_command(command_line: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command_line);
        c
    }
}

async fn watch_child(
    title: String,
    mut child: Child,
    event_tx: mpsc::Sender<ProcessEvent>,
    exit_tx: watch::Sender<Option<i32>>,
    kill_rx: oneshot::Receiver<()>,
) {
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_stream(
            StreamKind::Stdout,
            stdout,
            event_tx.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_stream(
            StreamKind::Stderr,
            stderr,
            event_tx.clone(),
        )));
    }

    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            let _ = child.kill().await;
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => exit_code(status),
        Err(err) => {
            warn!(task = %title, error = %err, "failed to wait for task process");
            SPAWN_FAILURE_CODE
        }
    };

    // Let the readers flush what the process wrote before it exited.
    let deadline = tokio::time::Instant::now() + STREAM_DRAIN_GRACE;
    for reader in readers {
        if tokio::time::timeout_at(deadline, reader).await.is_err() {
            debug!(task = %title, "output pipe still open after exit");
        }
    }

    info!(task = %title, exit_code = code, "task process exited");
    let _ = exit_tx.send(Some(code));
    let _ = event_tx.send(ProcessEvent::Exited { code }).await;
}

async fn forward_stream<R>(stream: StreamKind, mut reader: R, tx: mpsc::Sender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut listening = true;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // Keep reading after the receiver is gone so the child never
                // blocks on a full pipe.
                if listening {
                    let event = ProcessEvent::Output {
                        stream,
                        data: buf[..n].to_vec(),
                    };
                    listening = tx.send(event).await.is_ok();
                }
            }
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(SPAWN_FAILURE_CODE)
}

#[cfg(unix)]
fn send_graceful_signal(pid: u32) {
    signal_group(pid, libc::SIGTERM, true);
}

#[cfg(unix)]
async fn kill_tree(pid: u32, leader_exited: bool) {
    signal_group(pid, libc::SIGKILL, !leader_exited);
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: i32, include_leader: bool) {
    unsafe {
        let pid = pid as i32;
        let group_missing = libc::kill(-pid, signal) != 0;
        if group_missing && include_leader {
            let _ = libc::kill(pid, signal);
        }
    }
}

#[cfg(windows)]
fn send_graceful_signal(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // CTRL_BREAK is the closest console signal to SIGTERM.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(windows)]
async fn kill_tree(pid: u32, leader_exited: bool) {
    if leader_exited {
        return;
    }
    let status = Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(err) = status {
        warn!(pid, error = %err, "taskkill failed");
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_graceful_signal(_pid: u32) {}

#[cfg(all(not(unix), not(windows)))]
async fn kill_tree(_pid: u32, _leader_exited: bool) {}
