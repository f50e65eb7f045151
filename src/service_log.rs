//! Per-service log files grouped into retained sessions.
//!
//! Every preview session gets a fresh directory under the log root, named by
//! its start time so that name order is chronological. Each service appends
//! its raw output to its own file inside it. Everything here is best effort:
//! I/O failures are traced and swallowed, and a missing log only means there
//! is no path to show.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const DEFAULT_LOG_RETENTION: usize = 10;

const SESSION_PREFIX: &str = "session-";

/// Append-only log writer for one session.
#[derive(Debug)]
pub struct ServiceLogWriter {
    root: PathBuf,
    retention: usize,
    session_dir: Option<PathBuf>,
    files: Mutex<HashMap<String, tokio::fs::File>>,
}

impl ServiceLogWriter {
    pub fn new(root: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            root: root.into(),
            retention,
            session_dir: None,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the session directory and prunes old sessions.
    ///
    /// Never fails; on error the writer simply stays without a session.
    pub async fn init(&mut self) {
        let dir = match create_session_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) => {
                debug!(root = %self.root.display(), error = %err, "service log session unavailable");
                return;
            }
        };
        info!(dir = %dir.display(), "service log session created");
        self.session_dir = Some(dir);
        if let Err(err) = prune_sessions(&self.root, self.retention).await {
            debug!(root = %self.root.display(), error = %err, "failed to prune old log sessions");
        }
    }

    pub fn session_dir(&self) -> Option<&Path> {
        self.session_dir.as_deref()
    }

    /// Appends `data` to the log of `service`.
    pub async fn write(&self, service: &str, data: &[u8]) {
        let Some(path) = self.log_path(service) else {
            return;
        };
        let mut files = self.files.lock().await;
        if !files.contains_key(service) {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;
            match file {
                Ok(file) => {
                    files.insert(service.to_string(), file);
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "cannot open service log");
                    return;
                }
            }
        }
        if let Some(file) = files.get_mut(service) {
            let written = async {
                file.write_all(data).await?;
                file.flush().await
            };
            if let Err(err) = written.await {
                debug!(path = %path.display(), error = %err, "service log write failed");
            }
        }
    }

    /// The log path for `service`, only if something has been written to it.
    pub fn log_file(&self, service: &str) -> Option<PathBuf> {
        self.log_path(service).filter(|path| path.is_file())
    }

    fn log_path(&self, service: &str) -> Option<PathBuf> {
        self.session_dir
            .as_ref()
            .map(|dir| dir.join(log_file_name(service)))
    }
}

/// File name for a service title: spaces become `-`, path separators `_`.
pub fn log_file_name(service: &str) -> String {
    let name: String = service
        .trim()
        .chars()
        .map(|c| match c {
            ' ' => '-',
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    format!("{}.log", name)
}

fn session_name(millis: u128, attempt: u32) -> String {
    if attempt == 0 {
        format!("{}{:013}", SESSION_PREFIX, millis)
    } else {
        format!("{}{:013}-{}", SESSION_PREFIX, millis, attempt)
    }
}

async fn create_session_dir(root: &Path) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(root).await?;
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let mut attempt = 0;
    loop {
        let dir = root.join(session_name(millis, attempt));
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(err) => return Err(err),
        }
    }
}

async fn prune_sessions(root: &Path, retention: usize) -> std::io::Result<()> {
    let mut sessions = Vec::new();
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(SESSION_PREFIX) {
            sessions.push(name);
        }
    }
    sessions.sort();
    // The session just created always survives.
    let excess = sessions.len().saturating_sub(retention.max(1));
    for name in sessions.into_iter().take(excess) {
        let dir = root.join(&name);
        debug!(dir = %dir.display(), "removing old log session");
        tokio::fs::remove_dir_all(&dir).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_names_are_filesystem_safe() {
        assert_eq!(log_file_name("Frontend Start"), "Frontend-Start.log");
        assert_eq!(log_file_name("bot/ngrok: tunnel"), "bot_ngrok_-tunnel.log");
    }

    #[test]
    fn session_names_sort_chronologically() {
        let mut names = vec![
            session_name(1_700_000_000_123, 0),
            session_name(999_999_999_999, 0),
            session_name(1_700_000_000_123, 1),
        ];
        names.sort();
        assert_eq!(
            names,
            vec![
                "session-0999999999999",
                "session-1700000000123",
                "session-1700000000123-1",
            ]
        );
    }

    #[tokio::test]
    async fn eleventh_session_prunes_only_the_oldest() {
        let root = tempfile::tempdir().unwrap();
        for i in 0..10 {
            std::fs::create_dir(root.path().join(session_name(1_000 + i, 0))).unwrap();
        }
        std::fs::write(root.path().join("notes.txt"), "keep").unwrap();

        let mut writer = ServiceLogWriter::new(root.path(), DEFAULT_LOG_RETENTION);
        writer.init().await;

        let mut dirs: Vec<String> = std::fs::read_dir(root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        dirs.sort();
        assert_eq!(dirs.len(), 10);
        assert!(!dirs.contains(&session_name(1_000, 0)));
        assert!(dirs.contains(&session_name(1_001, 0)));
        assert!(writer.session_dir().unwrap().is_dir());
        assert!(root.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn writes_append_per_service() {
        let root = tempfile::tempdir().unwrap();
        let mut writer = ServiceLogWriter::new(root.path(), 3);
        writer.init().await;

        assert!(writer.log_file("Bot Start").is_none());
        writer.write("Bot Start", b"one\n").await;
        writer.write("Frontend Start", b"other\n").await;
        writer.write("Bot Start", b"two\n").await;

        let path = writer.log_file("Bot Start").unwrap();
        assert!(path.ends_with("Bot-Start.log"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn zero_retention_keeps_the_current_session() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join(session_name(1_000, 0))).unwrap();

        let mut writer = ServiceLogWriter::new(root.path(), 0);
        writer.init().await;
        writer.write("svc", b"still logged\n").await;

        assert!(writer.session_dir().unwrap().is_dir());
        assert!(!root.path().join(session_name(1_000, 0)).exists());
        let path = writer.log_file("svc").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "still logged\n");
    }

    #[tokio::test]
    async fn unusable_root_is_swallowed() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("file");
        std::fs::write(&blocker, "not a dir").unwrap();

        let mut writer = ServiceLogWriter::new(blocker.join("logs"), 10);
        writer.init().await;
        assert!(writer.session_dir().is_none());
        writer.write("svc", b"data").await;
        assert!(writer.log_file("svc").is_none());
    }
}
