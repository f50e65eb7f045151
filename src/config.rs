//! Session configuration.
//!
//! This module defines the structure of the `devrack.toml` file, loads it,
//! validates it and turns it into a `SessionPlan`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::errors::RackError;
use crate::orchestrator::{ServiceTask, SessionPlan};
use crate::process::TaskSpec;
use crate::readiness::ReadinessPattern;

pub const CONFIG_FILE_NAME: &str = "devrack.toml";

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Root directory for per-session service logs.
    pub log_dir: Option<PathBuf>,
    /// Number of log sessions to keep.
    pub log_retention: Option<usize>,
    /// Readiness pattern for services without their own. Empty means ready on start.
    pub running_pattern: Option<String>,
    /// Upper bound on waiting for a service to become ready.
    pub ready_timeout_ms: Option<u64>,
    /// Time between the graceful stop signal and the hard kill.
    pub shutdown_grace_ms: Option<u64>,
    #[serde(rename = "task", default)]
    pub tasks: Vec<TaskConfig>,
}

/// Configuration for a single task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    /// Shell command line.
    pub cmd: String,
    pub args: Option<Vec<String>>,
    /// Working directory, relative to the project folder.
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub stage: Stage,
    /// Readiness pattern overriding the session default.
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Runs to completion before any service starts.
    Install,
    /// Long-running server, started once every install succeeded.
    #[default]
    Service,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

/// `devrack.toml` in `folder`, if there is one.
pub fn default_config_path(folder: &Path) -> Option<PathBuf> {
    let path = folder.join(CONFIG_FILE_NAME);
    path.is_file().then_some(path)
}

impl Config {
    pub fn validate(&self) -> std::result::Result<(), RackError> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            let name = task.name.trim();
            if name.is_empty() {
                return Err(RackError::Config("task with an empty name".into()));
            }
            if !seen.insert(name) {
                return Err(RackError::Config(format!("duplicate task name: {name}")));
            }
            let words = shell_words::split(&task.cmd)
                .map_err(|err| RackError::Config(format!("failed to parse cmd for {name}: {err}")))?;
            if words.is_empty() {
                return Err(RackError::Config(format!("empty cmd for {name}")));
            }
            match (task.stage, &task.pattern) {
                (Stage::Install, Some(_)) => {
                    return Err(RackError::Config(format!(
                        "install task {name} cannot have a readiness pattern"
                    )));
                }
                (Stage::Service, Some(pattern)) => {
                    compile(name, Some(pattern))?;
                }
                _ => {}
            }
        }
        if let Some(pattern) = &self.running_pattern {
            compile("running_pattern", Some(pattern))?;
        }
        if self.log_retention == Some(0) {
            return Err(RackError::Config("log_retention must be at least 1".into()));
        }
        Ok(())
    }

    /// Builds the session plan; `default_pattern` applies to services
    /// without a pattern of their own.
    pub fn to_plan(
        &self,
        folder: &Path,
        default_pattern: &ReadinessPattern,
    ) -> std::result::Result<SessionPlan, RackError> {
        let mut plan = SessionPlan::default();
        for task in &self.tasks {
            let cwd = match &task.cwd {
                Some(cwd) => folder.join(cwd),
                None => folder.to_path_buf(),
            };
            let mut spec = TaskSpec::new(task.name.trim(), task.cmd.clone(), cwd)
                .background(task.stage == Stage::Service)
                .args(task.args.clone().unwrap_or_default());
            spec.env = task.env.clone().unwrap_or_default();

            match task.stage {
                Stage::Install => plan.installs.push(spec),
                Stage::Service => {
                    let pattern = match &task.pattern {
                        Some(_) => compile(&task.name, task.pattern.as_deref())?,
                        None => default_pattern.clone(),
                    };
                    plan.services.push(ServiceTask::new(spec, Some(pattern)));
                }
            }
        }
        Ok(plan)
    }
}

fn compile(owner: &str, pattern: Option<&str>) -> std::result::Result<ReadinessPattern, RackError> {
    ReadinessPattern::resolve(pattern, crate::readiness::DEFAULT_RUNNING_PATTERN)
        .map_err(|err| RackError::Config(format!("invalid pattern for {owner}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log_dir = ".devrack/logs"
log_retention = 5
running_pattern = "listening"
ready_timeout_ms = 60000
shutdown_grace_ms = 500

[[task]]
name = "Frontend Install"
cmd = "npm ci"
cwd = "tabs"
stage = "install"

[[task]]
name = "Frontend Start"
cmd = "npm run"
args = ["dev:teamsfx"]
cwd = "tabs"
env = { BROWSER = "none", PORT = "53000" }
pattern = "Compiled|Failed"

[[task]]
name = "Bot Start"
cmd = "npm run dev:teamsfx"
"#;

    #[test]
    fn parses_sessions_and_tasks() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.log_retention, Some(5));
        assert_eq!(config.ready_timeout_ms, Some(60000));
        assert_eq!(config.tasks.len(), 3);
        assert_eq!(config.tasks[0].stage, Stage::Install);
        assert_eq!(config.tasks[2].stage, Stage::Service);
        assert_eq!(
            config.tasks[1].env.as_ref().unwrap().get("PORT").map(String::as_str),
            Some("53000")
        );
    }

    #[test]
    fn plan_splits_stages_and_resolves_patterns() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let folder = Path::new("/work/app");
        let plan = config
            .to_plan(folder, &ReadinessPattern::regex("listening").unwrap())
            .unwrap();

        assert_eq!(plan.installs.len(), 1);
        assert_eq!(plan.installs[0].cwd, folder.join("tabs"));
        assert!(!plan.installs[0].background);

        assert_eq!(plan.services.len(), 2);
        let frontend = &plan.services[0];
        assert!(frontend.spec.background);
        assert_eq!(frontend.spec.command_line(), "npm run dev:teamsfx");
        assert_eq!(frontend.pattern.as_ref().unwrap().describe(), "/Compiled|Failed/i");
        let bot = &plan.services[1];
        assert_eq!(bot.spec.cwd, folder);
        assert_eq!(bot.pattern.as_ref().unwrap().describe(), "/listening/i");
    }

    #[test]
    fn rejects_invalid_tasks() {
        let duplicate = r#"
[[task]]
name = "api"
cmd = "func start"
[[task]]
name = "api"
cmd = "dotnet run"
"#;
        let install_pattern = r#"
[[task]]
name = "restore"
cmd = "dotnet restore"
stage = "install"
pattern = "done"
"#;
        let bad_regex = r#"
[[task]]
name = "api"
cmd = "func start"
pattern = "("
"#;
        let unterminated = r#"
[[task]]
name = "api"
cmd = "echo 'oops"
"#;
        let no_retention = "log_retention = 0\n";
        for raw in [duplicate, install_pattern, bad_regex, unterminated, no_retention] {
            let config: Config = toml::from_str(raw).unwrap();
            assert!(matches!(config.validate(), Err(RackError::Config(_))), "{raw}");
        }
    }

    #[test]
    fn empty_task_pattern_means_ready_on_start() {
        let config: Config = toml::from_str(
            r#"
[[task]]
name = "tunnel"
cmd = "ngrok http 3978"
pattern = ""
"#,
        )
        .unwrap();
        let plan = config
            .to_plan(Path::new("."), &ReadinessPattern::default_pattern())
            .unwrap();
        assert!(plan.services[0].pattern.as_ref().unwrap().is_on_start());
    }

    #[test]
    fn load_config_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[[task]]\nname = \"\"\ncmd = \"x\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("devrack.toml"));
        assert_eq!(default_config_path(dir.path()), Some(path));
    }
}
