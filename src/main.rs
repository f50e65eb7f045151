//! devrack: runs a project's install steps and local services for preview.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, resolves the session plan from `devrack.toml` or the detected
//! run command, runs it through the orchestrator and keeps the services up
//! until interrupted.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tracing::{debug, info};

use devrack::config::Config;
use devrack::errors::{RackError, TaskError};
use devrack::handle::ShutdownConfig;
use devrack::logging::LogLevel;
use devrack::orchestrator::{Orchestrator, ServiceTask, SessionPlan};
use devrack::process::TaskSpec;
use devrack::progress::{address_in_use, ConsoleProgress, ProgressHooks, Properties};
use devrack::readiness::{ReadinessPattern, DEFAULT_RUNNING_PATTERN};
use devrack::service_log::{ServiceLogWriter, DEFAULT_LOG_RETENTION};

const RUN_COMMAND_TITLE: &str = "Run Command";
const DEFAULT_LOG_DIR: &str = ".devrack/logs";
const EXIT_FAILED: u8 = 1;
// Conventional status for termination by SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Runs install steps and local services of a project for preview",
    styles = help_styles()
)]
struct Cli {
    /// Path to devrack.toml (default: <folder>/devrack.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Project folder.
    #[arg(long, default_value = ".")]
    folder: PathBuf,
    /// Command that starts the local service. Detected when omitted; empty skips it.
    #[arg(long)]
    run_command: Option<String>,
    /// Ready signal in service output. Empty means ready as soon as the process starts.
    #[arg(long)]
    running_pattern: Option<String>,
    /// Root directory for service logs.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Number of log sessions to keep (at least 1).
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    log_retention: Option<usize>,
    /// Give up on a service that is not ready after this long (ms).
    #[arg(long)]
    ready_timeout_ms: Option<u64>,
    /// Time between the graceful stop signal and the hard kill (ms).
    #[arg(long)]
    shutdown_grace_ms: Option<u64>,
    /// Stop everything once services are ready instead of waiting for Ctrl+C.
    #[arg(long)]
    no_wait: bool,
    /// Print the resolved plan without running anything.
    #[arg(long)]
    dry_run: bool,
    /// Use ASCII markers in progress output.
    #[arg(long)]
    no_symbols: bool,
    /// Diagnostic log level (overrides DEVRACK_LOG).
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

/// Settings after merging CLI flags over the config file.
#[derive(Debug)]
struct RunSettings {
    folder: PathBuf,
    log_dir: PathBuf,
    log_retention: usize,
    running_pattern: ReadinessPattern,
    ready_timeout: Option<Duration>,
    shutdown: ShutdownConfig,
    use_symbols: bool,
}

impl RunSettings {
    fn resolve(cli: &Cli, config: &Config, folder: PathBuf) -> Result<Self> {
        let raw_pattern = cli
            .running_pattern
            .as_deref()
            .or(config.running_pattern.as_deref());
        let running_pattern = ReadinessPattern::resolve(raw_pattern, DEFAULT_RUNNING_PATTERN)
            .with_context(|| format!("invalid running pattern {:?}", raw_pattern.unwrap_or_default()))?;
        let log_dir = cli
            .log_dir
            .clone()
            .or_else(|| config.log_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
        let shutdown = match cli.shutdown_grace_ms.or(config.shutdown_grace_ms) {
            Some(grace_ms) => ShutdownConfig::new(grace_ms),
            None => ShutdownConfig::default(),
        };
        Ok(Self {
            log_dir: folder.join(log_dir),
            folder,
            log_retention: cli
                .log_retention
                .or(config.log_retention)
                .unwrap_or(DEFAULT_LOG_RETENTION),
            running_pattern,
            ready_timeout: cli
                .ready_timeout_ms
                .or(config.ready_timeout_ms)
                .map(Duration::from_millis),
            shutdown,
            use_symbols: !cli.no_symbols,
        })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    devrack::logging::init_logging(cli.log_level)?;

    let folder = std::path::absolute(&cli.folder)
        .with_context(|| format!("invalid project folder {}", cli.folder.display()))?;
    let config = match cli.config.clone().or_else(|| devrack::config::default_config_path(&folder)) {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            devrack::config::load_config(&path)?
        }
        None => Config::default(),
    };
    let settings = RunSettings::resolve(&cli, &config, folder)?;
    let plan = load_plan(&cli, &config, &settings)?;

    if cli.dry_run {
        for line in describe_plan(&plan) {
            println!("{}", format_tool_message(&line, settings.use_symbols));
        }
        return Ok(ExitCode::SUCCESS);
    }
    if plan.is_empty() {
        println!(
            "{}",
            format_tool_message("nothing to run", settings.use_symbols)
        );
        return Ok(ExitCode::SUCCESS);
    }

    let mut logs = ServiceLogWriter::new(&settings.log_dir, settings.log_retention);
    logs.init().await;
    let logs = Arc::new(logs);

    let properties = Properties::default();
    let hooks = ProgressHooks::new(
        Arc::new(ConsoleProgress::new(settings.use_symbols)),
        properties.clone(),
    )
    .with_diagnostic(Box::new(address_in_use));
    let orchestrator = Orchestrator::new(Arc::new(hooks), Some(logs.clone()))
        .with_shutdown(settings.shutdown)
        .with_ready_timeout(settings.ready_timeout);

    let outcome = tokio::select! {
        result = orchestrator.run_plan(plan) => Some(result),
        signal = shutdown_signal() => {
            info!(signal, "interrupted during startup");
            None
        }
    };

    let status = match outcome {
        None => EXIT_INTERRUPTED,
        Some(Err(err)) => {
            eprint!("{}", format_failure(&err));
            EXIT_FAILED
        }
        Some(Ok(results)) => {
            debug!(tasks = results.len(), properties = ?properties.snapshot(), "session ready");
            if let Some(dir) = logs.session_dir() {
                println!(
                    "{}",
                    format_tool_message(&format!("logs in {}", dir.display()), settings.use_symbols)
                );
            }
            if !cli.no_wait {
                println!(
                    "{}",
                    format_tool_message("services are ready, press Ctrl+C to stop", settings.use_symbols)
                );
                let signal = shutdown_signal().await;
                info!(signal, "shutting down");
            }
            0
        }
    };

    println!("{}", format_tool_message("stopping services", settings.use_symbols));
    orchestrator.teardown().await;
    Ok(ExitCode::from(status))
}

/// Builds the plan from the config, or from the run command when there are
/// no configured tasks.
fn load_plan(cli: &Cli, config: &Config, settings: &RunSettings) -> Result<SessionPlan> {
    let mut plan = config.to_plan(&settings.folder, &settings.running_pattern)?;
    let run_command = match cli.run_command.as_deref() {
        Some(command) => Some(command.trim().to_string()),
        None if config.tasks.is_empty() => Some(devrack::detect::detect_run_command(&settings.folder)?),
        None => None,
    };
    if let Some(command) = run_command.filter(|command| !command.is_empty()) {
        plan.services.push(ServiceTask::new(
            TaskSpec::new(RUN_COMMAND_TITLE, command, &settings.folder).background(true),
            Some(settings.running_pattern.clone()),
        ));
    }
    Ok(plan)
}

fn describe_plan(plan: &SessionPlan) -> Vec<String> {
    let mut lines = Vec::new();
    for spec in &plan.installs {
        lines.push(format!("install {}: {}{}", spec.title, spec.command_line(), in_dir(&spec.cwd)));
    }
    for service in &plan.services {
        let ready = service
            .pattern
            .as_ref()
            .map(ReadinessPattern::describe)
            .unwrap_or_else(|| "<exit>".to_string());
        lines.push(format!(
            "service {}: {}{} (ready on {})",
            service.spec.title,
            service.spec.command_line(),
            in_dir(&service.spec.cwd),
            ready
        ));
    }
    lines
}

fn in_dir(cwd: &Path) -> String {
    format!(" in {}", cwd.display())
}

/// Failure summary: a headline when there is no single failed task, then
/// each failed task with its stderr tail and log location.
fn format_failure(err: &RackError) -> String {
    let failures = err.task_errors();
    let mut out = String::new();
    if failures.len() != 1 {
        out.push_str(&format!("{}\n", err));
    }
    for failure in failures {
        out.push_str(&format_task_failure(failure));
    }
    out
}

fn format_task_failure(failure: &TaskError) -> String {
    let mut out = format!("{}\n", failure);
    if let Some(tail) = failure.stderr_tail() {
        for line in tail.lines() {
            out.push_str(&format!("  | {}\n", line));
        }
    }
    if let Some(path) = failure.log_file() {
        out.push_str(&format!("  log: {}\n", path.display()));
    }
    out
}

fn format_tool_message(text: &str, use_symbols: bool) -> String {
    if use_symbols {
        format!("◆ devrack: {}", text)
    } else {
        format!("[devrack] {}", text)
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix. Returns the signal name.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "CTRL_C"
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
