use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use clap::{Args, Parser, Subcommand};

use crate::config::{ConfigError, MonitorConfig};
use crate::fleet::{Fleet, Vm};
use crate::logging::init_file_logging;
use crate::monitor::{
    unix_now, DriverOptions, KeyboardInput, Monitor, MonitorError, MonitorState, SessionExit,
    DEFAULT_SHUTDOWN_GRACE,
};
use crate::process_manager::{OrchestrationProcess, OrchestrationSpec, ProcessManagerError};
use crate::render::{DeployView, LogTailFilter, TeardownView, TerminalScreen};
use crate::session_log::SessionJournal;
use crate::summary::{render_summary, SessionMode, SessionReport};
use crate::teardown::LogScraper;
use crate::ui::{KeyValue, OutputMode, PlainRenderer, Renderer, UiError, UiResult};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "fleetmon",
    version,
    about = "Live terminal monitor for multi-phase VM fleet deployments"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run a provisioning/install command and watch the fleet.
    Deploy(RunArgs),
    /// Run a teardown command and watch servers and volumes being removed.
    Teardown(RunArgs),
    /// Print the seed list in display order without running anything.
    Preview(PreviewArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RunArgs {
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: PathBuf,
    /// Directory for the raw log, the event stream and the session journal.
    #[arg(long, value_name = "DIR", default_value = "logs")]
    pub log_dir: PathBuf,
    /// Leave the event stream file behind after the session.
    #[arg(long)]
    pub keep_events: bool,
    /// The orchestration command. A single argument is handed to the shell
    /// as-is.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct PreviewArgs {
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Process(#[from] ProcessManagerError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Ui(#[from] UiError),
    #[error("invalid fleet pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("failed to prepare {what} {path}: {source}")]
    Setup {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SessionMode {
    fn file_prefix(self) -> &'static str {
        match self {
            SessionMode::Deploy => "deploy",
            SessionMode::Teardown => "teardown",
        }
    }
}

/// Runs one command and returns the process exit code.
pub fn run(command: Command) -> Result<i32, CliError> {
    match command {
        Command::Deploy(args) => run_session(&args, SessionMode::Deploy),
        Command::Teardown(args) => run_session(&args, SessionMode::Teardown),
        Command::Preview(args) => {
            let config = MonitorConfig::load(&args.config)?;
            let mut renderer = PlainRenderer::stdout(OutputMode::from_env());
            render_preview(&mut renderer, &config)?;
            Ok(EXIT_OK)
        }
    }
}

fn run_session(args: &RunArgs, mode: SessionMode) -> Result<i32, CliError> {
    let config = MonitorConfig::load(&args.config)?;
    let log_dir = args.log_dir.as_path();
    init_file_logging(log_dir).map_err(|source| CliError::Setup {
        what: "log directory",
        path: log_dir.to_path_buf(),
        source,
    })?;

    let started = Local::now();
    let stamp = started.format("%Y%m%d-%H%M%S");
    let raw_log = log_dir.join(format!("{}-{stamp}.log", mode.file_prefix()));
    let event_file = log_dir.join(format!("{}-{stamp}.events.jsonl", mode.file_prefix()));

    let rules = config.rules();
    let mut fleet = Fleet::new(rules.clone(), config.flavors());
    fleet.seed(config.vms.iter().cloned());
    let journal =
        SessionJournal::create(log_dir, &config.deployment, started).map_err(|source| {
            CliError::Setup {
                what: "session journal in",
                path: log_dir.to_path_buf(),
                source,
            }
        })?;
    let mut state = MonitorState::new(fleet, unix_now()).with_journal(journal);
    if mode == SessionMode::Teardown {
        state = state.with_scraper(LogScraper::new(&rules)?);
    }
    let tail = LogTailFilter::new(&rules, config.coordinator_hosts.clone())?;

    let cwd = std::env::current_dir().map_err(|source| CliError::Setup {
        what: "working directory",
        path: PathBuf::from("."),
        source,
    })?;
    let spec = OrchestrationSpec {
        command: shell_command(&args.command),
        cwd,
        raw_log: raw_log.clone(),
        event_file: event_file.clone(),
        event_file_env: config.event_file_env.clone(),
        env: Vec::new(),
    };
    let mut child = OrchestrationProcess::spawn(&spec)?;

    let options = DriverOptions {
        poll_interval: config.poll_interval(),
        stream_wait: config.stream_wait(),
        shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
    };
    let mut monitor = Monitor::new(state, &event_file, Some(raw_log.clone()), options);
    let outcome = watch(&mut monitor, &mut child, mode, &config, tail);
    let exit = match outcome {
        Ok(exit) => exit,
        Err(error) => {
            if let Err(stop_error) = child.terminate(DEFAULT_SHUTDOWN_GRACE) {
                tracing::warn!(%stop_error, "failed to stop orchestration after driver error");
            }
            return Err(error);
        }
    };

    let ended_at = unix_now();
    let child_status = child.exit_diagnostic();
    let succeeded = child.success();
    let mut state = monitor.into_state();
    let journal_path = state.take_journal().and_then(|journal| {
        match journal.finish(&state.fleet, &state.resources, ended_at) {
            Ok(path) => Some(path),
            Err(error) => {
                tracing::warn!(%error, "failed to write session journal");
                None
            }
        }
    });
    if !args.keep_events {
        remove_event_file(&event_file);
    }

    let mut renderer = PlainRenderer::stdout(OutputMode::from_env());
    render_summary(
        &mut renderer,
        &SessionReport {
            mode,
            exit,
            state: &state,
            ended_at,
            child_status: Some(child_status),
            journal: journal_path.as_deref(),
        },
    )?;
    renderer.key_values(&[KeyValue::new("Raw log", raw_log.display().to_string())])?;

    Ok(match exit {
        SessionExit::Cancelled => EXIT_CANCELLED,
        SessionExit::Normal if succeeded => EXIT_OK,
        SessionExit::Normal => EXIT_FAILURE,
    })
}

/// Owns the live screen for the length of the session.
fn watch(
    monitor: &mut Monitor,
    child: &mut OrchestrationProcess,
    mode: SessionMode,
    config: &MonitorConfig,
    tail: LogTailFilter,
) -> Result<SessionExit, CliError> {
    let mut screen = TerminalScreen::enter().map_err(MonitorError::Terminal)?;
    let mut input = KeyboardInput;
    let exit = match mode {
        SessionMode::Deploy => {
            let mut view = DeployView::new(config.view_settings(), tail);
            monitor.run(child, &mut screen, &mut input, &mut view)
        }
        SessionMode::Teardown => {
            let mut view = TeardownView::new(config.view_settings(), tail);
            monitor.run(child, &mut screen, &mut input, &mut view)
        }
    };
    screen.leave().map_err(MonitorError::Terminal)?;
    exit.map_err(CliError::from)
}

fn remove_event_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "failed to remove event stream")
        }
    }
}

/// Joins argv for `sh -lc`. A lone argument is taken as a shell string.
pub fn shell_command(args: &[String]) -> String {
    if let [single] = args {
        return single.clone();
    }
    args.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<String>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "-_./=:,+@%".contains(ch));
    if safe {
        return arg.to_owned();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// The seed list grouped by behavior family, in display order.
pub fn render_preview<R: Renderer>(renderer: &mut R, config: &MonitorConfig) -> UiResult<()> {
    let mut fleet = Fleet::new(config.rules(), config.flavors());
    fleet.seed(config.vms.iter().cloned());

    renderer.section(&format!("Deployment preview: {}", config.deployment))?;
    renderer.key_values(&[KeyValue::new("VMs", fleet.len().to_string())])?;

    let mut groups: Vec<(u8, Vec<&Vm>)> = Vec::new();
    for vm in fleet.sorted() {
        let category = vm.sort_key().category;
        match groups.last_mut() {
            Some((current, members)) if *current == category => members.push(vm),
            _ => groups.push((category, vec![vm])),
        }
    }
    for (category, members) in groups {
        let items = members
            .iter()
            .map(|vm| {
                format!("{}  {}  {}", vm.name, behavior_or_dash(vm), vm.hw_label)
            })
            .collect::<Vec<String>>();
        renderer.text("")?;
        renderer.bullet_list(
            &format!("{} ({})", category_label(category), members.len()),
            &items,
        )?;
    }
    Ok(())
}

fn behavior_or_dash(vm: &Vm) -> &str {
    if vm.behavior.is_empty() {
        "-"
    } else {
        &vm.behavior
    }
}

fn category_label(category: u8) -> &'static str {
    match category {
        0 => "C",
        1 => "M",
        2 => "B",
        3 => "BC",
        4 => "S",
        5 => "SC",
        _ => "untagged",
    }
}

#[cfg(test)]
#[path = "tests/cli_tests.rs"]
mod tests;
