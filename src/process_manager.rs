use std::fs::{self, File, OpenOptions};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as ProcessCommand, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::{setpgid, Pid};

const POLL_STEP: Duration = Duration::from_millis(40);

/// How to launch the orchestration command being monitored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationSpec {
    pub command: String,
    pub cwd: PathBuf,
    /// Receives the child's stdout and stderr.
    pub raw_log: PathBuf,
    /// The structured event stream the child appends to.
    pub event_file: PathBuf,
    /// Environment variable that tells the child where `event_file` is.
    pub event_file_env: String,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessManagerError {
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn orchestration command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting on orchestration command: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited,
    Graceful,
    Forced,
}

/// The orchestration child, running in its own process group.
#[derive(Debug)]
pub struct OrchestrationProcess {
    child: Child,
    command: String,
    status: Option<ExitStatus>,
}

impl OrchestrationProcess {
    pub fn spawn(spec: &OrchestrationSpec) -> Result<Self, ProcessManagerError> {
        let log = open_append(&spec.raw_log)?;
        let log_err = log
            .try_clone()
            .map_err(|source| ProcessManagerError::LogFile {
                path: spec.raw_log.clone(),
                source,
            })?;

        let mut process = ProcessCommand::new("sh");
        process
            .arg("-lc")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .env(&spec.event_file_env, &spec.event_file)
            .envs(spec.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        unsafe {
            process.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|error| std::io::Error::other(error.to_string()))
            });
        }

        let child = process
            .spawn()
            .map_err(|source| ProcessManagerError::Spawn {
                command: spec.command.clone(),
                source,
            })?;
        tracing::info!(pid = child.id(), command = %spec.command, "orchestration started");
        Ok(Self {
            child,
            command: spec.command.clone(),
            status: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Non-blocking liveness check. A wait error counts as exited.
    pub fn is_running(&mut self) -> bool {
        if self.status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(status = %format_exit_diagnostic(status), "orchestration exited");
                self.status = Some(status);
                false
            }
            Ok(None) => true,
            Err(error) => {
                tracing::warn!(%error, "orchestration liveness check failed");
                false
            }
        }
    }

    /// SIGTERM to the whole process group, then SIGKILL once `grace` runs
    /// out. Reaps the child before returning.
    pub fn terminate(&mut self, grace: Duration) -> Result<Termination, ProcessManagerError> {
        if !self.is_running() {
            return Ok(Termination::AlreadyExited);
        }
        tracing::info!(pid = self.child.id(), "terminating orchestration");
        self.signal(TermSignal::Term);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.is_running() {
                return Ok(Termination::Graceful);
            }
            thread::sleep(POLL_STEP);
        }

        tracing::warn!(pid = self.child.id(), "orchestration ignored SIGTERM; killing");
        self.signal(TermSignal::Kill);
        self.wait()?;
        Ok(Termination::Forced)
    }

    pub fn wait(&mut self) -> Result<ExitStatus, ProcessManagerError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().map_err(ProcessManagerError::Wait)?;
        self.status = Some(status);
        Ok(status)
    }

    /// `exit=<code>` or `signal=<n>` once exited, `running` before.
    pub fn exit_diagnostic(&mut self) -> String {
        self.is_running();
        match self.status {
            Some(status) => format_exit_diagnostic(status),
            None => "running".to_owned(),
        }
    }

    pub fn success(&mut self) -> bool {
        self.is_running();
        self.status.is_some_and(|status| status.success())
    }

    fn signal(&mut self, signal: TermSignal) {
        #[cfg(unix)]
        {
            let signal = match signal {
                TermSignal::Term => Signal::SIGTERM,
                TermSignal::Kill => Signal::SIGKILL,
            };
            let pid = self.child.id() as i32;
            if pid > 0 {
                if let Err(error) = kill(Pid::from_raw(-pid), signal) {
                    tracing::warn!(%error, ?signal, "failed to signal process group");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = signal;
            let _ = self.child.kill();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TermSignal {
    Term,
    Kill,
}

fn open_append(path: &Path) -> Result<File, ProcessManagerError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ProcessManagerError::LogFile {
            path: path.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ProcessManagerError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

pub fn format_exit_diagnostic(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        if let Some(code) = status.code() {
            return format!("exit={code}");
        }
        if let Some(signal) = status.signal() {
            return format!("signal={signal}");
        }
        "exit=unknown".to_owned()
    }
    #[cfg(not(unix))]
    {
        format!("exit={}", status.code().unwrap_or(-1))
    }
}
