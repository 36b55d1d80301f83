pub mod input;
mod state;

use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::events::{decode_line, UnixTime};
use crate::process_manager::{OrchestrationProcess, ProcessManagerError, Termination};
use crate::render::{FrameRender, Screen, Viewport};
use crate::session_log::Marker;
use crate::tail::LineTail;

pub use input::{is_cancel_key, InputSource, KeyboardInput, Wait};
pub use state::{MonitorState, RAW_WINDOW_LINES};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_STREAM_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("terminal error: {0}")]
    Terminal(#[source] io::Error),
    #[error("input error: {0}")]
    Input(#[source] io::Error),
    #[error(transparent)]
    Process(#[from] ProcessManagerError),
}

/// What the driver needs from the orchestration child.
pub trait ChildHandle {
    fn is_running(&mut self) -> bool;
    fn terminate(&mut self, grace: Duration) -> Result<Termination, ProcessManagerError>;
}

impl ChildHandle for OrchestrationProcess {
    fn is_running(&mut self) -> bool {
        OrchestrationProcess::is_running(self)
    }

    fn terminate(&mut self, grace: Duration) -> Result<Termination, ProcessManagerError> {
        OrchestrationProcess::terminate(self, grace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Normal,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Idle,
    WaitingForStream,
    Polling,
    Cancelled,
    ChildExited,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    pub poll_interval: Duration,
    /// Longest wait for the event stream to appear before polling anyway.
    pub stream_wait: Duration,
    pub shutdown_grace: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stream_wait: DEFAULT_STREAM_WAIT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

pub fn unix_now() -> UnixTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// The single cooperative loop: it tails both sources, applies events,
/// redraws and watches the child and the keyboard.
#[derive(Debug)]
pub struct Monitor {
    state: MonitorState,
    events: LineTail,
    raw: Option<LineTail>,
    options: DriverOptions,
    phase: DriverPhase,
}

impl Monitor {
    pub fn new(
        state: MonitorState,
        event_file: impl Into<PathBuf>,
        raw_log: Option<PathBuf>,
        options: DriverOptions,
    ) -> Self {
        Self {
            state,
            events: LineTail::new(event_file),
            raw: raw_log.map(LineTail::new),
            options,
            phase: DriverPhase::Idle,
        }
    }

    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn into_state(self) -> MonitorState {
        self.state
    }

    /// Runs until the child exits or the user cancels.
    pub fn run<C, S, I, R>(
        &mut self,
        child: &mut C,
        screen: &mut S,
        input: &mut I,
        view: &mut R,
    ) -> Result<SessionExit, MonitorError>
    where
        C: ChildHandle,
        S: Screen,
        I: InputSource,
        R: FrameRender,
    {
        self.phase = DriverPhase::WaitingForStream;
        let waiting_since = Instant::now();
        while !self.events.exists() {
            if waiting_since.elapsed() >= self.options.stream_wait {
                tracing::warn!(
                    path = %self.events.path().display(),
                    "event stream did not appear; polling anyway"
                );
                break;
            }
            if !child.is_running() {
                break;
            }
            let now = unix_now();
            self.poll_raw(now);
            self.render(screen, view, now)?;
            if self.wait_cycle(input)? == Wait::Cancel {
                return self.cancel(child);
            }
        }

        self.phase = DriverPhase::Polling;
        loop {
            let now = unix_now();
            self.poll(now);
            self.render(screen, view, now)?;
            if !child.is_running() {
                return self.finish_after_exit(screen, view);
            }
            if self.wait_cycle(input)? == Wait::Cancel {
                return self.cancel(child);
            }
        }
    }

    /// Reads whatever both sources gained since the last cycle.
    pub fn poll(&mut self, now: UnixTime) -> bool {
        let mut changed = false;
        match self.events.poll_lines() {
            Ok(lines) => {
                for line in lines {
                    changed |= self.apply_line(&line, now);
                }
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    path = %self.events.path().display(),
                    "failed reading event stream"
                );
            }
        }
        changed | self.poll_raw(now)
    }

    fn poll_raw(&mut self, now: UnixTime) -> bool {
        let Some(raw) = self.raw.as_mut() else {
            return false;
        };
        let lines = match raw.poll_lines() {
            Ok(lines) => lines,
            Err(error) => {
                tracing::warn!(%error, path = %raw.path().display(), "failed reading raw log");
                return false;
            }
        };
        let mut changed = false;
        for line in lines {
            changed |= self.state.ingest_raw(line, now);
        }
        changed
    }

    fn apply_line(&mut self, line: &str, now: UnixTime) -> bool {
        match decode_line(line) {
            Some(event) => self.state.apply_event(&event, now),
            None => false,
        }
    }

    fn finish_after_exit<S, R>(
        &mut self,
        screen: &mut S,
        view: &mut R,
    ) -> Result<SessionExit, MonitorError>
    where
        S: Screen,
        R: FrameRender,
    {
        self.phase = DriverPhase::ChildExited;
        let now = unix_now();
        self.poll(now);
        // The child is gone, so an unterminated last line is complete.
        if let Some(line) = self.events.flush_partial() {
            self.apply_line(&line, now);
        }
        if let Some(line) = self.raw.as_mut().and_then(LineTail::flush_partial) {
            self.state.ingest_raw(line, now);
        }
        self.render(screen, view, now)?;
        self.phase = DriverPhase::Finished;
        Ok(SessionExit::Normal)
    }

    fn cancel<C: ChildHandle>(&mut self, child: &mut C) -> Result<SessionExit, MonitorError> {
        self.phase = DriverPhase::Cancelled;
        tracing::info!("session cancelled from the keyboard");
        let termination = child.terminate(self.options.shutdown_grace)?;
        tracing::info!(?termination, "orchestration stopped");
        if let Some(journal) = self.state.journal_mut() {
            journal.note(unix_now(), Marker::Info, "session", "Cancelled by user");
        }
        self.phase = DriverPhase::Finished;
        Ok(SessionExit::Cancelled)
    }

    /// One bounded wait per cycle. Non-cancel input does not shorten it.
    fn wait_cycle<I: InputSource>(&self, input: &mut I) -> Result<Wait, MonitorError> {
        let deadline = Instant::now() + self.options.poll_interval;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Wait::Elapsed);
            }
            match input.wait(remaining).map_err(MonitorError::Input)? {
                Wait::Other => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    fn render<S, R>(
        &mut self,
        screen: &mut S,
        view: &mut R,
        now: UnixTime,
    ) -> Result<(), MonitorError>
    where
        S: Screen,
        R: FrameRender,
    {
        let (width, height) = screen.size().map_err(MonitorError::Terminal)?;
        let frame = view.render(
            &mut self.state,
            Viewport {
                width,
                height,
                now,
            },
        );
        screen.draw(&frame).map_err(MonitorError::Terminal)
    }
}
