use std::collections::VecDeque;

use crate::events::{Event, UnixTime};
use crate::fleet::Fleet;
use crate::render::log_tail::strip_ansi;
use crate::session_log::SessionJournal;
use crate::teardown::{LogScraper, ResourceTracker};

/// Raw log lines kept for the log tail and the activity line.
pub const RAW_WINDOW_LINES: usize = 400;

/// Everything the driver knows about the session. The driver is its only
/// writer.
#[derive(Debug)]
pub struct MonitorState {
    pub fleet: Fleet,
    pub resources: ResourceTracker,
    raw: VecDeque<String>,
    activity: Option<String>,
    scraper: Option<LogScraper>,
    journal: Option<SessionJournal>,
    started_at: UnixTime,
}

impl MonitorState {
    pub fn new(fleet: Fleet, started_at: UnixTime) -> Self {
        Self {
            fleet,
            resources: ResourceTracker::new(),
            raw: VecDeque::with_capacity(RAW_WINDOW_LINES),
            activity: None,
            scraper: None,
            journal: None,
            started_at,
        }
    }

    /// Enables resource tracking from the raw log while the event stream
    /// has reported no discovery.
    pub fn with_scraper(mut self, scraper: LogScraper) -> Self {
        self.scraper = Some(scraper);
        self
    }

    pub fn with_journal(mut self, journal: SessionJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn started_at(&self) -> UnixTime {
        self.started_at
    }

    /// Last `TASK [...]` or `PLAY [...]` header seen in the raw log.
    pub fn activity(&self) -> Option<&str> {
        self.activity.as_deref()
    }

    pub fn raw_lines(&self) -> impl Iterator<Item = &str> {
        self.raw.iter().map(String::as_str)
    }

    pub fn journal(&self) -> Option<&SessionJournal> {
        self.journal.as_ref()
    }

    pub fn journal_mut(&mut self) -> Option<&mut SessionJournal> {
        self.journal.as_mut()
    }

    pub fn take_journal(&mut self) -> Option<SessionJournal> {
        self.journal.take()
    }

    /// Applies one decoded event to every consumer. Returns whether any
    /// visible state changed.
    pub fn apply_event(&mut self, event: &Event, now: UnixTime) -> bool {
        let mut changed = self.fleet.apply(event, now);
        changed |= self.resources.apply(event, now);
        if let Some(journal) = self.journal.as_mut() {
            journal.record(event, &self.fleet, now);
        }
        changed
    }

    /// Takes one raw log line into the window and the fallback scraper.
    pub fn ingest_raw(&mut self, line: String, now: UnixTime) -> bool {
        let clean = strip_ansi(&line).trim_end().to_owned();
        if clean.starts_with("TASK [") || clean.starts_with("PLAY [") {
            self.activity = Some(clean.trim_end_matches(['*', ' ']).to_owned());
        }
        let mut changed = false;
        if !self.resources.has_structured_data() {
            if let Some(scraper) = self.scraper.as_mut() {
                changed = scraper.feed(&clean, &mut self.resources, now);
            }
        }
        if self.raw.len() == RAW_WINDOW_LINES {
            self.raw.pop_front();
        }
        self.raw.push_back(line);
        changed
    }
}
