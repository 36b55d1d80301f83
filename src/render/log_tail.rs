//! Filters the raw orchestration log down to the few lines worth showing
//! under the table.

use std::sync::OnceLock;

use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use regex::Regex;

use crate::fleet::FleetRules;

use super::muted;

/// Retry notices kept after collapsing a polling loop.
pub const MAX_RETRY_LINES: usize = 3;

const TASK_HEADER_PATTERN: &str = r"^(?:TASK|RUNNING HANDLER) \[(?P<task>[^\]]*)\]";
const PLAY_HEADER_PATTERN: &str = r"^PLAY \[(?P<play>[^\]]*)\]";
const RESULT_PATTERN: &str =
    r"^(?P<status>changed|fatal|failed): \[(?P<host>[^\]]+)\](?P<rest>.*)$";
const RETRY_MARKER_PATTERN: &str = r"^[A-Z][A-Z0-9_]*_RETRY: (?P<detail>.+)$";
const RECAP_ROW_PATTERN: &str = r"^\S+\s+:\s+ok=\d+";
const MSG_PATTERN: &str = r#""msg":\s*"(?P<msg>(?:[^"\\]|\\.)*)""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailKind {
    Play,
    Header,
    Changed,
    Failure,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailLine {
    pub kind: TailKind,
    pub text: String,
}

impl TailLine {
    fn new(kind: TailKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn to_line(&self) -> Line<'static> {
        let style = match self.kind {
            TailKind::Play => Style::default()
                .fg(Color::Magenta)
                .add_modifier(Modifier::BOLD),
            TailKind::Header => Style::default().fg(Color::Cyan),
            TailKind::Changed => Style::default().fg(Color::Yellow),
            TailKind::Failure => Style::default().fg(Color::Red),
            TailKind::Retry => muted(),
        };
        let indent = match self.kind {
            TailKind::Play | TailKind::Header => "",
            _ => "  ",
        };
        Line::from(Span::styled(format!("{indent}{}", self.text), style))
    }
}

#[derive(Debug, Clone)]
pub struct LogTailFilter {
    coordinators: Vec<String>,
    task_header: Regex,
    play_header: Regex,
    result: Regex,
    retry_marker: Regex,
    recap_row: Regex,
    msg: Regex,
    entity: Regex,
}

impl LogTailFilter {
    pub fn new(rules: &FleetRules, coordinators: Vec<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            coordinators,
            task_header: Regex::new(TASK_HEADER_PATTERN)?,
            play_header: Regex::new(PLAY_HEADER_PATTERN)?,
            result: Regex::new(RESULT_PATTERN)?,
            retry_marker: Regex::new(RETRY_MARKER_PATTERN)?,
            recap_row: Regex::new(RECAP_ROW_PATTERN)?,
            msg: Regex::new(MSG_PATTERN)?,
            entity: rules.entity_regex()?,
        })
    }

    /// Filters a window of raw log lines and returns the last `limit`.
    ///
    /// Task headers are held back until a change or failure shows up under
    /// them, so hosts polling with `ok:` never push real output away.
    pub fn filter<'a, I>(&self, window: I, limit: usize) -> Vec<TailLine>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut kept = Vec::new();
        let mut pending_header: Option<String> = None;
        let mut last_header: Option<String> = None;
        let mut in_recap = false;

        for raw in window {
            let stripped = strip_ansi(raw);
            let line = stripped.trim_end();
            if line.trim().is_empty() || line.chars().all(|c| c == '*') {
                continue;
            }
            if in_recap {
                if self.recap_row.is_match(line.trim_start()) {
                    continue;
                }
                in_recap = false;
            }
            if line.starts_with("PLAY RECAP") {
                in_recap = true;
                continue;
            }
            if let Some(captures) = self.play_header.captures(line) {
                pending_header = None;
                last_header = None;
                kept.push(TailLine::new(
                    TailKind::Play,
                    format!("PLAY {}", captures["play"].trim()),
                ));
                continue;
            }
            if let Some(captures) = self.task_header.captures(line) {
                pending_header = Some(captures["task"].trim().to_owned());
                continue;
            }
            if let Some(captures) = self.retry_marker.captures(line) {
                kept.push(TailLine::new(
                    TailKind::Retry,
                    format!("retry: {}", captures["detail"].trim()),
                ));
                continue;
            }
            if let Some(detail) = line.strip_prefix("FAILED - RETRYING:") {
                kept.push(TailLine::new(
                    TailKind::Retry,
                    format!("retrying:{}", detail.trim_end()),
                ));
                continue;
            }
            let Some(captures) = self.result.captures(line) else {
                continue;
            };
            if let Some(task) = pending_header.take() {
                if last_header.as_deref() != Some(task.as_str()) {
                    kept.push(TailLine::new(TailKind::Header, task.clone()));
                    last_header = Some(task);
                }
            }
            let status = &captures["status"];
            let host = self.display_host(&captures["host"], &captures["rest"]);
            if status == "changed" {
                kept.push(TailLine::new(TailKind::Changed, format!("changed: [{host}]")));
            } else {
                let detail = self
                    .msg
                    .captures(&captures["rest"])
                    .map(|msg| msg["msg"].replace("\\\"", "\""))
                    .unwrap_or_else(|| captures["rest"].trim_start_matches(':').trim().to_owned());
                kept.push(TailLine::new(
                    TailKind::Failure,
                    format!("{status}: [{host}] {detail}").trim_end().to_owned(),
                ));
            }
        }

        cap_retries(&mut kept, MAX_RETRY_LINES);
        let skip = kept.len().saturating_sub(limit);
        kept.split_off(skip)
    }

    /// Results reported by a coordinator host on behalf of a VM are shown
    /// under the VM's name.
    fn display_host(&self, host: &str, rest: &str) -> String {
        if !self.coordinators.iter().any(|coordinator| coordinator == host) {
            return host.to_owned();
        }
        rest.find("(item=")
            .and_then(|start| self.entity.find(&rest[start..]))
            .map(|found| found.as_str().to_owned())
            .unwrap_or_else(|| host.to_owned())
    }
}

/// Keeps only the newest `max` retry notices.
fn cap_retries(lines: &mut Vec<TailLine>, max: usize) {
    let retries = lines
        .iter()
        .filter(|line| line.kind == TailKind::Retry)
        .count();
    let mut excess = retries.saturating_sub(max);
    lines.retain(|line| {
        if excess > 0 && line.kind == TailKind::Retry {
            excess -= 1;
            return false;
        }
        true
    });
}

pub fn strip_ansi(text: &str) -> std::borrow::Cow<'_, str> {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").ok());
    match pattern {
        Some(pattern) if text.contains('\x1b') => pattern.replace_all(text, ""),
        _ => std::borrow::Cow::Borrowed(text),
    }
}
