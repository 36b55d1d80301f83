pub mod deploy;
pub mod log_tail;
pub mod screen;
pub mod teardown;

use std::time::Duration;

use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};

use crate::events::UnixTime;
use crate::fleet::steps::install_fraction;
use crate::fleet::{Fleet, FleetCounts, Phase, StepMark, VmStatus};
use crate::monitor::MonitorState;

pub use deploy::DeployView;
pub use log_tail::{LogTailFilter, TailKind, TailLine};
pub use screen::{Screen, TerminalScreen};
pub use teardown::TeardownView;

/// Title, activity and column-header lines.
pub const HEADER_LINES: usize = 3;
/// The "N more" note under the table.
pub const HIDDEN_NOTE_LINES: usize = 1;
/// Rules above the error panel and above the log tail.
pub const SEPARATOR_LINES: usize = 2;
const PROGRESS_BAR_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: u16,
    pub height: u16,
    pub now: UnixTime,
}

/// Builds one full frame from the monitor state. The deploy and teardown
/// tables are the two implementations.
pub trait FrameRender {
    fn render(&mut self, state: &mut MonitorState, viewport: Viewport) -> Vec<Line<'static>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSettings {
    pub deployment: String,
    pub max_error_lines: usize,
    pub log_tail_lines: usize,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            deployment: "fleet".to_owned(),
            max_error_lines: 3,
            log_tail_lines: 8,
        }
    }
}

/// Row budget for one frame. Every region is padded to its size so the
/// frame always spans exactly `height` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub width: usize,
    pub height: usize,
    pub table_rows: usize,
    pub error_rows: usize,
    pub log_rows: usize,
}

impl Layout {
    pub fn compute(width: u16, height: u16, entities: usize, settings: &ViewSettings) -> Self {
        let height = usize::from(height);
        let error_rows = settings.max_error_lines;
        let overhead = HEADER_LINES
            + HIDDEN_NOTE_LINES
            + SEPARATOR_LINES
            + error_rows
            + settings.log_tail_lines;
        let available = height.saturating_sub(overhead).max(1);
        let table_rows = entities.min(available);
        let used = HEADER_LINES + table_rows + HIDDEN_NOTE_LINES + SEPARATOR_LINES + error_rows;
        Self {
            width: usize::from(width).max(1),
            height,
            table_rows,
            error_rows,
            log_rows: height.saturating_sub(used),
        }
    }

    /// Entity rows that fit, before clamping to the entity count.
    pub fn available_rows(height: u16, settings: &ViewSettings) -> usize {
        let overhead = HEADER_LINES
            + HIDDEN_NOTE_LINES
            + SEPARATOR_LINES
            + settings.max_error_lines
            + settings.log_tail_lines;
        usize::from(height).saturating_sub(overhead).max(1)
    }
}

/// A height-bounded view of a sorted entity list.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayList<'a, T> {
    pub items: Vec<&'a T>,
    pub hidden: usize,
    pub hidden_terminal: usize,
}

/// Keeps everything when it fits; otherwise active entities come first,
/// then terminal ones fill the remaining rows.
pub fn display_list<'a, T, F>(sorted: Vec<&'a T>, capacity: usize, is_active: F) -> DisplayList<'a, T>
where
    F: Fn(&T) -> bool,
{
    if sorted.len() <= capacity {
        return DisplayList {
            items: sorted,
            hidden: 0,
            hidden_terminal: 0,
        };
    }
    let (active, terminal): (Vec<&T>, Vec<&T>) =
        sorted.iter().copied().partition(|item| is_active(*item));
    let mut items = active.into_iter().take(capacity).collect::<Vec<&T>>();
    let room = capacity - items.len();
    let shown_terminal = terminal.len().min(room);
    items.extend(terminal.iter().copied().take(shown_terminal));
    DisplayList {
        hidden: sorted.len() - items.len(),
        hidden_terminal: terminal.len() - shown_terminal,
        items,
    }
}

/// Overall progress in `0..=1` for the deploy header.
pub fn deploy_progress(fleet: &Fleet) -> f64 {
    if fleet.is_empty() {
        return 0.0;
    }
    let total = fleet.len() as f64;
    match fleet.phase() {
        Phase::Installing => {
            let rules = fleet.rules();
            let done = fleet
                .iter()
                .map(|vm| install_fraction(vm, &fleet.markers(vm), rules))
                .sum::<f64>();
            done / total
        }
        Phase::Provisioning => {
            let done = fleet
                .iter()
                .filter(|vm| {
                    vm.status == VmStatus::Failed
                        || vm.status.rank() >= VmStatus::Provisioned.rank()
                })
                .count();
            done as f64 / total
        }
        Phase::Idle | Phase::Teardown => {
            let counts: FleetCounts = fleet.counts();
            (counts.completed + counts.failed) as f64 / total
        }
    }
}

pub fn progress_spans(fraction: f64) -> Vec<Span<'static>> {
    let fraction = fraction.clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    vec![
        Span::styled("[", muted()),
        Span::styled("█".repeat(filled), Style::default().fg(Color::Green)),
        Span::styled(
            "░".repeat(PROGRESS_BAR_WIDTH - filled),
            Style::default().fg(Color::DarkGray),
        ),
        Span::styled("]", muted()),
        Span::styled(
            format!(" {:>3}%", (fraction * 100.0).round() as u32),
            Style::default().add_modifier(Modifier::BOLD),
        ),
    ]
}

pub fn step_glyph(mark: StepMark) -> Span<'static> {
    match mark {
        StepMark::NotStarted => Span::styled("·", muted()),
        StepMark::InProgress => Span::styled("◌", Style::default().fg(Color::Cyan)),
        StepMark::Done => Span::styled("✓", Style::default().fg(Color::Green)),
        StepMark::Skipped => Span::styled("-", Style::default().fg(Color::DarkGray)),
        StepMark::Failed => Span::styled(
            "✕",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ),
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h{minutes:02}m{secs:02}s")
    } else if minutes > 0 {
        format!("{minutes}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}

pub fn format_seconds(seconds: f64) -> String {
    format_elapsed(Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX))
}

pub(crate) fn muted() -> Style {
    Style::default().fg(Color::DarkGray)
}

pub(crate) fn pad(text: &str, width: usize) -> String {
    let count = text.chars().count();
    if count >= width {
        let mut clipped = text.chars().take(width.saturating_sub(1)).collect::<String>();
        clipped.push(' ');
        return clipped;
    }
    format!("{text}{}", " ".repeat(width - count))
}

pub(crate) fn separator(width: usize) -> Line<'static> {
    Line::from(Span::styled("─".repeat(width), muted()))
}

pub(crate) fn hidden_note(hidden: usize, hidden_terminal: usize) -> Line<'static> {
    if hidden == 0 {
        return Line::default();
    }
    Line::from(Span::styled(
        format!("  … {hidden} more not shown ({hidden_terminal} finished)"),
        muted(),
    ))
}

/// The regions of one frame, before padding.
pub(crate) struct FrameParts {
    pub header: [Line<'static>; HEADER_LINES],
    pub rows: Vec<Line<'static>>,
    pub hidden: Line<'static>,
    pub errors: Vec<Line<'static>>,
    pub log: Vec<Line<'static>>,
}

/// Lays the regions out top to bottom, padding each to its row budget.
pub(crate) fn compose(layout: &Layout, parts: FrameParts) -> Vec<Line<'static>> {
    let mut frame = Vec::with_capacity(layout.height);
    frame.extend(parts.header);
    push_padded(&mut frame, parts.rows, layout.table_rows);
    frame.push(parts.hidden);
    frame.push(separator(layout.width));
    push_padded(&mut frame, parts.errors, layout.error_rows);
    frame.push(separator(layout.width));
    let log = parts.log;
    let skip = log.len().saturating_sub(layout.log_rows);
    push_padded(&mut frame, log.into_iter().skip(skip).collect(), layout.log_rows);
    frame.truncate(layout.height);
    frame
}

fn push_padded(frame: &mut Vec<Line<'static>>, lines: Vec<Line<'static>>, rows: usize) {
    let count = lines.len().min(rows);
    frame.extend(lines.into_iter().take(rows));
    frame.extend((count..rows).map(|_| Line::default()));
}

#[cfg(test)]
#[path = "../tests/render_tests.rs"]
mod tests;
