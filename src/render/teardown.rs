use chrono::{DateTime, Local};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};

use crate::events::UnixTime;
use crate::fleet::StepMark;
use crate::monitor::MonitorState;
use crate::teardown::{Resource, ResourceStatus, TeardownStage};

use super::deploy::{activity_line, error_panel};
use super::{
    compose, display_list, format_seconds, hidden_note, muted, pad, progress_spans, step_glyph,
    FrameParts, FrameRender, Layout, LogTailFilter, ViewSettings, Viewport,
};

const MIN_NAME_WIDTH: usize = 12;
const KIND_WIDTH: usize = 8;
const STATUS_WIDTH: usize = 12;

/// The teardown table: servers and volumes with their deletion status.
#[derive(Debug, Clone)]
pub struct TeardownView {
    settings: ViewSettings,
    tail: LogTailFilter,
}

impl TeardownView {
    pub fn new(settings: ViewSettings, tail: LogTailFilter) -> Self {
        Self { settings, tail }
    }

    fn title(&self, state: &MonitorState, now: UnixTime) -> Line<'static> {
        let tracker = &state.resources;
        let counts = tracker.counts(None);
        let fraction = if counts.total == 0 {
            if tracker.stage() == TeardownStage::Complete {
                1.0
            } else {
                0.0
            }
        } else {
            counts.finished() as f64 / counts.total as f64
        };
        let mut spans = vec![
            Span::styled("fleetmon", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(format!("  {}  ", self.settings.deployment)),
            Span::styled(
                format!("Teardown: {:<18}", tracker.stage().label()),
                Style::default().fg(Color::Magenta),
            ),
        ];
        spans.extend(progress_spans(fraction));
        spans.push(Span::raw(format!(
            "  {}/{} removed",
            counts.deleted, counts.total
        )));
        if counts.failed > 0 {
            spans.push(Span::styled(
                format!("  {} failed", counts.failed),
                Style::default().fg(Color::Red),
            ));
        }
        spans.push(Span::styled(
            format!("  {}", format_seconds(now - state.started_at())),
            muted(),
        ));
        Line::from(spans)
    }

    fn row(resource: &Resource, name_width: usize) -> Line<'static> {
        let style = status_style(resource.status);
        let finished = resource.finished_at.map(clock_time).unwrap_or_default();
        Line::from(vec![
            Span::styled(pad(&resource.name, name_width), style),
            Span::styled(pad(resource.kind.label(), KIND_WIDTH), muted()),
            step_glyph(status_mark(resource.status)),
            Span::raw(" "),
            Span::styled(pad(resource.status.label(), STATUS_WIDTH), style),
            Span::styled(finished, muted()),
        ])
    }
}

impl FrameRender for TeardownView {
    fn render(&mut self, state: &mut MonitorState, viewport: Viewport) -> Vec<Line<'static>> {
        let state = &*state;
        let tracker = &state.resources;
        let layout = Layout::compute(
            viewport.width,
            viewport.height,
            tracker.len(),
            &self.settings,
        );
        let sorted = tracker.sorted();
        let name_width = sorted
            .iter()
            .map(|resource| resource.name.chars().count() + 2)
            .max()
            .unwrap_or(0)
            .max(MIN_NAME_WIDTH);

        let failures = sorted
            .iter()
            .filter(|resource| resource.status == ResourceStatus::Failed)
            .map(|resource| {
                (
                    resource.name.clone(),
                    resource
                        .error
                        .clone()
                        .unwrap_or_else(|| "delete failed".to_owned()),
                )
            })
            .collect::<Vec<(String, String)>>();

        let list = display_list(sorted, layout.table_rows, |resource: &Resource| {
            !resource.status.is_terminal()
        });
        let rows = list
            .items
            .iter()
            .map(|resource| Self::row(resource, name_width))
            .collect();

        let mut header = pad("Resource", name_width);
        header.push_str(&pad("Type", KIND_WIDTH));
        header.push_str(&pad("Status", STATUS_WIDTH + 2));
        header.push_str("Removed");

        let log = self
            .tail
            .filter(state.raw_lines(), layout.log_rows)
            .iter()
            .map(|line| line.to_line())
            .collect();

        compose(
            &layout,
            FrameParts {
                header: [
                    self.title(state, viewport.now),
                    activity_line(state.activity()),
                    Line::from(Span::styled(
                        header,
                        Style::default().add_modifier(Modifier::BOLD),
                    )),
                ],
                rows,
                hidden: hidden_note(list.hidden, list.hidden_terminal),
                errors: error_panel(&failures, layout.error_rows),
                log,
            },
        )
    }
}

fn status_mark(status: ResourceStatus) -> StepMark {
    match status {
        ResourceStatus::Pending => StepMark::NotStarted,
        ResourceStatus::Deleting => StepMark::InProgress,
        ResourceStatus::Deleted => StepMark::Done,
        ResourceStatus::Failed => StepMark::Failed,
    }
}

fn status_style(status: ResourceStatus) -> Style {
    match status {
        ResourceStatus::Pending => muted(),
        ResourceStatus::Deleting => Style::default().fg(Color::Yellow),
        ResourceStatus::Deleted => Style::default().fg(Color::Green),
        ResourceStatus::Failed => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
    }
}

fn clock_time(ts: UnixTime) -> String {
    DateTime::from_timestamp(ts.trunc() as i64, 0)
        .map(|utc| utc.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_default()
}
