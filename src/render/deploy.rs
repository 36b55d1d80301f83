use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};

use crate::events::UnixTime;
use crate::fleet::{Fleet, Phase, Step, Vm, VmStatus};
use crate::monitor::MonitorState;

use super::{
    compose, deploy_progress, display_list, format_seconds, hidden_note, muted, pad,
    progress_spans, step_glyph, FrameParts, FrameRender, Layout, LogTailFilter, ViewSettings,
    Viewport,
};

const MIN_NAME_WIDTH: usize = 10;
const HW_WIDTH: usize = 7;
const TIME_WIDTH: usize = 9;

/// The deploy table: one row per VM with its seven step markers.
#[derive(Debug, Clone)]
pub struct DeployView {
    settings: ViewSettings,
    tail: LogTailFilter,
}

impl DeployView {
    pub fn new(settings: ViewSettings, tail: LogTailFilter) -> Self {
        Self { settings, tail }
    }

    fn title(&self, state: &MonitorState, now: UnixTime) -> Line<'static> {
        let fleet = &state.fleet;
        let counts = fleet.counts();
        let label = if counts.total > 0 && counts.active() == 0 {
            "Complete"
        } else {
            fleet.phase().label()
        };
        let mut spans = vec![
            Span::styled("fleetmon", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(format!("  {}  ", self.settings.deployment)),
            Span::styled(
                format!("{label:<13}"),
                Style::default().fg(phase_color(fleet.phase())),
            ),
        ];
        spans.extend(progress_spans(deploy_progress(fleet)));
        spans.push(Span::raw(format!(
            "  {}/{} done",
            counts.completed, counts.total
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

    fn column_header(name_width: usize) -> Line<'static> {
        let mut text = pad("VM", name_width);
        text.push_str(&pad("HW", HW_WIDTH));
        for step in Step::ALL {
            text.push_str(&pad(step.header(), step_width(step)));
        }
        text.push_str(&pad("Time", TIME_WIDTH));
        text.push_str("Status");
        Line::from(Span::styled(
            text,
            Style::default().add_modifier(Modifier::BOLD),
        ))
    }

    fn row(vm: &Vm, fleet: &Fleet, name_width: usize, now: UnixTime) -> Line<'static> {
        let marks = fleet.markers(vm);
        let mut spans = vec![
            Span::styled(pad(&vm.name, name_width), status_style(vm.status)),
            Span::styled(pad(&vm.hw_label, HW_WIDTH), muted()),
        ];
        for (step, mark) in marks.iter() {
            spans.push(step_glyph(mark));
            spans.push(Span::raw(" ".repeat(step_width(step) - 1)));
        }
        let elapsed = vm.elapsed(now).map(format_seconds).unwrap_or_default();
        spans.push(Span::styled(pad(&elapsed, TIME_WIDTH), muted()));
        spans.push(Span::styled(vm.status.label(), status_style(vm.status)));
        Line::from(spans)
    }
}

impl FrameRender for DeployView {
    fn render(&mut self, state: &mut MonitorState, viewport: Viewport) -> Vec<Line<'static>> {
        state.fleet.observe_freezes(viewport.now);
        let state = &*state;
        let fleet = &state.fleet;
        let layout = Layout::compute(viewport.width, viewport.height, fleet.len(), &self.settings);
        let name_width = fleet
            .iter()
            .map(|vm| vm.name.chars().count() + 2)
            .max()
            .unwrap_or(0)
            .max(MIN_NAME_WIDTH);

        let list = display_list(fleet.sorted(), layout.table_rows, |vm: &Vm| {
            !vm.status.is_terminal()
        });
        let rows = list
            .items
            .iter()
            .map(|vm| Self::row(vm, fleet, name_width, viewport.now))
            .collect();

        let failures = fleet
            .sorted()
            .into_iter()
            .filter(|vm| vm.status == VmStatus::Failed)
            .map(|vm| {
                (
                    vm.name.clone(),
                    vm.error.clone().unwrap_or_else(|| "failed".to_owned()),
                )
            })
            .collect::<Vec<(String, String)>>();

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
                    Self::column_header(name_width),
                ],
                rows,
                hidden: hidden_note(list.hidden, list.hidden_terminal),
                errors: error_panel(&failures, layout.error_rows),
                log,
            },
        )
    }
}

fn step_width(step: Step) -> usize {
    step.header().len() + 1
}

fn phase_color(phase: Phase) -> Color {
    match phase {
        Phase::Idle => Color::DarkGray,
        Phase::Provisioning => Color::Yellow,
        Phase::Installing => Color::Cyan,
        Phase::Teardown => Color::Magenta,
    }
}

fn status_style(status: VmStatus) -> Style {
    match status {
        VmStatus::Pending => muted(),
        VmStatus::Completed => Style::default().fg(Color::Green),
        VmStatus::Failed => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        VmStatus::Creating | VmStatus::Provisioned => Style::default().fg(Color::Yellow),
        _ => Style::default().fg(Color::Cyan),
    }
}

pub(crate) fn activity_line(activity: Option<&str>) -> Line<'static> {
    match activity {
        Some(activity) => Line::from(Span::styled(format!("▸ {activity}"), muted())),
        None => Line::default(),
    }
}

/// Failed entities with their messages. When they outnumber the panel the
/// last row counts the rest.
pub(crate) fn error_panel(failures: &[(String, String)], rows: usize) -> Vec<Line<'static>> {
    if rows == 0 {
        return Vec::new();
    }
    let shown = if failures.len() > rows {
        rows - 1
    } else {
        failures.len()
    };
    let mut lines = failures
        .iter()
        .take(shown)
        .map(|(name, error)| {
            Line::from(vec![
                Span::styled("✕ ", Style::default().fg(Color::Red)),
                Span::styled(name.clone(), Style::default().add_modifier(Modifier::BOLD)),
                Span::raw("  "),
                Span::styled(error.clone(), Style::default().fg(Color::Red)),
            ])
        })
        .collect::<Vec<Line<'static>>>();
    if shown < failures.len() {
        lines.push(Line::from(Span::styled(
            format!("  +{} more", failures.len() - shown),
            Style::default().fg(Color::Red),
        )));
    }
    lines
}
