use std::path::Path;

use crate::events::{ResourceKind, UnixTime};
use crate::fleet::{truncate_chars, VmStatus};
use crate::monitor::{MonitorState, SessionExit};
use crate::render::format_seconds;
use crate::teardown::{ResourceCounts, ResourceStatus};
use crate::ui::{KeyValue, MessageBlock, Renderer, SummaryCounts, TableSpec, UiResult};

const SUMMARY_ERROR_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Deploy,
    Teardown,
}

/// Everything the post-session report prints.
#[derive(Debug)]
pub struct SessionReport<'a> {
    pub mode: SessionMode,
    pub exit: SessionExit,
    pub state: &'a MonitorState,
    pub ended_at: UnixTime,
    pub child_status: Option<String>,
    pub journal: Option<&'a Path>,
}

pub fn render_summary<R: Renderer>(renderer: &mut R, report: &SessionReport<'_>) -> UiResult<()> {
    if report.exit == SessionExit::Cancelled {
        renderer.warning_block(
            &MessageBlock::new(
                "Session cancelled",
                "The orchestration command was stopped before it finished.",
            )
            .with_hint("entities still in progress were left as they were"),
        )?;
    }
    match report.mode {
        SessionMode::Deploy => render_deploy(renderer, report)?,
        SessionMode::Teardown => render_teardown(renderer, report)?,
    }

    let mut footer = Vec::new();
    if let Some(status) = &report.child_status {
        footer.push(KeyValue::new("Orchestration", status.clone()));
    }
    if let Some(path) = report.journal {
        footer.push(KeyValue::new("Session log", path.display().to_string()));
    }
    if !footer.is_empty() {
        renderer.text("")?;
        renderer.key_values(&footer)?;
    }
    Ok(())
}

fn render_deploy<R: Renderer>(renderer: &mut R, report: &SessionReport<'_>) -> UiResult<()> {
    let fleet = &report.state.fleet;
    let counts = fleet.counts();
    let elapsed = report.ended_at - report.state.started_at();

    renderer.section("Deployment Summary")?;
    renderer.key_values(&[
        KeyValue::new("Completed", format!("{}/{}", counts.completed, counts.total)),
        KeyValue::new("Failed", counts.failed.to_string()),
        KeyValue::new("In progress", counts.active().to_string()),
        KeyValue::new("Elapsed", format_seconds(elapsed)),
    ])?;
    if fleet.is_empty() {
        return renderer.summary(SummaryCounts::default());
    }

    let rows = fleet
        .sorted()
        .into_iter()
        .map(|vm| {
            vec![
                vm.name.clone(),
                vm.hw_label.clone(),
                vm.status.label().to_owned(),
                vm.elapsed(report.ended_at)
                    .map(format_seconds)
                    .unwrap_or_else(|| "-".to_owned()),
            ]
        })
        .collect::<Vec<Vec<String>>>();
    renderer.text("")?;
    renderer.table(&TableSpec::new(["VM", "HW", "Status", "Elapsed"], rows))?;

    let failed = fleet
        .sorted()
        .into_iter()
        .filter(|vm| vm.status == VmStatus::Failed)
        .map(|vm| {
            let error = vm.error.as_deref().unwrap_or("unknown error");
            format!("{}: {}", vm.name, truncate_chars(error, SUMMARY_ERROR_CHARS))
        })
        .collect::<Vec<String>>();
    if !failed.is_empty() {
        renderer.text("")?;
        renderer.bullet_list("Failed VMs", &failed)?;
    }
    renderer.text("")?;
    renderer.summary(SummaryCounts {
        ok: counts.completed,
        pending: counts.active(),
        failed: counts.failed,
    })
}

fn render_teardown<R: Renderer>(renderer: &mut R, report: &SessionReport<'_>) -> UiResult<()> {
    let resources = &report.state.resources;
    let servers = resources.counts(Some(ResourceKind::Server));
    let volumes = resources.counts(Some(ResourceKind::Volume));
    let all = resources.counts(None);

    renderer.section("Teardown Summary")?;
    renderer.key_values(&[
        KeyValue::new("Servers", removal_line(servers)),
        KeyValue::new("Volumes", removal_line(volumes)),
        KeyValue::new(
            "Elapsed",
            format_seconds(report.ended_at - report.state.started_at()),
        ),
    ])?;

    let failed = resources
        .sorted()
        .into_iter()
        .filter(|resource| resource.status == ResourceStatus::Failed)
        .map(|resource| {
            format!(
                "{} {}: {}",
                resource.kind.label(),
                resource.name,
                truncate_chars(
                    resource.error.as_deref().unwrap_or("delete failed"),
                    SUMMARY_ERROR_CHARS
                )
            )
        })
        .collect::<Vec<String>>();
    if !failed.is_empty() {
        renderer.text("")?;
        renderer.bullet_list("Failed deletions", &failed)?;
    }
    renderer.text("")?;
    renderer.summary(SummaryCounts {
        ok: all.deleted,
        pending: all.pending + all.deleting,
        failed: all.failed,
    })
}

fn removal_line(counts: ResourceCounts) -> String {
    format!(
        "{} deleted, {} failed of {}",
        counts.deleted, counts.failed, counts.total
    )
}

#[cfg(test)]
#[path = "tests/summary_tests.rs"]
mod tests;
