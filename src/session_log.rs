//! Markdown journal of a monitoring session, written next to the raw log.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::events::{Event, EventKind, ResourceKind, UnixTime};
use crate::fleet::{truncate_chars, Fleet, VmStatus};
use crate::render::format_seconds;
use crate::teardown::ResourceTracker;

const TIMELINE_ERROR_CHARS: usize = 60;
const STDERR_CHARS: usize = 500;
const TABLE_ERROR_CHARS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Ok,
    Fail,
    Info,
}

impl Marker {
    fn text(self) -> &'static str {
        match self {
            Marker::Ok => "[OK]",
            Marker::Fail => "[FAIL]",
            Marker::Info => "[INFO]",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TimelineEntry {
    at: UnixTime,
    marker: Marker,
    target: String,
    message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalError {
    pub at: UnixTime,
    pub target: String,
    pub task: String,
    pub kind: &'static str,
    pub message: String,
    pub stderr: Option<String>,
}

pub fn journal_file_name(deployment: &str, started: DateTime<Local>) -> String {
    let deployment = deployment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("deploy-{deployment}-{}.md", started.format("%Y%m%d-%H%M%S"))
}

#[derive(Debug)]
pub struct SessionJournal {
    path: PathBuf,
    file: File,
    started_at: UnixTime,
    timeline: Vec<TimelineEntry>,
    errors: Vec<JournalError>,
}

impl SessionJournal {
    /// Creates `deploy-<deployment>-<stamp>.md` under `dir` and writes the
    /// header.
    pub fn create(dir: &Path, deployment: &str, started: DateTime<Local>) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(journal_file_name(deployment, started));
        let mut file = File::create(&path)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        write!(
            file,
            "# Deployment Log\n\n## Summary\n- **Deployment**: {deployment}\n- **Started**: {}\n- **Log File**: {file_name}\n\n---\n\n",
            started.to_rfc3339()
        )?;
        file.flush()?;
        Ok(Self {
            path,
            file,
            started_at: started.timestamp_millis() as f64 / 1000.0,
            timeline: Vec::new(),
            errors: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn errors(&self) -> &[JournalError] {
        &self.errors
    }

    pub fn note(&mut self, at: UnixTime, marker: Marker, target: &str, message: impl Into<String>) {
        self.timeline.push(TimelineEntry {
            at,
            marker,
            target: target.to_owned(),
            message: message.into(),
        });
    }

    /// Records the journal-worthy part of one event. `fleet` must already
    /// reflect the event.
    pub fn record(&mut self, event: &Event, fleet: &Fleet, now: UnixTime) {
        let at = event.unix_ts.unwrap_or(now);
        let task = event.task.clone().unwrap_or_default();
        match &event.kind {
            EventKind::PlaybookStart { playbook } => {
                self.note(at, Marker::Info, "Playbook", format!("Started: {playbook}"));
            }
            EventKind::PlaybookEnd { playbook, elapsed } => {
                self.note(
                    at,
                    Marker::Info,
                    "Playbook",
                    format!("Completed: {playbook} ({:.1}s)", elapsed.unwrap_or(0.0)),
                );
            }
            EventKind::VmProvisioned { vm } => {
                let message = match fleet.get(vm).and_then(|entry| entry.ip.as_deref()) {
                    Some(ip) => format!("provisioned (IP: {ip})"),
                    None => "provisioned".to_owned(),
                };
                self.note(at, Marker::Ok, vm, message);
            }
            EventKind::VmIp { vm, ip } => {
                self.note(at, Marker::Ok, vm, format!("IP assigned: {ip}"));
            }
            EventKind::VmFailed { vm, error } => {
                let message = error.as_deref().unwrap_or("VM creation failed");
                self.failure(at, vm, &task, "vm_failed", message);
            }
            EventKind::InstallFailed { host, stage, error } => {
                let fallback = format!(
                    "Stage {}: Install failed",
                    stage.as_deref().unwrap_or("?")
                );
                let message = error.as_deref().unwrap_or(&fallback);
                self.failure(at, host, &task, "install_failed", message);
            }
            EventKind::TaskFailed {
                host,
                error,
                stderr,
                ignored,
            } => {
                if *ignored {
                    return;
                }
                let message = error.as_deref().unwrap_or("Task failed");
                self.timeline.push(TimelineEntry {
                    at,
                    marker: Marker::Fail,
                    target: host.clone(),
                    message: format!(
                        "{}: {}",
                        truncate_chars(&task, TABLE_ERROR_CHARS),
                        truncate_chars(message, TABLE_ERROR_CHARS)
                    ),
                });
                self.errors.push(JournalError {
                    at,
                    target: host.clone(),
                    task,
                    kind: "task_failed",
                    message: message.to_owned(),
                    stderr: stderr.clone().filter(|stderr| !stderr.trim().is_empty()),
                });
            }
            EventKind::HostUnreachable { host, error } => {
                self.note(at, Marker::Fail, host, "Host unreachable");
                self.errors.push(JournalError {
                    at,
                    target: host.clone(),
                    task,
                    kind: "unreachable",
                    message: error
                        .clone()
                        .unwrap_or_else(|| "SSH connection failed".to_owned()),
                    stderr: None,
                });
            }
            EventKind::Recap { host, counters } => {
                if counters.is_clean() {
                    self.note(
                        at,
                        Marker::Ok,
                        host,
                        format!("Recap: ok={}, failures=0", counters.ok),
                    );
                } else {
                    self.note(
                        at,
                        Marker::Fail,
                        host,
                        format!(
                            "Recap: {} failures, {} unreachable",
                            counters.failures, counters.unreachable
                        ),
                    );
                }
            }
            EventKind::Retry {
                host,
                target,
                remaining,
            } => {
                let subject = target.as_deref().unwrap_or(host);
                self.note(
                    at,
                    Marker::Info,
                    subject,
                    format!("retrying {task} ({remaining} retries left)"),
                );
            }
            EventKind::ResourceDeleted { resource, name } => {
                self.note(at, Marker::Ok, name, format!("{} deleted", resource.label()));
            }
            EventKind::ResourceFailed {
                resource,
                name,
                error,
                ignored,
            } => {
                if *ignored {
                    return;
                }
                let message = error
                    .clone()
                    .unwrap_or_else(|| format!("{} delete failed", resource.label()));
                self.failure(at, name, &task, "resource_failed", &message);
            }
            _ => {}
        }
    }

    fn failure(
        &mut self,
        at: UnixTime,
        target: &str,
        task: &str,
        kind: &'static str,
        message: &str,
    ) {
        self.note(
            at,
            Marker::Fail,
            target,
            truncate_chars(message, TIMELINE_ERROR_CHARS),
        );
        self.errors.push(JournalError {
            at,
            target: target.to_owned(),
            task: task.to_owned(),
            kind,
            message: message.to_owned(),
            stderr: None,
        });
    }

    /// Writes the timeline, error details and final summary, and returns the
    /// journal path.
    pub fn finish(
        mut self,
        fleet: &Fleet,
        resources: &ResourceTracker,
        ended_at: UnixTime,
    ) -> io::Result<PathBuf> {
        let mut out = String::new();
        self.write_timeline(&mut out);
        self.write_errors(&mut out);
        write_summary(&mut out, fleet, resources, ended_at - self.started_at);
        self.file.write_all(out.as_bytes())?;
        self.file.flush()?;
        Ok(self.path)
    }

    fn write_timeline(&mut self, out: &mut String) {
        if self.timeline.is_empty() {
            return;
        }
        self.timeline
            .sort_by(|a, b| a.at.partial_cmp(&b.at).unwrap_or(std::cmp::Ordering::Equal));
        out.push_str("## Timeline\n\n");
        let mut current_date = String::new();
        for entry in &self.timeline {
            let at = local_time(entry.at);
            let date = at.format("%Y-%m-%d").to_string();
            if date != current_date {
                out.push_str(&format!("### {date}\n\n"));
                current_date = date;
            }
            out.push_str(&format!(
                "- `{}` {} **{}**: {}\n",
                at.format("%H:%M:%S"),
                entry.marker.text(),
                entry.target,
                entry.message
            ));
        }
        out.push('\n');
    }

    fn write_errors(&self, out: &mut String) {
        if self.errors.is_empty() {
            return;
        }
        out.push_str("## Errors\n\n");
        for (index, error) in self.errors.iter().enumerate() {
            out.push_str(&format!(
                "### Error {}: {} at {}\n\n",
                index + 1,
                error.target,
                local_time(error.at).format("%H:%M:%S")
            ));
            out.push_str(&format!("**Task**: {}\n\n", error.task));
            out.push_str(&format!("**Type**: {}\n\n", error.kind));
            out.push_str(&format!("**Error Message**:\n```\n{}\n```\n\n", error.message));
            if let Some(stderr) = &error.stderr {
                out.push_str(&format!(
                    "**Stderr**:\n```\n{}\n```\n\n",
                    stderr.chars().take(STDERR_CHARS).collect::<String>()
                ));
            }
            if let Some(fix) = suggested_fix(error) {
                out.push_str(&format!("**Suggested Fix**: {fix}\n\n"));
            }
            out.push_str("---\n\n");
        }
    }
}

/// Overall outcome line of the final summary.
pub fn session_status(fleet: &Fleet) -> &'static str {
    let counts = fleet.counts();
    if counts.failed > 0 {
        "COMPLETED WITH ERRORS"
    } else if counts.completed == counts.total {
        "SUCCESS"
    } else if fleet
        .iter()
        .all(|vm| vm.status.rank() >= VmStatus::Provisioned.rank())
    {
        "PROVISIONED (Install pending)"
    } else {
        "INCOMPLETE"
    }
}

/// Picks a remediation hint by keyword.
pub fn suggested_fix(error: &JournalError) -> Option<&'static str> {
    let message = error.message.to_ascii_lowercase();
    let task = error.task.to_ascii_lowercase();
    if error.kind == "unreachable" {
        return Some("Check that the VM is running and SSH is reachable. Verify security groups allow port 22.");
    }
    if message.contains("timeout") || message.contains("timed out") {
        return Some("Increase the timeout or check for resource constraints on the cloud.");
    }
    if message.contains("quota") || message.contains("exceeded") {
        return Some("Check cloud quota limits. Reduce the deployment size or request a quota increase.");
    }
    if message.contains("no valid host") {
        return Some("The cloud cannot schedule the VM. Check compute capacity and flavor availability.");
    }
    if task.contains("stage 1") || message.starts_with("stage 1") {
        return Some("Stage 1 (system deps and drivers) failed. Check /var/log/cloud-init-output.log on the VM.");
    }
    if task.contains("stage 2") || message.starts_with("stage 2") {
        return Some("Stage 2 (agent install) failed. Check the install script logs on the VM.");
    }
    if message.contains("nvidia") || message.contains("cuda") {
        return Some("GPU driver install failed. Verify the flavor has a GPU and the driver version matches.");
    }
    if message.contains("apt") || message.contains("package") {
        return Some("Package install failed. Check network access and the apt cache.");
    }
    if message.contains("git") || message.contains("clone") {
        return Some("Git clone failed. Check network access to the repository host.");
    }
    None
}

fn write_summary(out: &mut String, fleet: &Fleet, resources: &ResourceTracker, elapsed: f64) {
    let counts = fleet.counts();
    let elapsed = elapsed.max(0.0) as u64;
    out.push_str("## Final Summary\n\n");
    out.push_str(&format!("- **Status**: {}\n", session_status(fleet)));
    out.push_str(&format!(
        "- **Total Time**: {:02}:{:02}:{:02}\n",
        elapsed / 3600,
        (elapsed % 3600) / 60,
        elapsed % 60
    ));
    out.push_str(&format!(
        "- **VMs**: {}/{} completed, {} failed\n\n",
        counts.completed, counts.total, counts.failed
    ));

    if !fleet.is_empty() {
        out.push_str("| VM Name | Behavior | Status | Provision | Install | Error |\n");
        out.push_str("|---------|----------|--------|-----------|---------|-------|\n");
        for vm in fleet.sorted() {
            let status = match vm.status {
                VmStatus::Completed => "[OK]".to_owned(),
                VmStatus::Failed => "[FAIL]".to_owned(),
                other => format!("[{}]", other.label().to_ascii_uppercase()),
            };
            let error = vm
                .error
                .as_deref()
                .map(|error| {
                    error
                        .chars()
                        .take(TABLE_ERROR_CHARS)
                        .collect::<String>()
                        .replace('|', "\\|")
                })
                .unwrap_or_default();
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} |\n",
                vm.name,
                vm.behavior,
                status,
                duration(vm.provision_start, vm.provision_end),
                duration(vm.install_start, vm.install_end),
                error
            ));
        }
        out.push('\n');
    }

    if !resources.is_empty() {
        let servers = resources.counts(Some(ResourceKind::Server));
        let volumes = resources.counts(Some(ResourceKind::Volume));
        out.push_str("### Teardown Resources\n\n");
        out.push_str(&format!(
            "- **Servers**: {}/{} deleted\n",
            servers.deleted, servers.total
        ));
        out.push_str(&format!(
            "- **Volumes**: {}/{} deleted\n",
            volumes.deleted, volumes.total
        ));
        if servers.failed > 0 || volumes.failed > 0 {
            out.push_str(&format!(
                "- **Failed**: {} servers, {} volumes\n",
                servers.failed, volumes.failed
            ));
        }
        out.push('\n');
    }
}

fn duration(start: Option<UnixTime>, end: Option<UnixTime>) -> String {
    match (start, end) {
        (Some(start), Some(end)) => format_seconds(end - start),
        _ => "-".to_owned(),
    }
}

fn local_time(ts: UnixTime) -> DateTime<Local> {
    let millis = (ts * 1000.0).round() as i64;
    DateTime::from_timestamp_millis(millis)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now)
}

#[cfg(test)]
#[path = "tests/session_log_tests.rs"]
mod tests;
