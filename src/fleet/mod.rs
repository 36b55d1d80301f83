pub mod order;
pub mod steps;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;

use crate::events::{Event, EventKind, RecapCounters, UnixTime};

pub use order::{behavior_from_name, sort_key, SortKey};
pub use steps::{step_markers, step_markers_while, Step, StepMark, StepMarks};

pub const MAX_ERROR_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmStatus {
    Pending,
    Creating,
    Provisioned,
    Installing,
    Preparing,
    Stage1,
    Rebooting,
    Stage2,
    Feedback,
    Completed,
    Failed,
}

impl VmStatus {
    /// Position in the forward phase ordering. A reboot is a sub-step of
    /// stage 1, so both share a rank.
    pub fn rank(self) -> u8 {
        match self {
            VmStatus::Pending => 0,
            VmStatus::Creating => 1,
            VmStatus::Provisioned => 2,
            VmStatus::Installing => 3,
            VmStatus::Preparing => 4,
            VmStatus::Stage1 | VmStatus::Rebooting => 5,
            VmStatus::Stage2 => 6,
            VmStatus::Feedback => 7,
            VmStatus::Completed => 8,
            VmStatus::Failed => 9,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, VmStatus::Completed | VmStatus::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            VmStatus::Pending => "pending",
            VmStatus::Creating => "creating",
            VmStatus::Provisioned => "provisioned",
            VmStatus::Installing => "installing",
            VmStatus::Preparing => "preparing",
            VmStatus::Stage1 => "stage1",
            VmStatus::Rebooting => "rebooting",
            VmStatus::Stage2 => "stage2",
            VmStatus::Feedback => "feedback",
            VmStatus::Completed => "completed",
            VmStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Provisioning,
    Installing,
    Teardown,
}

impl Phase {
    /// Classifies a playbook by name; `None` leaves the current phase alone.
    pub fn from_playbook(playbook: &str) -> Option<Self> {
        let lowered = playbook.to_ascii_lowercase();
        if lowered.contains("teardown") {
            Some(Phase::Teardown)
        } else if lowered.contains("install") {
            Some(Phase::Installing)
        } else if lowered.contains("provision") {
            Some(Phase::Provisioning)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Provisioning => "Provisioning",
            Phase::Installing => "Installing",
            Phase::Teardown => "Teardown",
        }
    }
}

/// One entry of the session's initial entity list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VmSeed {
    pub name: String,
    #[serde(default)]
    pub behavior: String,
    #[serde(default)]
    pub flavor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vm {
    pub name: String,
    pub behavior: String,
    pub flavor: String,
    pub hw_label: String,
    pub ip: Option<String>,
    pub error: Option<String>,
    pub status: VmStatus,
    pub provision_start: Option<UnixTime>,
    pub provision_end: Option<UnixTime>,
    pub install_start: Option<UnixTime>,
    pub install_end: Option<UnixTime>,
    pub frozen_at: Option<UnixTime>,
    pub rebooted: bool,
    pub feedback_seen: bool,
}

impl Vm {
    pub fn new(seed: VmSeed, hw_label: String) -> Self {
        Self {
            name: seed.name,
            behavior: seed.behavior,
            flavor: seed.flavor,
            hw_label,
            ip: None,
            error: None,
            status: VmStatus::Pending,
            provision_start: None,
            provision_end: None,
            install_start: None,
            install_end: None,
            frozen_at: None,
            rebooted: false,
            feedback_seen: false,
        }
    }

    pub fn started_at(&self) -> Option<UnixTime> {
        self.provision_start.or(self.install_start)
    }

    /// Seconds since this VM started, stopping at the freeze timestamp.
    pub fn elapsed(&self, now: UnixTime) -> Option<f64> {
        let start = self.started_at()?;
        let end = self.frozen_at.unwrap_or(now);
        Some((end - start).max(0.0))
    }

    pub fn sort_key(&self) -> SortKey {
        sort_key(&self.name, &self.behavior)
    }

    fn advance(&mut self, allowed_from: &[VmStatus], to: VmStatus) -> bool {
        if !allowed_from.contains(&self.status) {
            return false;
        }
        tracing::debug!(vm = %self.name, from = self.status.label(), to = to.label(), "vm transition");
        self.status = to;
        true
    }

    fn fail(&mut self, message: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        tracing::debug!(vm = %self.name, from = self.status.label(), error = message, "vm failed");
        self.status = VmStatus::Failed;
        self.error = Some(truncate_chars(message, MAX_ERROR_CHARS));
        true
    }
}

/// Behavior tags that change how a VM moves through install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetRules {
    /// Never enter feedback.
    pub control_tags: Vec<String>,
    /// Control configurations whose install steps are all no-ops.
    pub bare_tags: Vec<String>,
    /// Name prefixes that identify managed VMs.
    pub entity_prefixes: Vec<String>,
}

impl Default for FleetRules {
    fn default() -> Self {
        Self {
            control_tags: vec!["C0".to_owned(), "M0".to_owned()],
            bare_tags: vec!["C0".to_owned()],
            entity_prefixes: vec!["sup-".to_owned()],
        }
    }
}

impl FleetRules {
    pub fn is_control(&self, behavior: &str) -> bool {
        self.control_tags.iter().any(|tag| tag == behavior) || self.is_bare(behavior)
    }

    pub fn is_bare(&self, behavior: &str) -> bool {
        self.bare_tags.iter().any(|tag| tag == behavior)
    }

    /// Matches an entity name anywhere in a line of text.
    pub fn entity_regex(&self) -> Result<Regex, regex::Error> {
        let prefixes = self
            .entity_prefixes
            .iter()
            .map(|prefix| regex::escape(prefix))
            .collect::<Vec<String>>()
            .join("|");
        Regex::new(&format!(r"(?:{prefixes})[A-Za-z0-9][A-Za-z0-9._-]*"))
    }

    pub fn looks_like_entity(&self, token: &str) -> bool {
        self.entity_prefixes
            .iter()
            .any(|prefix| token.starts_with(prefix.as_str()) && token.len() > prefix.len())
    }
}

const BUILTIN_FLAVOR_LABELS: [(&str, &str); 4] = [
    ("v100-1gpu.14vcpu.28g", "V100"),
    ("rtx2080ti-A-1gpu.14vcpu.28g", "RTX-A"),
    ("rtx2080ti-1gpu.14vcpu.28g", "RTX"),
    ("v1.14vcpu.28g", "CPU"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlavorLabels {
    overrides: IndexMap<String, String>,
}

impl FlavorLabels {
    pub fn new(overrides: IndexMap<String, String>) -> Self {
        Self { overrides }
    }

    pub fn label(&self, flavor: &str) -> String {
        if let Some(label) = self.overrides.get(flavor) {
            return label.clone();
        }
        BUILTIN_FLAVOR_LABELS
            .iter()
            .find(|(known, _)| *known == flavor)
            .map(|(_, label)| (*label).to_owned())
            .unwrap_or_else(|| flavor.chars().take(6).collect())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetCounts {
    pub total: usize,
    pub pending: usize,
    pub creating: usize,
    pub provisioned: usize,
    pub installing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl FleetCounts {
    pub fn active(&self) -> usize {
        self.total - self.completed - self.failed
    }
}

/// The VM registry: one entry per managed VM, in seed order.
#[derive(Debug, Clone, Default)]
pub struct Fleet {
    vms: IndexMap<String, Vm>,
    phase: Phase,
    /// An install playbook has started and not yet ended.
    install_running: bool,
    rules: FleetRules,
    flavors: FlavorLabels,
}

impl Fleet {
    pub fn new(rules: FleetRules, flavors: FlavorLabels) -> Self {
        Self {
            vms: IndexMap::new(),
            phase: Phase::Idle,
            install_running: false,
            rules,
            flavors,
        }
    }

    /// Seeds the registry. A name seen twice keeps its first entry.
    pub fn seed<I>(&mut self, seeds: I)
    where
        I: IntoIterator<Item = VmSeed>,
    {
        for seed in seeds {
            if self.vms.contains_key(&seed.name) {
                continue;
            }
            let hw_label = self.flavors.label(&seed.flavor);
            self.vms.insert(seed.name.clone(), Vm::new(seed, hw_label));
        }
    }

    pub fn rules(&self) -> &FleetRules {
        &self.rules
    }

    /// Step markers for `vm`, holding feedback open while install runs.
    pub fn markers(&self, vm: &Vm) -> StepMarks {
        step_markers_while(vm, &self.rules, self.install_running)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Vm> {
        self.vms.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Vm> {
        self.vms.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vm> {
        self.vms.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Vm> {
        self.vms.values_mut()
    }

    /// VMs in display order.
    pub fn sorted(&self) -> Vec<&Vm> {
        let mut sorted = self.vms.values().collect::<Vec<&Vm>>();
        sorted.sort_by_cached_key(|vm| vm.sort_key());
        sorted
    }

    pub fn counts(&self) -> FleetCounts {
        let mut counts = FleetCounts {
            total: self.vms.len(),
            ..FleetCounts::default()
        };
        for vm in self.vms.values() {
            match vm.status {
                VmStatus::Pending => counts.pending += 1,
                VmStatus::Creating => counts.creating += 1,
                VmStatus::Provisioned => counts.provisioned += 1,
                VmStatus::Completed => counts.completed += 1,
                VmStatus::Failed => counts.failed += 1,
                _ => counts.installing += 1,
            }
        }
        counts
    }

    /// Applies one decoded event. Returns whether any VM or the phase
    /// changed. Events naming unknown VMs are ignored.
    pub fn apply(&mut self, event: &Event, now: UnixTime) -> bool {
        let ts = event.unix_ts.unwrap_or(now);
        match &event.kind {
            EventKind::PlaybookStart { playbook } => self.start_playbook(playbook, ts),
            EventKind::VmCreating { vm } => self.with_vm(vm, |vm| {
                let moved = vm.advance(&[VmStatus::Pending], VmStatus::Creating);
                if moved || vm.status == VmStatus::Creating {
                    set_once(&mut vm.provision_start, ts) || moved
                } else {
                    false
                }
            }),
            EventKind::VmProvisioned { vm } => self.with_vm(vm, |vm| {
                let moved = vm.advance(
                    &[VmStatus::Pending, VmStatus::Creating],
                    VmStatus::Provisioned,
                );
                if moved {
                    vm.provision_end = Some(ts);
                }
                moved
            }),
            EventKind::VmIp { vm, ip } => {
                let ip = ip.trim();
                if ip.is_empty() || matches!(ip, "false" | "null" | "None" | "none") {
                    return false;
                }
                self.with_vm(vm, |vm| {
                    if vm.ip.as_deref() == Some(ip) {
                        return false;
                    }
                    vm.ip = Some(ip.to_owned());
                    true
                })
            }
            EventKind::VmFailed { vm, error } => self.with_vm(vm, |vm| {
                vm.fail(error.as_deref().unwrap_or("VM creation failed"))
            }),
            EventKind::InstallPreparing { host } => self.advance_hosts(
                host.as_deref(),
                &[VmStatus::Installing],
                VmStatus::Preparing,
            ),
            EventKind::InstallStage1 { host } => self.advance_hosts(
                host.as_deref(),
                &[VmStatus::Installing, VmStatus::Preparing],
                VmStatus::Stage1,
            ),
            EventKind::InstallStage2 { host } => self.advance_hosts(
                host.as_deref(),
                &[
                    VmStatus::Stage1,
                    VmStatus::Rebooting,
                    VmStatus::Installing,
                    VmStatus::Preparing,
                ],
                VmStatus::Stage2,
            ),
            EventKind::InstallComplete { host } => self.with_vm(host, |vm| {
                if vm.status.is_terminal() {
                    return false;
                }
                vm.status = VmStatus::Completed;
                vm.install_end = Some(ts);
                true
            }),
            EventKind::InstallFeedback { host } => self.enter_feedback(host.as_deref()),
            EventKind::RebootStart { host } => {
                let changed = self.advance_hosts(
                    host.as_deref(),
                    &[VmStatus::Stage1],
                    VmStatus::Rebooting,
                );
                for vm in self.vms.values_mut() {
                    if vm.status == VmStatus::Rebooting {
                        vm.rebooted = true;
                    }
                }
                changed
            }
            EventKind::RebootComplete { host } => self.with_vm(host, |vm| {
                vm.advance(&[VmStatus::Rebooting], VmStatus::Stage1)
            }),
            EventKind::InstallFailed { host, stage, error } => {
                let text = error.as_deref().unwrap_or("Install failed");
                let message = format!("Stage {}: {text}", stage.as_deref().unwrap_or("?"));
                self.with_vm(host, |vm| vm.fail(&message))
            }
            EventKind::TaskFailed {
                host,
                error,
                ignored,
                ..
            } => {
                if *ignored {
                    return false;
                }
                self.with_vm(host, |vm| vm.fail(error.as_deref().unwrap_or("Task failed")))
            }
            EventKind::HostUnreachable { host, error } => {
                let message = format!(
                    "Unreachable: {}",
                    error.as_deref().unwrap_or("SSH failed")
                );
                self.with_vm(host, |vm| vm.fail(&message))
            }
            EventKind::Recap { host, counters } => self.apply_recap(host, counters, ts),
            EventKind::DiscoveryServers { servers } => {
                let mut changed = false;
                for server in servers {
                    changed |= self.discover(&server.name);
                }
                changed
            }
            EventKind::PlaybookEnd { playbook, .. } => {
                let ends_install = Phase::from_playbook(playbook) == Some(Phase::Installing);
                if ends_install && self.install_running {
                    self.install_running = false;
                    return true;
                }
                false
            }
            EventKind::Retry { .. }
            | EventKind::DiscoveryVolumes { .. }
            | EventKind::ResourceDeleted { .. }
            | EventKind::ResourceFailed { .. }
            | EventKind::Unknown { .. } => false,
        }
    }

    fn start_playbook(&mut self, playbook: &str, ts: UnixTime) -> bool {
        let Some(phase) = Phase::from_playbook(playbook) else {
            return false;
        };
        let mut changed = self.phase != phase;
        self.phase = phase;
        self.install_running = phase == Phase::Installing;
        match phase {
            Phase::Provisioning => {
                for vm in self.vms.values_mut().filter(|vm| !vm.status.is_terminal()) {
                    changed |= vm.advance(&[VmStatus::Pending], VmStatus::Creating);
                    changed |= set_once(&mut vm.provision_start, ts);
                }
            }
            Phase::Installing => {
                for vm in self.vms.values_mut() {
                    if vm.advance(
                        &[VmStatus::Pending, VmStatus::Provisioned],
                        VmStatus::Installing,
                    ) {
                        set_once(&mut vm.install_start, ts);
                        changed = true;
                    }
                }
            }
            Phase::Teardown | Phase::Idle => {}
        }
        changed
    }

    fn enter_feedback(&mut self, host: Option<&str>) -> bool {
        let rules = &self.rules;
        let mut changed = false;
        for vm in self.vms.values_mut() {
            if host.is_some_and(|host| host != vm.name) || rules.is_control(&vm.behavior) {
                continue;
            }
            if vm.advance(&[VmStatus::Completed], VmStatus::Feedback) {
                vm.feedback_seen = true;
                changed = true;
            }
        }
        changed
    }

    fn apply_recap(&mut self, host: &str, counters: &RecapCounters, ts: UnixTime) -> bool {
        let phase = self.phase;
        self.with_vm(host, |vm| {
            if !counters.is_clean() {
                let message = vm.error.clone().unwrap_or_else(|| {
                    format!(
                        "Recap: {} failures, {} unreachable",
                        counters.failures, counters.unreachable
                    )
                });
                return vm.fail(&message);
            }
            if vm.status.is_terminal() {
                return false;
            }
            match phase {
                Phase::Installing => {
                    vm.status = VmStatus::Completed;
                    set_once(&mut vm.install_end, ts);
                    true
                }
                Phase::Provisioning if vm.status.rank() < VmStatus::Provisioned.rank() => {
                    vm.status = VmStatus::Provisioned;
                    set_once(&mut vm.provision_end, ts);
                    true
                }
                _ => false,
            }
        })
    }

    /// Registers a VM discovered mid-session. Returns whether it was new.
    pub fn discover(&mut self, name: &str) -> bool {
        if self.vms.contains_key(name) || !self.rules.looks_like_entity(name) {
            return false;
        }
        let behavior = behavior_from_name(name).unwrap_or_default();
        tracing::debug!(vm = name, behavior = %behavior, "discovered vm");
        self.vms.insert(
            name.to_owned(),
            Vm::new(
                VmSeed {
                    name: name.to_owned(),
                    behavior,
                    flavor: String::new(),
                },
                String::new(),
            ),
        );
        true
    }

    /// Records the freeze timestamp of every VM whose markers just became
    /// terminal.
    pub fn observe_freezes(&mut self, now: UnixTime) {
        let rules = &self.rules;
        let pending = self.install_running;
        for vm in self.vms.values_mut() {
            let marks = step_markers_while(vm, rules, pending);
            steps::observe_freeze(vm, &marks, now);
        }
    }

    fn with_vm<F>(&mut self, name: &str, apply: F) -> bool
    where
        F: FnOnce(&mut Vm) -> bool,
    {
        match self.vms.get_mut(name) {
            Some(vm) => apply(vm),
            None => false,
        }
    }

    fn advance_hosts(
        &mut self,
        host: Option<&str>,
        allowed_from: &[VmStatus],
        to: VmStatus,
    ) -> bool {
        match host {
            Some(host) => self.with_vm(host, |vm| vm.advance(allowed_from, to)),
            None => {
                let mut changed = false;
                for vm in self.vms.values_mut() {
                    changed |= vm.advance(allowed_from, to);
                }
                changed
            }
        }
    }
}

fn set_once(slot: &mut Option<UnixTime>, ts: UnixTime) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(ts);
    true
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_owned();
    }
    let mut truncated = text.chars().take(max.saturating_sub(1)).collect::<String>();
    truncated.push('…');
    truncated
}

#[cfg(test)]
#[path = "../tests/fleet_tests.rs"]
mod tests;
