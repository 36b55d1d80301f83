use crate::events::UnixTime;

use super::{FleetRules, Vm, VmStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Provision,
    Ssh,
    Prep,
    Drivers,
    Reboot,
    Agent,
    Feedback,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::Provision,
        Step::Ssh,
        Step::Prep,
        Step::Drivers,
        Step::Reboot,
        Step::Agent,
        Step::Feedback,
    ];

    /// Steps that weigh into install progress.
    pub const INSTALL: [Step; 5] = [
        Step::Ssh,
        Step::Prep,
        Step::Drivers,
        Step::Reboot,
        Step::Agent,
    ];

    pub fn header(self) -> &'static str {
        match self {
            Step::Provision => "Prov",
            Step::Ssh => "SSH",
            Step::Prep => "Prep",
            Step::Drivers => "Drv",
            Step::Reboot => "Rbt",
            Step::Agent => "Agent",
            Step::Feedback => "Fb",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepMark {
    #[default]
    NotStarted,
    InProgress,
    Done,
    Skipped,
    Failed,
}

impl StepMark {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepMark::Done | StepMark::Skipped | StepMark::Failed)
    }

    fn completes(self) -> bool {
        matches!(self, StepMark::Done | StepMark::Skipped)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepMarks([StepMark; 7]);

impl StepMarks {
    pub fn get(&self, step: Step) -> StepMark {
        self.0[step.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Step, StepMark)> + '_ {
        Step::ALL.iter().map(|step| (*step, self.get(*step)))
    }

    pub fn all_terminal(&self) -> bool {
        self.0.iter().all(|mark| mark.is_terminal())
    }

    fn set(&mut self, step: Step, mark: StepMark) {
        self.0[step.index()] = mark;
    }

    fn done_through(&mut self, last: Step) {
        for step in Step::ALL.iter().take(last.index() + 1) {
            self.set(*step, StepMark::Done);
        }
    }
}

/// Maps a VM's status to its seven step markers.
pub fn step_markers(vm: &Vm, rules: &FleetRules) -> StepMarks {
    step_markers_while(vm, rules, false)
}

/// Like [`step_markers`], but while `feedback_pending` a completed VM that
/// has not had feedback yet shows the step as not started.
pub fn step_markers_while(vm: &Vm, rules: &FleetRules, feedback_pending: bool) -> StepMarks {
    let mut marks = StepMarks::default();
    let reboot_passed = if vm.rebooted {
        StepMark::Done
    } else {
        StepMark::Skipped
    };
    match vm.status {
        VmStatus::Pending => {}
        VmStatus::Creating => marks.set(Step::Provision, StepMark::InProgress),
        VmStatus::Provisioned => marks.done_through(Step::Provision),
        VmStatus::Installing => {
            marks.done_through(Step::Provision);
            marks.set(Step::Ssh, StepMark::InProgress);
        }
        VmStatus::Preparing => {
            marks.done_through(Step::Ssh);
            marks.set(Step::Prep, StepMark::InProgress);
        }
        VmStatus::Stage1 => {
            marks.done_through(Step::Prep);
            marks.set(Step::Drivers, StepMark::InProgress);
        }
        VmStatus::Rebooting => {
            marks.done_through(Step::Drivers);
            marks.set(Step::Reboot, StepMark::InProgress);
        }
        VmStatus::Stage2 => {
            marks.done_through(Step::Drivers);
            marks.set(Step::Reboot, reboot_passed);
            marks.set(Step::Agent, StepMark::InProgress);
        }
        VmStatus::Feedback => {
            marks.done_through(Step::Agent);
            marks.set(Step::Reboot, reboot_passed);
            marks.set(Step::Feedback, StepMark::InProgress);
        }
        VmStatus::Completed => {
            marks.done_through(Step::Feedback);
            marks.set(Step::Reboot, reboot_passed);
            if !vm.feedback_seen {
                let mark = if feedback_pending {
                    StepMark::NotStarted
                } else {
                    StepMark::Skipped
                };
                marks.set(Step::Feedback, mark);
            }
        }
        VmStatus::Failed => {
            mark_failure(vm, reboot_passed, &mut marks);
            // Nothing after the failing step will run.
            for step in Step::ALL {
                if marks.get(step) == StepMark::NotStarted {
                    marks.set(step, StepMark::Skipped);
                }
            }
        }
    }

    if rules.is_control(&vm.behavior) {
        marks.set(Step::Feedback, StepMark::Skipped);
    }
    if rules.is_bare(&vm.behavior) {
        for step in Step::INSTALL {
            marks.set(step, StepMark::Skipped);
        }
        if vm.status == VmStatus::Failed && marks.get(Step::Provision) != StepMark::Failed {
            marks.set(Step::Provision, StepMark::Done);
        }
    }
    marks
}

/// Places the failed marker from the timestamps the VM reached and the
/// wording of its error.
fn mark_failure(vm: &Vm, reboot_passed: StepMark, marks: &mut StepMarks) {
    if vm.provision_end.is_none() && vm.install_start.is_none() {
        marks.set(Step::Provision, StepMark::Failed);
        return;
    }
    if vm.install_start.is_none() {
        marks.done_through(Step::Provision);
        marks.set(Step::Ssh, StepMark::Failed);
        return;
    }
    let error = vm.error.as_deref().unwrap_or_default().to_ascii_lowercase();
    if error.contains("stage 2") || error.contains("stage2") {
        marks.done_through(Step::Drivers);
        marks.set(Step::Reboot, reboot_passed);
        marks.set(Step::Agent, StepMark::Failed);
    } else if error.contains("reboot") {
        marks.done_through(Step::Drivers);
        marks.set(Step::Reboot, StepMark::Failed);
    } else {
        marks.done_through(Step::Prep);
        marks.set(Step::Drivers, StepMark::Failed);
    }
}

/// Share of the five install sub-steps this VM has finished, in `0..=1`.
pub fn install_fraction(vm: &Vm, marks: &StepMarks, rules: &FleetRules) -> f64 {
    if vm.status.is_terminal() || rules.is_bare(&vm.behavior) {
        return 1.0;
    }
    let finished = Step::INSTALL
        .iter()
        .filter(|step| marks.get(**step).completes())
        .count();
    finished as f64 / Step::INSTALL.len() as f64
}

/// Stores `now` as the freeze timestamp the first time every marker is
/// terminal. Later calls never move it.
pub fn observe_freeze(vm: &mut Vm, marks: &StepMarks, now: UnixTime) -> bool {
    if vm.frozen_at.is_some() || !marks.all_terminal() {
        return false;
    }
    vm.frozen_at = Some(now);
    true
}

#[cfg(test)]
#[path = "../tests/steps_tests.rs"]
mod tests;
