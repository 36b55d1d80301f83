use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fleetmon::events::ResourceKind;
use fleetmon::fleet::{FlavorLabels, Fleet, FleetRules, VmSeed, VmStatus};
use fleetmon::monitor::{
    ChildHandle, DriverOptions, DriverPhase, InputSource, Monitor, MonitorState, SessionExit, Wait,
};
use fleetmon::process_manager::{
    OrchestrationProcess, OrchestrationSpec, ProcessManagerError, Termination,
};
use fleetmon::render::{DeployView, LogTailFilter, Screen, TeardownView, ViewSettings};
use fleetmon::teardown::{LogScraper, ResourceStatus};
use ratatui::text::Line;

struct FakeChild {
    polls_left: usize,
    terminated_with: Option<Duration>,
}

impl FakeChild {
    fn exiting_after(polls: usize) -> Self {
        Self {
            polls_left: polls,
            terminated_with: None,
        }
    }
}

impl ChildHandle for FakeChild {
    fn is_running(&mut self) -> bool {
        if self.terminated_with.is_some() || self.polls_left == 0 {
            return false;
        }
        self.polls_left -= 1;
        true
    }

    fn terminate(&mut self, grace: Duration) -> Result<Termination, ProcessManagerError> {
        self.terminated_with = Some(grace);
        Ok(Termination::Graceful)
    }
}

struct RecordingScreen {
    size: (u16, u16),
    frames: Vec<Vec<String>>,
}

impl RecordingScreen {
    fn new() -> Self {
        Self {
            size: (100, 24),
            frames: Vec::new(),
        }
    }
}

impl Screen for RecordingScreen {
    fn size(&self) -> io::Result<(u16, u16)> {
        Ok(self.size)
    }

    fn draw(&mut self, frame: &[Line<'static>]) -> io::Result<()> {
        self.frames.push(
            frame
                .iter()
                .map(|line| line.spans.iter().map(|span| span.content.as_ref()).collect())
                .collect(),
        );
        Ok(())
    }
}

/// Replays scripted outcomes, then behaves like an idle keyboard.
struct ScriptedInput {
    script: VecDeque<Wait>,
}

impl ScriptedInput {
    fn idle() -> Self {
        Self {
            script: VecDeque::new(),
        }
    }

    fn with(script: &[Wait]) -> Self {
        Self {
            script: script.iter().copied().collect(),
        }
    }
}

impl InputSource for ScriptedInput {
    fn wait(&mut self, timeout: Duration) -> io::Result<Wait> {
        match self.script.pop_front() {
            Some(outcome) => Ok(outcome),
            None => {
                thread::sleep(timeout);
                Ok(Wait::Elapsed)
            }
        }
    }
}

fn options() -> DriverOptions {
    DriverOptions {
        poll_interval: Duration::from_millis(10),
        stream_wait: Duration::from_millis(200),
        shutdown_grace: Duration::from_millis(150),
    }
}

fn state() -> MonitorState {
    let mut fleet = Fleet::new(FleetRules::default(), FlavorLabels::default());
    fleet.seed([
        VmSeed {
            name: "sup-M1-0".to_owned(),
            behavior: "M1".to_owned(),
            flavor: "v1.14vcpu.28g".to_owned(),
        },
        VmSeed {
            name: "sup-B2-0".to_owned(),
            behavior: "B2".to_owned(),
            flavor: "v100-1gpu.14vcpu.28g".to_owned(),
        },
    ]);
    MonitorState::new(fleet, 0.0)
}

fn deploy_view() -> DeployView {
    DeployView::new(ViewSettings::default(), tail_filter())
}

fn tail_filter() -> LogTailFilter {
    LogTailFilter::new(&FleetRules::default(), vec!["localhost".to_owned()]).expect("filter")
}

#[test]
fn normal_exit_runs_a_final_poll_and_applies_a_trailing_partial_line() {
    let root = temp_workspace("normal-exit");
    let events = root.join("events.jsonl");
    fs::write(
        &events,
        concat!(
            r#"{"type":"playbook_start","data":{"playbook":"provision.yml"}}"#,
            "\n",
            "not json at all\n",
            r#"{"type":"vm_creating","data":{"vm_name":"sup-M1-0"}}"#,
            "\n",
            r#"{"type":"vm_provisioned","data":{"vm_name":"sup-M1-0"}}"#,
        ),
    )
    .expect("write events");

    let mut monitor = Monitor::new(state(), &events, None, options());
    let mut child = FakeChild::exiting_after(2);
    let mut screen = RecordingScreen::new();
    let exit = monitor
        .run(
            &mut child,
            &mut screen,
            &mut ScriptedInput::idle(),
            &mut deploy_view(),
        )
        .expect("run");

    assert_eq!(exit, SessionExit::Normal);
    assert_eq!(monitor.phase(), DriverPhase::Finished);
    assert!(child.terminated_with.is_none());
    let fleet = &monitor.state().fleet;
    assert_eq!(
        fleet.get("sup-M1-0").expect("vm").status,
        VmStatus::Provisioned
    );
    assert_eq!(fleet.get("sup-B2-0").expect("vm").status, VmStatus::Pending);

    assert!(screen.frames.len() >= 3);
    assert!(screen.frames.iter().all(|frame| frame.len() == 24));
    let last = screen.frames.last().expect("frame");
    assert!(last[0].contains("Provisioning"));
}

#[test]
fn cancel_key_terminates_the_child_without_another_frame() {
    let root = temp_workspace("cancel");
    let events = root.join("events.jsonl");
    fs::write(&events, "").expect("write events");

    let mut monitor = Monitor::new(state(), &events, None, options());
    let mut child = FakeChild::exiting_after(usize::MAX);
    let mut screen = RecordingScreen::new();
    let exit = monitor
        .run(
            &mut child,
            &mut screen,
            &mut ScriptedInput::with(&[Wait::Other, Wait::Cancel]),
            &mut deploy_view(),
        )
        .expect("run");

    assert_eq!(exit, SessionExit::Cancelled);
    assert_eq!(child.terminated_with, Some(Duration::from_millis(150)));
    assert_eq!(screen.frames.len(), 1);
}

#[test]
fn missing_event_stream_does_not_hang_the_loop() {
    let root = temp_workspace("missing-stream");
    let mut monitor = Monitor::new(state(), root.join("never.jsonl"), None, options());
    let mut child = FakeChild::exiting_after(3);
    let mut screen = RecordingScreen::new();
    let exit = monitor
        .run(
            &mut child,
            &mut screen,
            &mut ScriptedInput::idle(),
            &mut deploy_view(),
        )
        .expect("run");

    assert_eq!(exit, SessionExit::Normal);
    assert!(!screen.frames.is_empty());
    assert_eq!(monitor.state().fleet.counts().pending, 2);
}

#[test]
fn teardown_falls_back_to_the_raw_log_without_discovery() {
    let root = temp_workspace("teardown-scrape");
    let events = root.join("events.jsonl");
    let raw = root.join("raw.log");
    fs::write(&events, "").expect("write events");
    fs::write(
        &raw,
        "TASK [Delete servers] *****\nchanged: [localhost] => (item=sup-S1-0)\nTASK [Delete volumes] *****\n",
    )
    .expect("write raw log");

    let state = MonitorState::new(Fleet::default(), 0.0)
        .with_scraper(LogScraper::new(&FleetRules::default()).expect("scraper"));
    let mut monitor = Monitor::new(state, &events, Some(raw.clone()), options());
    let mut view = TeardownView::new(ViewSettings::default(), tail_filter());
    let mut screen = RecordingScreen::new();
    monitor
        .run(
            &mut FakeChild::exiting_after(1),
            &mut screen,
            &mut ScriptedInput::idle(),
            &mut view,
        )
        .expect("run");

    let server = monitor
        .state()
        .resources
        .find(ResourceKind::Server, "sup-S1-0")
        .expect("scraped server");
    assert_eq!(server.status, ResourceStatus::Deleting);
    let last = screen.frames.last().expect("frame");
    assert_eq!(last[1], "▸ TASK [Delete volumes]");
    assert!(last.iter().any(|line| line.starts_with("sup-S1-0")));
}

#[test]
fn real_child_events_are_picked_up_until_it_exits() {
    let root = temp_workspace("real-child");
    let events = root.join("logs").join("events.jsonl");
    let raw = root.join("logs").join("raw.log");
    let spec = OrchestrationSpec {
        command: concat!(
            r#"printf '%s\n' '{"type":"playbook_start","data":{"playbook":"provision.yml"}}' >> "$FLEETMON_EVENT_FILE"; "#,
            "sleep 0.2; ",
            r#"printf '%s' '{"type":"vm_provisioned","data":{"vm_name":"sup-B2-0"}}' >> "$FLEETMON_EVENT_FILE""#,
        )
        .to_owned(),
        cwd: root.clone(),
        raw_log: raw.clone(),
        event_file: events.clone(),
        event_file_env: "FLEETMON_EVENT_FILE".to_owned(),
        env: Vec::new(),
    };
    let mut child = OrchestrationProcess::spawn(&spec).expect("spawn");

    let mut options = options();
    options.stream_wait = Duration::from_secs(5);
    let mut monitor = Monitor::new(state(), &events, Some(raw), options);
    let exit = monitor
        .run(
            &mut child,
            &mut RecordingScreen::new(),
            &mut ScriptedInput::idle(),
            &mut deploy_view(),
        )
        .expect("run");

    assert_eq!(exit, SessionExit::Normal);
    assert!(child.success());
    let fleet = &monitor.state().fleet;
    assert_eq!(
        fleet.get("sup-B2-0").expect("vm").status,
        VmStatus::Provisioned
    );
}

fn temp_workspace(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    let root = std::env::temp_dir().join(format!("fleetmon-monitor-{name}-{ts}"));
    fs::create_dir_all(&root).expect("mkdir workspace");
    root
}
