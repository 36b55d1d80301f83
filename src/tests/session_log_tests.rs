use std::time::{SystemTime, UNIX_EPOCH};

use chrono::TimeZone;

use super::*;
use crate::events::decode_line;
use crate::fleet::{FlavorLabels, FleetRules, VmSeed};

const STARTED: i64 = 1_760_000_000;

fn started() -> DateTime<Local> {
    Local.timestamp_opt(STARTED, 0).single().expect("local time")
}

fn temp_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    std::env::temp_dir().join(format!("fleetmon-journal-{name}-{ts}"))
}

fn fleet() -> Fleet {
    let mut fleet = Fleet::new(FleetRules::default(), FlavorLabels::default());
    fleet.seed(["sup-M1-0:M1", "sup-B2-0:B2"].iter().map(|entry| {
        let (name, behavior) = entry.split_once(':').expect("seed");
        VmSeed {
            name: name.to_owned(),
            behavior: behavior.to_owned(),
            flavor: "v100-1gpu.14vcpu.28g".to_owned(),
        }
    }));
    fleet
}

fn feed(journal: &mut SessionJournal, fleet: &mut Fleet, lines: &[&str]) {
    let now = STARTED as f64 + 10.0;
    for line in lines {
        let event = decode_line(line).expect("decoded");
        fleet.apply(&event, now);
        journal.record(&event, fleet, now);
    }
}

#[test]
fn file_name_carries_a_sanitized_deployment_and_the_start_stamp() {
    let name = journal_file_name("exp 7/a", started());
    assert!(name.starts_with("deploy-exp_7_a-"));
    assert!(name.ends_with(&format!("{}.md", started().format("%Y%m%d-%H%M%S"))));
}

#[test]
fn journal_records_timeline_errors_and_final_summary() {
    let dir = temp_dir("full");
    let mut journal = SessionJournal::create(&dir, "exp-7", started()).expect("create");
    let mut fleet = fleet();
    feed(
        &mut journal,
        &mut fleet,
        &[
            r#"{"type":"playbook_start","data":{"playbook":"provision.yml"}}"#,
            r#"{"type":"vm_creating","data":{"vm_name":"sup-M1-0"}}"#,
            r#"{"type":"vm_ip","data":{"vm_name":"sup-M1-0","ip":"10.0.0.5"}}"#,
            r#"{"type":"vm_provisioned","data":{"vm_name":"sup-M1-0"}}"#,
            r#"{"type":"task_failed","task":"Check optional tool","data":{"host":"sup-M1-0","error":"not found","ignored":true}}"#,
            r#"{"type":"task_failed","task":"Install NVIDIA driver","data":{"host":"sup-B2-0","error":"nvidia-smi not found","stderr":"modprobe: FATAL"}}"#,
            r#"{"type":"recap","data":{"host":"sup-M1-0","ok":12,"failures":0,"unreachable":0}}"#,
        ],
    );
    assert_eq!(journal.errors().len(), 1);

    let path = journal
        .finish(&fleet, &ResourceTracker::new(), STARTED as f64 + 3725.0)
        .expect("finish");
    let text = fs::read_to_string(&path).expect("read journal");

    assert!(text.starts_with("# Deployment Log\n\n## Summary\n- **Deployment**: exp-7\n"));
    assert!(text.contains(&format!("- **Started**: {}", started().to_rfc3339())));
    assert!(text.contains("## Timeline"));
    assert!(text.contains("[INFO] **Playbook**: Started: provision.yml"));
    assert!(text.contains("[OK] **sup-M1-0**: IP assigned: 10.0.0.5"));
    assert!(text.contains("[OK] **sup-M1-0**: provisioned (IP: 10.0.0.5)"));
    assert!(text.contains("[FAIL] **sup-B2-0**: Install NVIDIA driver: nvidia-smi not found"));
    assert!(text.contains("[OK] **sup-M1-0**: Recap: ok=12, failures=0"));
    assert!(!text.contains("Check optional tool"));

    assert!(text.contains("## Errors"));
    assert!(text.contains("### Error 1: sup-B2-0 at"));
    assert!(text.contains("**Task**: Install NVIDIA driver"));
    assert!(text.contains("**Type**: task_failed"));
    assert!(text.contains("**Stderr**:\n```\nmodprobe: FATAL\n```"));
    assert!(text.contains("**Suggested Fix**: GPU driver install failed"));

    assert!(text.contains("- **Status**: COMPLETED WITH ERRORS"));
    assert!(text.contains("- **Total Time**: 01:02:05"));
    assert!(text.contains("- **VMs**: 0/2 completed, 1 failed"));
    assert!(text.contains("| sup-B2-0 | B2 | [FAIL] | - | - | nvidia-smi not found |"));
    assert!(text.contains("| sup-M1-0 | M1 | [PROVISIONED] | 0s | - |  |"));
    assert!(!text.contains("### Teardown Resources"));
}

#[test]
fn unreachable_hosts_and_teardown_resources_are_reported() {
    let dir = temp_dir("teardown");
    let mut journal = SessionJournal::create(&dir, "exp-7", started()).expect("create");
    let mut fleet = fleet();
    let mut resources = ResourceTracker::new();
    let now = STARTED as f64 + 5.0;
    for line in [
        r#"{"type":"host_unreachable","data":{"host":"sup-M1-0"}}"#,
        r#"{"type":"discovery_servers","data":{"servers":[{"id":"a1","name":"sup-M1-0"}]}}"#,
        r#"{"type":"discovery_volumes","data":{"volumes":["v-1"]}}"#,
        r#"{"type":"resource_deleted","data":{"type":"server","name":"sup-M1-0"}}"#,
    ] {
        let event = decode_line(line).expect("decoded");
        fleet.apply(&event, now);
        resources.apply(&event, now);
        journal.record(&event, &fleet, now);
    }

    let error = journal.errors().first().expect("error").clone();
    assert_eq!(error.kind, "unreachable");
    assert_eq!(error.message, "SSH connection failed");
    assert!(suggested_fix(&error).expect("fix").contains("SSH"));

    let path = journal.finish(&fleet, &resources, now).expect("finish");
    let text = fs::read_to_string(path).expect("read journal");
    assert!(text.contains("[FAIL] **sup-M1-0**: Host unreachable"));
    assert!(text.contains("[OK] **sup-M1-0**: server deleted"));
    assert!(text.contains("### Teardown Resources"));
    assert!(text.contains("- **Servers**: 1/1 deleted"));
    assert!(text.contains("- **Volumes**: 0/1 deleted"));
}

#[test]
fn absurd_producer_timestamps_still_produce_a_journal() {
    let dir = temp_dir("huge-ts");
    let mut journal = SessionJournal::create(&dir, "exp-7", started()).expect("create");
    let mut fleet = fleet();
    feed(
        &mut journal,
        &mut fleet,
        &[
            r#"{"type":"vm_creating","unix_ts":1,"data":{"vm_name":"sup-M1-0"}}"#,
            r#"{"type":"vm_active","unix_ts":1e20,"data":{"host":"sup-M1-0"}}"#,
        ],
    );

    let path = journal
        .finish(&fleet, &ResourceTracker::new(), STARTED as f64 + 60.0)
        .expect("finish");
    let text = fs::read_to_string(path).expect("read journal");
    assert!(text.contains("| sup-M1-0 | M1 | [PROVISIONED] |"));
}

#[test]
fn status_line_reflects_how_far_the_fleet_got() {
    let mut fleet = fleet();
    assert_eq!(session_status(&fleet), "INCOMPLETE");

    for vm in fleet.iter_mut() {
        vm.status = VmStatus::Provisioned;
    }
    assert_eq!(session_status(&fleet), "PROVISIONED (Install pending)");

    for vm in fleet.iter_mut() {
        vm.status = VmStatus::Completed;
    }
    assert_eq!(session_status(&fleet), "SUCCESS");
}

#[test]
fn suggested_fix_matches_by_keyword() {
    let error = |message: &str, task: &str| JournalError {
        at: 0.0,
        target: "sup-M1-0".to_owned(),
        task: task.to_owned(),
        kind: "vm_failed",
        message: message.to_owned(),
        stderr: None,
    };

    assert!(suggested_fix(&error("Quota exceeded for cores", ""))
        .expect("fix")
        .contains("quota"));
    assert!(suggested_fix(&error("boom", "Run stage 2 installer"))
        .expect("fix")
        .starts_with("Stage 2"));
    assert_eq!(suggested_fix(&error("boom", "misc")), None);
}
