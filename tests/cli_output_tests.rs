use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

#[test]
fn preview_prints_groups_without_ansi_when_color_is_off() {
    let root = temp_workspace("preview");
    let config = root.join("fleet.toml");
    fs::write(
        &config,
        "deployment = \"exp-7\"\n\n[[vm]]\nname = \"sup-M1-0\"\nbehavior = \"M1\"\nflavor = \"v1.14vcpu.28g\"\n\n[[vm]]\nname = \"sup-C0-0\"\nbehavior = \"C0\"\nflavor = \"v1.14vcpu.28g\"\n",
    )
    .expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_fleetmon"))
        .arg("preview")
        .arg("--config")
        .arg(&config)
        .env("NO_COLOR", "1")
        .env("FLEETMON_COLOR", "always")
        .output()
        .expect("run fleetmon");

    assert!(
        output.status.success(),
        "stdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).expect("utf8 stdout");
    assert!(stdout.contains("Deployment preview: exp-7"));
    assert!(stdout.find("sup-C0-0").expect("control") < stdout.find("sup-M1-0").expect("m1"));
    assert!(!stdout.contains('\u{1b}'));
}

#[test]
fn invalid_arguments_exit_with_usage_status() {
    let output = Command::new(env!("CARGO_BIN_EXE_fleetmon"))
        .arg("deploy")
        .arg("--config")
        .env("NO_COLOR", "1")
        .output()
        .expect("run fleetmon");

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8(output.stderr).expect("utf8 stderr");
    assert!(stderr.contains("[error] Invalid command arguments"));
    assert!(stderr.contains("fleetmon --help"));
}

#[test]
fn missing_config_is_a_runtime_error() {
    let root = temp_workspace("missing-config");
    let output = Command::new(env!("CARGO_BIN_EXE_fleetmon"))
        .arg("preview")
        .arg("--config")
        .arg(root.join("absent.toml"))
        .env("NO_COLOR", "1")
        .output()
        .expect("run fleetmon");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).expect("utf8 stderr");
    assert!(stderr.contains("[error] Session failed"));
    assert!(stderr.contains("absent.toml"));
}

#[test]
fn help_exits_cleanly() {
    let output = Command::new(env!("CARGO_BIN_EXE_fleetmon"))
        .arg("--help")
        .output()
        .expect("run fleetmon");

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("utf8 stdout");
    assert!(stdout.contains("deploy"));
    assert!(stdout.contains("teardown"));
    assert!(stdout.contains("preview"));
}

fn temp_workspace(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    let root = std::env::temp_dir().join(format!("fleetmon-cli-{name}-{ts}"));
    fs::create_dir_all(&root).expect("mkdir workspace");
    root
}
