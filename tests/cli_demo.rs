//! CLI integration tests for the binary's subcommands.

use std::io::Write;
use std::process::Command;

#[test]
fn demo_cli_archives_every_vial_without_lock_violation() {
    let bin = env!("CARGO_BIN_EXE_labflow");
    // Run the demo binary with default settings.
    let output = Command::new(bin)
        .output()
        .expect("failed to run demo binary");

    assert!(
        output.status.success(),
        "demo exited with non-zero status: {:?}",
        output.status
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("DEMO SUMMARY"),
        "demo summary missing from output"
    );

    let lock_line = stdout
        .lines()
        .find(|line| line.starts_with("lock_violation="))
        .expect("lock_violation line missing");
    assert_eq!(lock_line.trim(), "lock_violation=false");

    let archived = stdout
        .lines()
        .find(|line| line.starts_with("archived="))
        .expect("archived line missing");
    assert_eq!(archived.trim(), "archived=8");
}

#[test]
fn validate_reports_unknown_hook() {
    let mut file = tempfile::NamedTempFile::new().expect("temp config");
    writeln!(
        file,
        r#"
        [app]
        robots = [1]

        [[zones]]
        zone_id = 1
        slot_count = 1

        [[transitions]]
        transition_id = 1
        curr_zone = 1
        next_zone = 1
        pre_checks = ["no_such_hook"]
        "#
    )
    .expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_labflow"))
        .args(["validate", "--config"])
        .arg(file.path())
        .output()
        .expect("failed to run validate");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no_such_hook"), "stderr: {stderr}");
}

#[test]
fn validate_accepts_bundled_config() {
    let config = concat!(env!("CARGO_MANIFEST_DIR"), "/config/demo.toml");
    let output = Command::new(env!("CARGO_BIN_EXE_labflow"))
        .args(["validate", "--config", config])
        .output()
        .expect("failed to run validate");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("config ok: zones=4 transitions=2 robots=2"), "stdout: {stdout}");
}
