//! tunnelctl CLI Tests
//!
//! Exercises the commands that need no adapter or elevation.

use assert_cmd::Command;
use predicates::prelude::*;

fn tunnelctl() -> Command {
    Command::cargo_bin("tunnelctl").unwrap()
}

#[test]
fn test_help_lists_commands() {
    tunnelctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("probe"))
        .stdout(predicate::str::contains("render"))
        .stdout(predicate::str::contains("connect"));
}

#[test]
fn test_settings_prints_defaults() {
    tunnelctl()
        .arg("settings")
        .assert()
        .success()
        .stdout(predicate::str::contains("[monitor]"))
        .stdout(predicate::str::contains("poll_interval_ms = 100"))
        .stdout(predicate::str::contains("smoothing_weight = 0.7"));
}

#[test]
fn test_settings_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = dir.path().join("tunnelctl.toml");
    std::fs::write(&settings, "[monitor]\ngrace_polls = 20\n").unwrap();

    tunnelctl()
        .arg("--settings")
        .arg(&settings)
        .arg("settings")
        .assert()
        .success()
        .stdout(predicate::str::contains("grace_polls = 20"))
        .stdout(predicate::str::contains("required_stable_polls = 10"));
}

#[test]
fn test_render_for_fast_driver() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("client.ovpn");
    std::fs::write(&config, "client\ndev tap\nremote 1.2.3.4 1194\npersist-tun\n").unwrap();

    tunnelctl()
        .arg("render")
        .arg(&config)
        .assert()
        .success()
        .stdout("client\nremote 1.2.3.4 1194\nwindows-driver wintun\n");
}

#[test]
fn test_render_for_legacy_driver_with_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("client.ovpn");
    std::fs::write(&config, "dev tap\nauth-user-pass\n").unwrap();

    tunnelctl()
        .arg("render")
        .arg(&config)
        .args(["--driver", "legacy", "--credentials-path", "auth.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dev tap"))
        .stdout(predicate::str::contains("auth-user-pass \"auth.txt\""))
        .stdout(predicate::str::contains("wintun").not());
}

#[test]
fn test_render_missing_file_fails() {
    tunnelctl()
        .arg("render")
        .arg("/nonexistent/client.ovpn")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

#[test]
fn test_malformed_settings_fail() {
    let dir = tempfile::tempdir().unwrap();
    let settings = dir.path().join("bad.toml");
    std::fs::write(&settings, "[monitor\n").unwrap();

    tunnelctl()
        .arg("--settings")
        .arg(&settings)
        .arg("settings")
        .assert()
        .failure();
}
