//! CLI smoke tests for the modkit-host binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

fn run_host(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_modkit-host"))
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to execute modkit-host")
}

/// Writes a config whose home dir lives inside `tmp`.
fn write_config(tmp: &TempDir, extra: &str) -> PathBuf {
    let home = tmp.path().join("home").to_string_lossy().replace('\\', "/");
    let yaml = format!(
        r#"
server:
  home_dir: "{home}"
  timeout_sec: 1
logging:
  default:
    console_level: info
    file: ""
{extra}"#
    );
    let path = tmp.path().join("modkit.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().to_string()
}

#[test]
fn help_lists_commands_and_flags() {
    let output = run_host(&["--help"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for needle in ["Usage:", "run", "check", "--config", "--mock", "--strict"] {
        assert!(stdout.contains(needle), "help should mention {needle}");
    }
}

#[test]
fn missing_config_file_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("absent.yaml");
    let output = run_host(&["--config", &path_arg(&missing), "check"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "stderr: {stderr}");
}

#[test]
fn print_config_applies_cli_overrides() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(&tmp, "");
    let output = run_host(&["--config", &path_arg(&cfg), "--strict", "--mock", "--print-config"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("strict_dependencies: true"), "stdout: {stdout}");
    assert!(stdout.contains("mock: true"));
}

#[test]
fn check_prints_the_load_order() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(&tmp, "");
    let output = run_host(&["--config", &path_arg(&cfg), "check"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let storage = stdout.find("1. core.storage").expect("storage listed first");
    let settings = stdout.find("2. core.settings").expect("settings listed second");
    assert!(storage < settings);
    assert!(stdout.contains("Configuration check passed"));
}

#[test]
fn strict_check_passes_with_builtin_modules() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(&tmp, "");
    let output = run_host(&["--config", &path_arg(&cfg), "--strict", "check"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
}

#[test]
fn run_bootstraps_starts_and_stops_on_timeout() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(
        &tmp,
        "database:\n  url: \"sqlite://data/app.db\"\nlifecycle:\n  directories: [cache]\n",
    );
    let output = run_host(&["--config", &path_arg(&cfg), "run"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Started: 2 ready, 0 failed"), "stdout: {stdout}");
    assert!(stdout.contains("Stopped"));

    let home = tmp.path().join("home");
    assert!(home.join("cache").is_dir());
    assert!(home.join("data/app.db").is_file());
}

#[test]
fn mock_mode_skips_database_provisioning() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(&tmp, "database:\n  url: \"sqlite://data/app.db\"\n");
    let output = run_host(&["--config", &path_arg(&cfg), "--mock", "run"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(!tmp.path().join("home/data/app.db").exists());
}
