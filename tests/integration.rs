//! Integration tests for the parx CLI.
//!
//! These tests run the built binary end-to-end with small shell jobs.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

/// Get a command for the parx binary.
fn parx() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("parx").unwrap();
    cmd.env_remove("PARX_JOBS")
        .env_remove("PARX_SHELL")
        .env_remove("PARX_LOG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help() {
    parx()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--keep-order"))
        .stdout(predicate::str::contains("--processes"));
}

#[test]
fn test_missing_template_fails() {
    parx()
        .args(["-a", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("TEMPLATE"));
}

#[test]
fn test_runs_every_arg() {
    let output = parx()
        .args(["-j", "3", "-a", "a", "-a", "b", "-a", "c", "echo", "item-{}"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let mut lines: Vec<_> = stdout.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["item-a", "item-b", "item-c"]);
}

#[test]
fn test_items_from_stdin() {
    let output = parx()
        .args(["-j", "2", "echo", "item:{}"])
        .write_stdin("one\ntwo words\nthree\n")
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let mut lines: Vec<_> = stdout.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["item:one", "item:three", "item:two words"]);
}

#[test]
fn test_item_is_appended_without_placeholder() {
    parx()
        .args(["-a", "hello", "echo", "say"])
        .assert()
        .success()
        .stdout("say hello\n");
}

#[test]
fn test_keep_order_prints_in_input_order() {
    parx()
        .args(["-k", "-j", "4"])
        .args(["-a", "3", "-a", "2", "-a", "1", "-a", "0"])
        .args(["sleep", "0.{}", ";", "echo", "{}"])
        .assert()
        .success()
        .stdout("3\n2\n1\n0\n");
}

#[test]
fn test_json_output() {
    let output = parx()
        .args(["--json", "-a", "x", "-a", "y", "printf", "%s", "{}"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let jobs: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["index"], 0);
    assert_eq!(jobs[0]["item"], "x");
    assert_eq!(jobs[0]["stdout"], "x");
    assert_eq!(jobs[1]["status"], 0);
    assert_eq!(jobs[1]["stdout"], "y");
}

#[test]
fn test_failed_job_exits_with_one() {
    parx()
        .args(["-j", "1", "-a", "0", "-a", "7", "exit"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error"))
        .stderr(predicate::str::contains("exited with code 7"));
}

#[test]
fn test_halt_on_exit_stops_early() {
    parx()
        .args(["-j", "1", "--halt-on-exit", "3"])
        .args(["-a", "1", "-a", "3", "-a", "5"])
        .args(["echo", "{};", "exit", "$(( {} == 3 ? 3 : 0 ))"])
        .assert()
        .success()
        .stdout("1\n3\n")
        .stderr(predicate::str::contains("stopped after job 1"));
}

#[test]
fn test_kill_on_exit_exits_with_two() {
    parx()
        .args(["-j", "2", "--kill-on-exit", "9"])
        .args(["-a", "9", "-a", "30"])
        .args(["test", "{}", "=", "9", "&&", "exit", "9", "||", "exec", "sleep", "{}"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("killed"));
}

/// The killed job forks a `sleep` that shares our stdout; the run only
/// ends quickly if that grandchild dies with it.
fn assert_kill_reaches_grandchildren(mode: &[&str]) {
    let started = std::time::Instant::now();
    parx()
        .args(mode)
        .args(["-j", "2", "--kill-on-exit", "9", "-a", "9", "-a", "20"])
        .args(["test", "{}", "=", "9", "&&", "sleep", "0.3", "&&", "exit", "9;"])
        .args(["sleep", "{};", "echo", "done"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .code(2)
        .stdout(predicate::str::contains("done").not());
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}

#[test]
fn test_kill_reaches_grandchildren_in_threads() {
    assert_kill_reaches_grandchildren(&[]);
}

#[test]
fn test_kill_reaches_grandchildren_in_processes() {
    assert_kill_reaches_grandchildren(&["--processes"]);
}

#[test]
fn test_processes_mode() {
    let output = parx()
        .args(["--processes", "-j", "2", "-k"])
        .args(["-a", "1", "-a", "2", "-a", "3"])
        .args(["echo", "{}-$(( {} * {} ))"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8(output.stdout).unwrap(), "1-1\n2-4\n3-9\n");
}

#[test]
fn test_isolated_processes() {
    parx()
        .args(["--processes", "--isolation", "-j", "2", "--json"])
        .args(["-a", "a", "-a", "b"])
        .args(["printf", "{}"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"stdout\": \"a\""))
        .stdout(predicate::str::contains("\"stdout\": \"b\""));
}

#[test]
fn test_zero_jobs_runs_sequentially() {
    parx()
        .args(["-j", "0", "-a", "a", "-a", "b", "-a", "c", "echo"])
        .assert()
        .success()
        .stdout("a\nb\nc\n");
}

#[test]
fn test_progress_needs_args() {
    parx()
        .args(["--progress", "echo"])
        .write_stdin("x\n")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("known size"));
}

#[test]
fn test_custom_shell_from_env() {
    parx()
        .env("PARX_SHELL", "bash")
        .args(["-a", "x", "echo", "${BASH_VERSION:+bash}-{}"])
        .assert()
        .success()
        .stdout("bash-x\n");
}

#[test]
fn test_log_file() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("parx.log");
    parx()
        .env("PARX_LOG_FILE", &log)
        .args(["-vv", "-a", "x", "true"])
        .assert()
        .success();

    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.contains("Starting pool"));
}
