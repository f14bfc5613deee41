// Integration tests for `lbridge run` and `lbridge check`: exit codes, plain
// and --json stdout, host callables and limit flags.
//
// Run with: cargo test -p lunabridge-cli --test run_tests -- --nocapture

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

fn lbridge() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_lbridge"));
    cmd.current_dir(env!("CARGO_MANIFEST_DIR"));
    cmd.env_remove("LBRIDGE_CONFIG");
    cmd
}

fn script(dir: &tempfile::TempDir, name: &str, source: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, source).unwrap();
    path
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

#[test]
fn run_prints_results() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "add.lua", "return host.add(2, 3), 'done', 1.5");
    let output = lbridge().arg("run").arg(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "5\ndone\n1.5\n");
}

#[test]
fn run_passes_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "args.lua", "local a, b = ... return a .. b, #arg, arg[2]");
    let output = lbridge()
        .arg("run")
        .arg(&path)
        .args(["--", "left", "right"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "leftright\n2\nright\n");
}

#[test]
fn run_json_is_single_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "json.lua", "host.print('noise') return {1, 2}, {k = 'v'}, nil");
    let output = lbridge().arg("run").arg(&path).arg("--json").output().unwrap();
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let out = stdout(&output);
    let last = out.lines().last().unwrap();
    let doc: serde_json::Value = serde_json::from_str(last).unwrap();
    assert_eq!(doc["results"], serde_json::json!([[1, 2], {"k": "v"}, null]));
    assert!(doc["memory_peak"].as_u64().unwrap() > 0);
    assert_eq!(out.lines().next(), Some("noise"));
}

#[test]
fn run_fault_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "fault.lua", "local t = nil\nreturn t.field");
    let output = lbridge().arg("run").arg(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(5));
    let err = stderr(&output);
    assert!(err.contains("fault.lua:2"), "stderr: {}", err);
    assert!(err.contains("stack traceback"), "stderr: {}", err);
}

#[test]
fn run_host_argument_mismatch_is_fault() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "bad.lua", "return host.add({}, 1)");
    let output = lbridge().arg("run").arg(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(5));
    assert!(stderr(&output).contains("cannot convert table to number"));
}

#[test]
fn run_instruction_limit_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "spin.lua", "while true do end");
    let output = lbridge()
        .arg("run")
        .arg(&path)
        .args(["--instruction-limit", "100000"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(6));
    let err = stderr(&output);
    assert!(err.contains("instruction limit exceeded"), "stderr: {}", err);
    assert!(err.contains("hint:"));
}

#[test]
fn run_memory_limit_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "hog.lua", "local t = {} for i = 1, 1e8 do t[i] = tostring(i) end");
    let output = lbridge()
        .arg("run")
        .arg(&path)
        .args(["--memory-limit", "2000000"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(6), "stderr: {}", stderr(&output));
}

#[test]
fn run_sandbox_hides_os() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "probe.lua", "return os == nil, io == nil, string ~= nil");
    let output = lbridge().arg("run").arg(&path).arg("--sandbox").output().unwrap();
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "true\ntrue\ntrue\n");
}

#[test]
fn run_reads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("session.toml");
    fs::write(&config, "sandbox = true\ninstruction_limit = 50000\n").unwrap();
    let path = script(&dir, "spin.lua", "while os == nil do end");
    let output = lbridge()
        .arg("run")
        .arg(&path)
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(6), "stderr: {}", stderr(&output));
}

#[test]
fn run_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("session.toml");
    fs::write(&config, "hook_interval = 0\n").unwrap();
    let path = script(&dir, "one.lua", "return 1");
    let output = lbridge()
        .arg("run")
        .arg(&path)
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn run_missing_script_is_io_error() {
    let output = lbridge().args(["run", "does/not/exist.lua"]).output().unwrap();
    assert_eq!(output.status.code(), Some(3));
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

#[test]
fn check_accepts_valid_script() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "ok.lua", "error('never runs')");
    let output = lbridge().arg("check").arg(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert!(stdout(&output).starts_with("ok: "));
}

#[test]
fn check_reports_syntax_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "broken.lua", "local x = = 1");
    let output = lbridge().arg("check").arg(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(4));
    assert!(stderr(&output).contains("syntax error"));
}
