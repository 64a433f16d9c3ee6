#![cfg(unix)]


use process_utils::DEAD_PID;
use serde_json::Value;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use tempfile::tempdir;

fn slotguard(state_dir: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_slotguard"));
    command
        .env("SLOTGUARD_STATE_DIR", state_dir)
        .env_remove("SLOTGUARD_MAX_WORKERS")
        .env_remove("SLOTGUARD_WORKER_INDEX")
        .env("RUST_LOG", "off")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

fn spawn_resolve(state_dir: &Path, max_workers: u32, hold_ms: u64) -> Child {
    slotguard(state_dir)
        .args(["resolve", "--max-workers", &max_workers.to_string()])
        .args(["--worker-index", "1", "--hold-ms", &hold_ms.to_string()])
        .spawn()
        .unwrap()
}

fn json_output(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "slotguard failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn two_processes_racing_for_one_slot() {
    let dir = tempdir().unwrap();

    let first = spawn_resolve(dir.path(), 1, 1500);
    let second = spawn_resolve(dir.path(), 1, 1500);

    let first = json_output(&first.wait_with_output().unwrap());
    let second = json_output(&second.wait_with_output().unwrap());

    let mut sources = vec![
        first["assignment"]["source"].as_str().unwrap().to_string(),
        second["assignment"]["source"].as_str().unwrap().to_string(),
    ];
    sources.sort();
    assert_eq!(sources, vec!["claimed", "fallback"]);

    assert_eq!(first["assignment"]["slot"], 1);
    assert_eq!(second["assignment"]["slot"], 1);

    // The claimant released its claim on exit.
    assert!(!dir.path().join("slot-claims/slot-1.lock").exists());
}

#[test]
fn concurrent_processes_get_distinct_slots() {
    let dir = tempdir().unwrap();

    let children: Vec<Child> = (0..3).map(|_| spawn_resolve(dir.path(), 3, 1500)).collect();
    let mut slots: Vec<u64> = children
        .into_iter()
        .map(|child| json_output(&child.wait_with_output().unwrap()))
        .inspect(|output| assert_eq!(output["assignment"]["source"], "claimed"))
        .map(|output| output["assignment"]["slot"].as_u64().unwrap())
        .collect();
    slots.sort_unstable();
    assert_eq!(slots, vec![1, 2, 3]);
}

#[test]
fn resolve_reclaims_claim_of_dead_process() {
    let dir = tempdir().unwrap();
    let claim_dir = dir.path().join("slot-claims");
    std::fs::create_dir_all(&claim_dir).unwrap();
    std::fs::write(
        claim_dir.join("slot-1.lock"),
        format!("pid={DEAD_PID}\nworker=crashed\n"),
    )
    .unwrap();

    let output = slotguard(dir.path())
        .args(["resolve", "--max-workers", "1"])
        .output()
        .unwrap();
    let output = json_output(&output);

    assert_eq!(output["assignment"]["slot"], 1);
    assert_eq!(output["assignment"]["source"], "reclaimed");
    assert_eq!(output["namespace"]["port"], 4101);
    assert_eq!(output["namespace"]["schema_prefix"], "app_slot_1");
}

#[test]
fn cleanup_removes_pid_files_and_claims() {
    let dir = tempdir().unwrap();
    let claim_dir = dir.path().join("slot-claims");
    std::fs::create_dir_all(&claim_dir).unwrap();
    std::fs::write(claim_dir.join("slot-2.lock"), "pid=1\nworker=x\n").unwrap();
    std::fs::write(dir.path().join("api-slot-1.pid"), DEAD_PID.to_string()).unwrap();

    let output = slotguard(dir.path())
        .args(["cleanup", "--max-workers", "2"])
        .output()
        .unwrap();
    let report = json_output(&output);

    assert_eq!(report["slots"][0]["stop"], "already_exited");
    assert_eq!(report["claim_dir_removed"], true);
    assert!(!dir.path().join("api-slot-1.pid").exists());
    assert!(!claim_dir.exists());
}

#[test]
fn stop_on_dead_pid_succeeds() {
    let dir = tempdir().unwrap();
    let output = slotguard(dir.path())
        .args(["stop", &DEAD_PID.to_string()])
        .output()
        .unwrap();
    assert_eq!(json_output(&output), "already_exited");
}

#[test]
fn invalid_environment_is_reported() {
    let dir = tempdir().unwrap();
    let output = slotguard(dir.path())
        .env("SLOTGUARD_MAX_WORKERS", "many")
        .arg("status")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("SLOTGUARD_MAX_WORKERS"));
}
