use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

#[test]
fn conflict_path_prints_expected_path_for_fixed_timestamp() {
    Command::cargo_bin("notesync")
        .unwrap()
        .args(["conflict-path", "notes/test.md", "--at", "2026-07-28T10:30:00Z"])
        .assert()
        .success()
        .stdout(contains("notes/test.conflict.20260728103000.md"));
}

#[test]
fn conflict_path_preserves_missing_extension() {
    Command::cargo_bin("notesync")
        .unwrap()
        .args(["conflict-path", "notes/README", "--at", "2026-07-28T10:30:00Z"])
        .assert()
        .success()
        .stdout(contains("notes/README.conflict.20260728103000"));
}

#[test]
fn doctor_reports_workspace_writability() {
    let workdir = tempdir().unwrap();
    Command::cargo_bin("notesync")
        .unwrap()
        .args(["--workspace-dir", workdir.path().join("ws").to_str().unwrap(), "doctor"])
        .assert()
        .success()
        .stdout(contains("workspace_dir:"));
}

#[test]
fn completions_generate_without_error() {
    Command::cargo_bin("notesync").unwrap().args(["completions", "bash"]).assert().success();
}
