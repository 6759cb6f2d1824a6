//! CLI argument-surface tests. No cluster required: these only exercise
//! parsing, help output, and the usage exit code.

use assert_cmd::Command;
use predicates::prelude::*;

fn warren() -> Command {
    Command::cargo_bin("warren").expect("warren binary")
}

#[test]
fn help_lists_all_subcommands() {
    warren()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cluster"))
        .stdout(predicate::str::contains("service"))
        .stdout(predicate::str::contains("node"))
        .stdout(predicate::str::contains("secret"))
        .stdout(predicate::str::contains("volume"))
        .stdout(predicate::str::contains("apply"));
}

#[test]
fn version_flag_works() {
    warren()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("warren"));
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    warren().arg("teleport").assert().code(1);
}

#[test]
fn missing_required_args_is_a_usage_error() {
    // service create without --name/--image.
    warren()
        .args(["service", "create"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--name"));
}

#[test]
fn service_help_shows_scale() {
    warren()
        .args(["service", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("scale"));
}

#[test]
fn cluster_help_shows_join_token() {
    warren()
        .args(["cluster", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("join-token"));
}

#[test]
fn apply_requires_a_file() {
    warren().arg("apply").assert().code(1);
}

#[test]
fn connection_failure_exits_with_code_2() {
    // Nothing listens on this port; reads fall back to TCP when no local
    // IPC socket exists.
    warren()
        .args(["--manager", "127.0.0.1:1", "service", "ls"])
        .env("WARREN_LOG", "error")
        .assert()
        .code(2);
}
