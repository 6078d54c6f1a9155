use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const VALID: &str = r#"
[orchestrator]
max_parallel = 2
state_dir = "state"

[backends.emulator]
exec_command = "sh -c {command}"

[[environments]]
id = "emu-1"
backend = "emulated_hardware"
architecture = "x86_64"
memory_mb = 2048
cpu_cores = 2
"#;

fn testgrid(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("testgrid").unwrap();
    cmd.current_dir(dir.path()).env("TESTGRID_LOG", "warn");
    cmd
}

#[test]
fn test_validate_accepts_valid_config() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("testgrid.toml"), VALID).unwrap();

    testgrid(&dir)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Backends: emulator"));
}

#[test]
fn test_validate_rejects_unconfigured_backend() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("testgrid.toml"),
        r#"
[[environments]]
id = "board-1"
backend = "physical"
architecture = "arm64"
memory_mb = 1024
cpu_cores = 1
"#,
    )
    .unwrap();

    testgrid(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("board-1"));
}

#[test]
fn test_init_writes_loadable_config_once() {
    let dir = TempDir::new().unwrap();

    testgrid(&dir)
        .args(["init", "--backend", "emulator"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created testgrid.toml"));
    testgrid(&dir).arg("validate").assert().success();

    testgrid(&dir)
        .args(["init", "--backend", "emulator"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_pool_lists_environments() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("testgrid.toml"), VALID).unwrap();

    testgrid(&dir)
        .arg("pool")
        .assert()
        .success()
        .stdout(predicate::str::contains("emu-1"));
}

#[test]
fn test_run_exit_code_follows_plan_outcome() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("testgrid.toml"), VALID).unwrap();
    fs::write(
        dir.path().join("pass.toml"),
        r#"
id = "pass"

[[tests]]
id = "hello"
command = "echo hello"
"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("fail.toml"),
        r#"
id = "fail"

[[tests]]
id = "boom"
command = "echo boom >&2; exit 2"
"#,
    )
    .unwrap();

    testgrid(&dir).args(["run", "pass.toml"]).assert().success();
    testgrid(&dir)
        .args(["run", "fail.toml"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("fail/boom"));

    testgrid(&dir)
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pass\""))
        .stdout(predicate::str::contains("\"completed\""));
}

#[test]
fn test_run_rejects_duplicate_plan_and_exits() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("testgrid.toml"), VALID).unwrap();
    fs::write(
        dir.path().join("once.toml"),
        r#"
id = "once"

[[tests]]
id = "slow"
command = "sleep 30"
"#,
    )
    .unwrap();

    testgrid(&dir)
        .args(["run", "once.toml", "once.toml"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .failure()
        .stderr(predicate::str::contains("already submitted"));

    // the accepted copy was cancelled, not left in flight
    testgrid(&dir)
        .args(["status", "--plan", "once", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"cancelled\""));
}
