//! CLI tests for `pentest-agent config` and setup failures.
//!
//! Spawns the binary and verifies exit codes.

use std::fs;
use std::process::Command;

use pentest_agent::exit_codes;
use pentest_agent::io::config::load_config;

fn agent() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pentest-agent"))
}

#[test]
fn config_init_writes_valid_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("agent.toml");

    let status = agent()
        .args(["config", "init", "--path"])
        .arg(&path)
        .status()
        .expect("config init");
    assert_eq!(status.code(), Some(exit_codes::OK));

    let cfg = load_config(&path).expect("load written config");
    assert_eq!(cfg.executor.max_rounds, 10);

    let status = agent()
        .args(["config", "validate", "--path"])
        .arg(&path)
        .status()
        .expect("config validate");
    assert_eq!(status.code(), Some(exit_codes::OK));
}

#[test]
fn config_init_refuses_to_overwrite_without_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("agent.toml");
    fs::write(&path, "[executor]\nmax_rounds = 4\n").expect("write config");

    let status = agent()
        .args(["config", "init", "--path"])
        .arg(&path)
        .status()
        .expect("config init");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
    let kept = fs::read_to_string(&path).expect("read config");
    assert!(kept.contains("max_rounds = 4"));
}

#[test]
fn invalid_config_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("agent.toml");
    fs::write(&path, "[executor]\nmax_rounds = 0\n").expect("write config");

    let status = agent()
        .args(["config", "validate", "--path"])
        .arg(&path)
        .status()
        .expect("config validate");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn run_without_api_key_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let scenario = temp.path().join("scenario.md");
    fs::write(&scenario, "Assess 10.0.0.0/24.").expect("write scenario");
    let config = temp.path().join("agent.toml");
    fs::write(
        &config,
        "[oracle]\napi_key_env = \"PENTEST_AGENT_TEST_UNSET_KEY\"\n\n[channel]\nkind = \"local\"\n",
    )
    .expect("write config");

    let status = agent()
        .current_dir(temp.path())
        .env_remove("PENTEST_AGENT_TEST_UNSET_KEY")
        .args(["run", "--scenario"])
        .arg(&scenario)
        .arg("--config")
        .arg(&config)
        .status()
        .expect("run");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}
