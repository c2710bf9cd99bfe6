//! Integration tests for the `editorial` binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create an editorial Command isolated from the caller's env.
fn editorial() -> Command {
    let mut cmd = cargo_bin_cmd!("editorial");
    for var in [
        "EDITORIAL_CONFIG",
        "EDITORIAL_SERVICE_URL",
        "EDITORIAL_PORT",
        "REDIS_URL",
        "RULES_FILE",
        "RULE_STORE_BACKEND",
        "RULE_STORE_HOST",
        "RULE_STORE_PORT",
        "RULE_STORE_COLLECTION",
        "CACHE_TTL_SECONDS",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        editorial()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("config"));
    }

    #[test]
    fn test_version() {
        editorial()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_serve_help_lists_flags() {
        editorial()
            .args(["serve", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--redis-url"))
            .stdout(predicate::str::contains("--role"));
    }

    #[test]
    fn test_unknown_role_rejected() {
        editorial()
            .args(["serve", "--role", "janitor"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid service role"));
    }
}

// =============================================================================
// Config Command Tests
// =============================================================================

mod config_command {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = temp_dir();
        editorial()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created editorial.toml"));

        let content = fs::read_to_string(dir.path().join("editorial.toml")).unwrap();
        assert!(content.contains("[server]"));
        assert!(content.contains("[cache]"));
    }

    #[test]
    fn test_config_init_refuses_to_overwrite() {
        let dir = temp_dir();
        fs::write(dir.path().join("editorial.toml"), "[server]\nport = 9001\n").unwrap();
        editorial()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join("editorial.toml")).unwrap();
        assert!(content.contains("9001"));
    }

    #[test]
    fn test_config_show_reflects_file_and_env() {
        let dir = temp_dir();
        fs::write(dir.path().join("editorial.toml"), "[server]\nport = 9001\n").unwrap();
        editorial()
            .current_dir(dir.path())
            .env("REDIS_URL", "redis://state:6379")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9001"))
            .stdout(predicate::str::contains("redis://state:6379"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = temp_dir();
        fs::write(
            dir.path().join("editorial.toml"),
            "[editorial]\nservice_url = \"localhost:8040\"\n",
        )
        .unwrap();
        editorial()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("should start with http://"));
    }

    #[test]
    fn test_config_explicit_path() {
        let dir = temp_dir();
        let path = dir.path().join("nested").join("custom.toml");
        editorial()
            .args(["config", "--config"])
            .arg(&path)
            .arg("init")
            .assert()
            .success();
        assert!(path.exists());
    }

    #[test]
    fn test_malformed_config_fails() {
        let dir = temp_dir();
        fs::write(dir.path().join("editorial.toml"), "[server\nport = ").unwrap();
        editorial()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse editorial.toml"));
    }
}
