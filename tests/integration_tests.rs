//! Integration tests for the dealflow CLI
//!
//! Each test runs the binary in a scratch directory with the environment
//! variables that feed configuration cleared.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const CONFIG_ENV: &[&str] = &[
    "DEALFLOW_CONFIG",
    "DEALFLOW_PORT",
    "DEALFLOW_DB_PATH",
    "DEALFLOW_SYNC_INTERVAL",
    "CHATWOOT_BASE_URL",
    "CHATWOOT_ACCOUNT_ID",
    "CHATWOOT_API_TOKEN",
    "RUST_LOG",
];

/// Helper to create a dealflow Command running in `dir`
fn dealflow(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("dealflow");
    cmd.current_dir(dir.path());
    for key in CONFIG_ENV {
        cmd.env_remove(key);
    }
    cmd
}

fn create_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = create_temp_dir();
        dealflow(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("sync"))
            .stdout(predicate::str::contains("summary"));
    }

    #[test]
    fn test_version() {
        let dir = create_temp_dir();
        dealflow(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_summary_help_describes_tag_matching() {
        let dir = create_temp_dir();
        dealflow(&dir)
            .args(["summary", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("all must match"));
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = create_temp_dir();
        dealflow(&dir).arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Database Tests
// =============================================================================

mod database {
    use super::*;

    #[test]
    fn test_init_creates_seeded_database() {
        let dir = create_temp_dir();
        dealflow(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized database"))
            .stdout(predicate::str::contains("Negotiation"));

        assert!(dir.path().join(".dealflow/dealflow.db").exists());
    }

    #[test]
    fn test_init_twice_reports_existing() {
        let dir = create_temp_dir();
        dealflow(&dir).arg("init").assert().success();
        dealflow(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_db_path_flag() {
        let dir = create_temp_dir();
        dealflow(&dir)
            .args(["--db-path", "custom/crm.db", "init"])
            .assert()
            .success();
        assert!(dir.path().join("custom/crm.db").exists());
    }

    #[test]
    fn test_summary_on_fresh_database() {
        let dir = create_temp_dir();
        dealflow(&dir)
            .arg("summary")
            .assert()
            .success()
            .stdout(predicate::str::contains("Total deals: 0"))
            .stdout(predicate::str::contains("Win rate: n/a"));
    }

    #[test]
    fn test_summary_json() {
        let dir = create_temp_dir();
        let output = dealflow(&dir)
            .args(["summary", "--json", "--status", "open"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(summary["total_deals"], 0);
        assert_eq!(summary["by_stage"].as_array().unwrap().len(), 6);
    }

    #[test]
    fn test_summary_rejects_bad_status() {
        let dir = create_temp_dir();
        dealflow(&dir)
            .args(["summary", "--status", "pending"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("statuses"));
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = create_temp_dir();
        dealflow(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created dealflow.toml"));

        let content = fs::read_to_string(dir.path().join("dealflow.toml")).unwrap();
        assert!(content.contains("[server]"));
        assert!(content.contains("port = 3141"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = create_temp_dir();
        fs::write(dir.path().join("dealflow.toml"), "[server]\nport = 9000\n").unwrap();
        dealflow(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join("dealflow.toml")).unwrap();
        assert!(content.contains("port = 9000"));
    }

    #[test]
    fn test_config_show_masks_token() {
        let dir = create_temp_dir();
        fs::write(
            dir.path().join("dealflow.toml"),
            "[chatwoot]\nbase_url = \"https://chat.example.com\"\naccount_id = 1\napi_token = \"abcdefgh1234\"\n",
        )
        .unwrap();
        dealflow(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("********1234"))
            .stdout(predicate::str::contains("abcdefgh").not());
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = create_temp_dir();
        fs::write(dir.path().join("dealflow.toml"), "[server]\nport = 9000\n").unwrap();
        dealflow(&dir)
            .env("DEALFLOW_PORT", "9100")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9100"));
    }

    #[test]
    fn test_config_validate_warns_on_partial_chatwoot() {
        let dir = create_temp_dir();
        fs::write(
            dir.path().join("dealflow.toml"),
            "[chatwoot]\nbase_url = \"https://chat.example.com\"\n",
        )
        .unwrap();
        dealflow(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("incomplete"));
    }

    #[test]
    fn test_missing_explicit_config_fails() {
        let dir = create_temp_dir();
        dealflow(&dir)
            .args(["--config", "nope.toml", "summary"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("nope.toml"));
    }
}

// =============================================================================
// Sync Tests
// =============================================================================

mod sync {
    use super::*;

    #[test]
    fn test_sync_without_chatwoot_fails() {
        let dir = create_temp_dir();
        dealflow(&dir)
            .arg("sync")
            .assert()
            .failure()
            .stderr(predicate::str::contains("not configured"));
    }
}
