//! Integration tests for the conductor CLI
//!
//! These drive the built binary against throwaway project directories, with
//! `sh -c` scripts standing in for the agent.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a conductor Command with a clean environment
fn conductor() -> Command {
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.env_remove("CONDUCTOR_AGENT_CMD")
        .env_remove("CONDUCTOR_PROJECT_DIR")
        .env_remove("RUST_LOG");
    cmd
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Write a conductor.toml whose agent runs `script` under `sh -c`.
///
/// The directive arrives as `$1` and the issue number as `$2`.
fn write_agent_config(dir: &TempDir, script: &str) {
    write_agent_config_with_grace(dir, script, 1);
}

fn write_agent_config_with_grace(dir: &TempDir, script: &str, kill_grace_secs: u64) {
    let conductor_dir = dir.path().join(".conductor");
    fs::create_dir_all(&conductor_dir).unwrap();
    fs::write(
        conductor_dir.join("conductor.toml"),
        format!(
            r#"
[project]
agent_cmd = "sh"
agent_args = ["-c", '{}', "agent"]

[defaults]
phases = ["spec", "exec", "qa"]
phase_timeout_secs = 30
kill_grace_secs = {}
"#,
            script, kill_grace_secs
        ),
    )
    .unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_conductor_help() {
        conductor()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("cache"));
    }

    #[test]
    fn test_conductor_version() {
        conductor().arg("--version").assert().success();
    }

    #[test]
    fn test_run_requires_issues() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .failure();
    }

    #[test]
    fn test_run_rejects_issue_zero() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["run", "0", "--dry-run"])
            .assert()
            .failure();
    }

    #[test]
    fn test_run_rejects_unknown_mode() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["run", "1", "--dry-run", "--mode", "swarm"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown execution mode"));
    }
}

// =============================================================================
// Run
// =============================================================================

mod run {
    use super::*;

    #[test]
    fn test_dry_run_exits_zero_without_agent() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".conductor")).unwrap();
        fs::write(
            dir.path().join(".conductor/conductor.toml"),
            "[project]\nagent_cmd = \"definitely-not-an-installed-agent\"\n",
        )
        .unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["run", "1", "2", "--dry-run", "--mode", "fan-out"])
            .assert()
            .success();

        // Dry runs leave no state behind.
        assert!(!dir.path().join(".conductor/state.json").exists());
    }

    #[test]
    fn test_missing_agent_binary_is_fatal() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".conductor")).unwrap();
        fs::write(
            dir.path().join(".conductor/conductor.toml"),
            "[project]\nagent_cmd = \"definitely-not-an-installed-agent\"\n",
        )
        .unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["run", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("definitely-not-an-installed-agent"));

        assert!(!dir.path().join(".conductor/state.json").exists());
    }

    #[test]
    fn test_successful_run_marks_ready_for_merge() {
        let dir = create_temp_project();
        write_agent_config(&dir, "exit 0");

        conductor()
            .current_dir(dir.path())
            .args(["run", "5"])
            .assert()
            .success();

        conductor()
            .current_dir(dir.path())
            .args(["status", "5", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ready_for_merge"))
            .stdout(predicate::str::contains("completed"));

        let runs = fs::read_dir(dir.path().join(".conductor/logs/runs"))
            .unwrap()
            .count();
        assert_eq!(runs, 1);
    }

    #[test]
    fn test_failing_phase_exits_nonzero_and_stops_queue() {
        let dir = create_temp_project();
        write_agent_config(&dir, "[ \"$1\" != \"/exec $2\" ]");

        conductor()
            .current_dir(dir.path())
            .args(["run", "1", "2"])
            .assert()
            .code(1);

        let state = fs::read_to_string(dir.path().join(".conductor/state.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&state).unwrap();
        let first = &doc["issues"]["1"];
        assert_eq!(first["status"], "blocked");
        assert_eq!(first["phases"]["spec"]["status"], "completed");
        assert_eq!(first["phases"]["exec"]["status"], "failed");
        assert!(first["phases"].get("qa").is_none());
        assert_eq!(doc["issues"]["2"]["status"], "not_started");
    }

    #[test]
    fn test_fan_out_continues_after_failure() {
        let dir = create_temp_project();
        write_agent_config(&dir, "[ \"$2\" != 1 ]");

        conductor()
            .current_dir(dir.path())
            .args(["run", "1", "2", "--mode", "fan-out", "--phases", "exec"])
            .assert()
            .code(1);

        let state = fs::read_to_string(dir.path().join(".conductor/state.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&state).unwrap();
        assert_eq!(doc["issues"]["1"]["status"], "blocked");
        assert_eq!(doc["issues"]["2"]["phases"]["exec"]["status"], "completed");
    }

    #[test]
    fn test_state_write_failure_stops_run() {
        let dir = create_temp_project();
        // The spec phase swaps the state document for a directory, so the
        // next save cannot land.
        write_agent_config(
            &dir,
            "echo \"$1\" >> calls.log; case \"$1\" in /spec*) sleep 0.3; rm -f .conductor/state.json; mkdir .conductor/state.json ;; *) sleep 5 ;; esac",
        );

        conductor()
            .current_dir(dir.path())
            .args(["run", "1", "2", "--phases", "spec,exec"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Failed to persist workflow state"))
            .stderr(predicate::str::contains("state.json"));

        let calls = fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(!calls.contains(" 2"), "issue 2 should never start: {}", calls);
    }
}

// =============================================================================
// State
// =============================================================================

mod state {
    use super::*;

    #[test]
    fn test_status_on_empty_project() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No issues tracked"));
    }

    #[test]
    fn test_corrupt_state_is_fatal() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".conductor")).unwrap();
        fs::write(dir.path().join(".conductor/state.json"), "{ not json").unwrap();

        conductor()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("not valid JSON"));

        // The broken document is left untouched for the user to inspect.
        let content = fs::read_to_string(dir.path().join(".conductor/state.json")).unwrap();
        assert_eq!(content, "{ not json");
    }

    #[test]
    fn test_rebuild_restores_state_from_run_logs() {
        let dir = create_temp_project();
        write_agent_config(&dir, "exit 0");

        conductor()
            .current_dir(dir.path())
            .args(["run", "9", "--phases", "spec"])
            .assert()
            .success();

        conductor()
            .current_dir(dir.path())
            .args(["state", "rebuild"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));

        fs::remove_file(dir.path().join(".conductor/state.json")).unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["state", "rebuild"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Rebuilt 1 issue(s)"));

        conductor()
            .current_dir(dir.path())
            .args(["status", "9", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("in_progress"));
    }

    #[test]
    fn test_cleanup_on_empty_project() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["cleanup", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to clean up"));
    }

    #[test]
    fn test_reconcile_on_empty_project() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .arg("reconcile")
            .assert()
            .success()
            .stdout(predicate::str::contains("No issues are waiting for merge"));
    }
}

// =============================================================================
// QA cache
// =============================================================================

mod cache {
    use super::*;

    #[test]
    fn test_cache_status_lists_every_kind() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["cache", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("type-safety"))
            .stdout(predicate::str::contains("missing-tests"))
            .stdout(predicate::str::contains("build"));
    }

    #[test]
    fn test_cache_get_miss_exits_nonzero() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["cache", "get", "scope"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("not-found"));
    }

    #[test]
    fn test_cache_set_then_clear() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["cache", "set", "size", "--message", "small diff"])
            .assert()
            .success();

        let doc = fs::read_to_string(dir.path().join(".conductor/qa-cache.json")).unwrap();
        assert!(doc.contains("small diff"));

        conductor()
            .current_dir(dir.path())
            .args(["cache", "clear", "size"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cleared size"));

        conductor()
            .current_dir(dir.path())
            .args(["cache", "clear"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cleared 0 cached result(s)"));
    }

    #[test]
    fn test_cache_set_uses_configured_ttl() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".conductor")).unwrap();
        fs::write(
            dir.path().join(".conductor/conductor.toml"),
            "[cache]\nttl_secs = 123\n",
        )
        .unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["cache", "set", "build"])
            .assert()
            .success();

        let doc = fs::read_to_string(dir.path().join(".conductor/qa-cache.json")).unwrap();
        assert!(doc.contains("\"ttl_secs\": 123"), "{}", doc);
    }

    #[test]
    fn test_cache_rejects_unknown_kind() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["cache", "clear", "lint"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown check kind"));
    }

    #[test]
    fn test_corrupt_cache_degrades_to_empty() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".conductor")).unwrap();
        fs::write(dir.path().join(".conductor/qa-cache.json"), "garbage").unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["cache", "get", "build"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("not-found"));
    }
}

// =============================================================================
// Signal-driven shutdown
// =============================================================================

#[cfg(unix)]
mod shutdown {
    use super::*;
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;
    use std::path::Path;
    use std::process::{Child, ExitStatus, Stdio};
    use std::time::{Duration, Instant};

    fn spawn_conductor(dir: &TempDir, args: &[&str]) -> Child {
        std::process::Command::new(env!("CARGO_BIN_EXE_conductor"))
            .current_dir(dir.path())
            .args(args)
            .env_remove("CONDUCTOR_AGENT_CMD")
            .env_remove("CONDUCTOR_PROJECT_DIR")
            .env_remove("RUST_LOG")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn wait_for_file(path: &Path) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !path.exists() {
            assert!(Instant::now() < deadline, "{} never appeared", path.display());
            std::thread::sleep(Duration::from_millis(25));
        }
        // Let the writer finish.
        std::thread::sleep(Duration::from_millis(100));
    }

    fn wait_for_exit(child: &mut Child) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            if let Some(status) = child.try_wait().unwrap() {
                return status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                panic!("conductor did not exit after the signal");
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn interrupt(child: &Child) {
        kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
    }

    #[test]
    fn test_sigint_cancels_running_phase_and_exits_130() {
        let dir = create_temp_project();
        write_agent_config(&dir, "touch \"started-$2\"; sleep 30");

        let mut child = spawn_conductor(&dir, &["run", "1", "2", "--phases", "spec,exec"]);
        wait_for_file(&dir.path().join("started-1"));
        interrupt(&child);

        let status = wait_for_exit(&mut child);
        assert_eq!(status.code(), Some(130));

        let state = fs::read_to_string(dir.path().join(".conductor/state.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&state).unwrap();
        let spec = &doc["issues"]["1"]["phases"]["spec"];
        assert_eq!(spec["status"], "failed");
        assert!(spec["error"].as_str().unwrap().contains("was cancelled"));
        assert!(doc["issues"]["1"]["phases"].get("exec").is_none());
        assert_eq!(doc["issues"]["2"]["status"], "not_started");

        let logs = dir.path().join(".conductor/logs");
        assert!(!logs.join("current-run.json").exists());
        assert_eq!(fs::read_dir(logs.join("runs")).unwrap().count(), 1);
        assert!(!dir.path().join("started-2").exists());
    }

    #[test]
    fn test_second_sigint_forces_exit_1() {
        let dir = create_temp_project();
        // Ignores SIGTERM, so cleanup sits in the kill grace period.
        write_agent_config_with_grace(
            &dir,
            "trap \"\" TERM; echo $$ > agent.pid; touch started; while true; do sleep 0.1; done",
            20,
        );

        let mut child = spawn_conductor(&dir, &["run", "1", "--phases", "spec"]);
        wait_for_file(&dir.path().join("started"));
        interrupt(&child);
        std::thread::sleep(Duration::from_millis(300));
        interrupt(&child);

        let status = wait_for_exit(&mut child);

        // The forced exit leaves the agent group behind.
        let pgid: i32 = fs::read_to_string(dir.path().join("agent.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);

        assert_eq!(status.code(), Some(1));
    }
}
