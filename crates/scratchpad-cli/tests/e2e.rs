//! End-to-end tests for scratchpad CLI commands.
//!
//! These tests verify that the CLI produces expected output
//! when run against real snippet files.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// A temporary directory with a snippet, an empty package cache and a feed.
struct TestSnippet {
    temp_dir: TempDir,
    snippet_path: PathBuf,
}

impl TestSnippet {
    fn new(filename: &str, source: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let snippet_path = temp_dir.path().join(filename);
        fs::write(&snippet_path, source).expect("Failed to write snippet");
        fs::create_dir_all(temp_dir.path().join("feed")).expect("Failed to create feed");

        Self {
            temp_dir,
            snippet_path,
        }
    }

    fn path(&self) -> &str {
        self.snippet_path.to_str().unwrap()
    }

    fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    fn add_feed_package(&self, id: &str, version: &str) {
        let dir = self.root().join("feed").join(id).join(version);
        fs::create_dir_all(&dir).expect("Failed to create package");
        fs::write(dir.join("readme.txt"), id).expect("Failed to write package file");
    }

    /// `scratchpad` with the package environment pointed into the temp dir.
    fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("scratchpad").expect("Failed to find scratchpad binary");
        cmd.env("SCRATCHPAD_PACKAGE_CACHE", self.root().join("cache"))
            .env("SCRATCHPAD_PACKAGE_FEED", self.root().join("feed"))
            .env_remove("SCRATCHPAD_PACKAGE_COMMAND")
            .env_remove("SCRATCHPAD_WORKER_PATH")
            .env_remove("RUST_LOG");
        cmd
    }
}

/// The worker binary. Uses the one next to the CLI binary when the workspace
/// built it, otherwise builds it once into a separate target directory.
fn worker_binary() -> PathBuf {
    static WORKER: OnceLock<PathBuf> = OnceLock::new();
    WORKER.get_or_init(build_worker).clone()
}

fn build_worker() -> PathBuf {
    let name = if cfg!(windows) {
        "scratchpad-worker.exe"
    } else {
        "scratchpad-worker"
    };
    let cli = assert_cmd::cargo::cargo_bin("scratchpad");
    let profile_dir = cli.parent().expect("CLI binary should have a parent directory");
    let beside_cli = profile_dir.join(name);
    if beside_cli.exists() {
        return beside_cli;
    }

    let release = profile_dir.ends_with("release");
    let target_dir = profile_dir
        .parent()
        .unwrap_or(profile_dir)
        .join("e2e-worker");
    let mut build = std::process::Command::new(env!("CARGO"));
    build
        .args(["build", "-p", "scratchpad-worker", "--bin", "scratchpad-worker"])
        .arg("--target-dir")
        .arg(&target_dir);
    if release {
        build.arg("--release");
    }
    let status = build.status().expect("Failed to run cargo build");
    assert!(status.success(), "building scratchpad-worker failed");

    let worker = target_dir
        .join(if release { "release" } else { "debug" })
        .join(name);
    assert!(worker.exists(), "scratchpad-worker not found at {}", worker.display());
    worker
}

// =============================================================================
// scratchpad run Tests
// =============================================================================

#[test]
fn test_run_nonexistent_snippet() {
    Command::cargo_bin("scratchpad")
        .expect("Failed to find scratchpad binary")
        .args(["run", "/nonexistent/snippet.sp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_run_compile_error_fails_before_launch() {
    let snippet = TestSnippet::new("broken.sp", "print(1 +)\n");

    snippet
        .command()
        .args(["run", snippet.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("1:10"))
        .stderr(predicate::str::contains("compilation failed"));
}

#[test]
fn test_run_missing_package_fails() {
    let snippet = TestSnippet::new("deps.sp", "#r \"nuget: Missing, 1.0.0\"\nprint(1)\n");

    snippet
        .command()
        .args(["run", snippet.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Package restore failed"));
}

#[test]
fn test_run_unknown_platform() {
    let snippet = TestSnippet::new("simple.sp", "print(1)\n");

    snippet
        .command()
        .args(["run", snippet.path(), "--platform", "arm64-core"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown architecture"));
}

#[test]
fn test_run_prints_values() {
    let worker = worker_binary();
    let snippet = TestSnippet::new(
        "simple.sp",
        "let x = 20\nprint(x + 1)\ndump(\"xs\", [1, \"two\"])\n",
    );

    snippet
        .command()
        .env("SCRATCHPAD_WORKER_PATH", &worker)
        .args(["run", snippet.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("21"))
        .stdout(predicate::str::contains("[1, \"two\"]"))
        .stdout(predicate::str::contains("Completed"));
}

#[test]
fn test_run_runtime_error_reports_line() {
    let worker = worker_binary();
    let snippet = TestSnippet::new("error.sp", "print(1)\nprint(missing)\n");

    snippet
        .command()
        .env("SCRATCHPAD_WORKER_PATH", &worker)
        .args(["run", snippet.path()])
        .assert()
        .success()
        .stderr(predicate::str::contains("NameError (line 2)"));
}

#[test]
fn test_run_restores_then_runs() {
    let worker = worker_binary();
    let snippet = TestSnippet::new("deps.sp", "#r \"nuget: Foo, 1.0.0\"\nprint(\"ok\")\n");
    snippet.add_feed_package("Foo", "1.0.0");

    snippet
        .command()
        .env("SCRATCHPAD_WORKER_PATH", &worker)
        .args(["run", snippet.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Restoring 1 package(s): Foo@1.0.0"))
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn test_run_timeout_cancels() {
    let worker = worker_binary();
    let snippet = TestSnippet::new("slow.sp", "print(\"start\")\nsleep(60000)\n");

    snippet
        .command()
        .env("SCRATCHPAD_WORKER_PATH", &worker)
        .args(["run", snippet.path(), "--timeout", "1"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .failure()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("Canceled"));
}

#[test]
fn test_run_exit_is_a_crash() {
    let worker = worker_binary();
    let snippet = TestSnippet::new("exit.sp", "exit(3)\n");

    snippet
        .command()
        .env("SCRATCHPAD_WORKER_PATH", &worker)
        .args(["run", snippet.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("WorkerCrashed"));
}

// =============================================================================
// scratchpad emit Tests
// =============================================================================

#[test]
fn test_emit_writes_default_artifact() {
    let snippet = TestSnippet::new("simple.sp", "print(1 + 1)\n");

    snippet
        .command()
        .args(["emit", snippet.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));

    let artifact = snippet
        .root()
        .join(".scratchpad")
        .join("build")
        .join("simple.payload.json");
    let payload = fs::read_to_string(&artifact).expect("Artifact should exist");
    assert!(payload.contains("print"));
}

#[test]
fn test_emit_custom_output() {
    let snippet = TestSnippet::new("simple.sp", "print(1)\n");
    let output = snippet.root().join("out").join("payload.json");

    snippet
        .command()
        .args(["emit", snippet.path(), "-o", output.to_str().unwrap()])
        .assert()
        .success();

    assert!(output.exists());
}

#[test]
fn test_emit_reports_diagnostics() {
    let snippet = TestSnippet::new("broken.sp", "print(1\nfoo(2)\n");

    snippet
        .command()
        .args(["emit", snippet.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown function 'foo'"))
        .stderr(predicate::str::contains("Compilation failed with 2 error(s)"));
}

#[test]
fn test_emit_warning_still_writes() {
    let snippet = TestSnippet::new("warn.sp", "1 + 1\n");

    snippet
        .command()
        .args(["emit", snippet.path()])
        .assert()
        .success()
        .stderr(predicate::str::contains("warning"));
}

// =============================================================================
// scratchpad restore / platforms Tests
// =============================================================================

#[test]
fn test_restore_from_feed() {
    let snippet = TestSnippet::new("deps.sp", "#r \"nuget: Foo, 1.0.0\"\n#r \"nuget: Bar/2.0.0\"\n");
    snippet.add_feed_package("Foo", "1.0.0");
    snippet.add_feed_package("Bar", "2.0.0");

    snippet
        .command()
        .args(["restore", snippet.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Restored Foo@1.0.0"))
        .stdout(predicate::str::contains("Restored Bar@2.0.0"));

    assert!(snippet.root().join("cache").join("foo").join("1.0.0").join(".complete").exists());

    // Second restore installs nothing.
    snippet
        .command()
        .args(["restore", snippet.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Restoring").not());
}

#[cfg(unix)]
#[test]
fn test_restore_with_command() {
    let snippet = TestSnippet::new("deps.sp", "#r \"nuget: Foo, 1.0.0\"\n");
    snippet.add_feed_package("Foo", "1.0.0");
    let command = format!(
        "cp -R {}/{{id}}/{{version}}/. {{dest}}",
        snippet.root().join("feed").display()
    );

    snippet
        .command()
        .env("SCRATCHPAD_PACKAGE_COMMAND", command)
        .env("SCRATCHPAD_PACKAGE_FEED", snippet.root().join("no-such-feed"))
        .args(["restore", snippet.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Restored Foo@1.0.0"));

    let installed = snippet.root().join("cache").join("foo").join("1.0.0");
    assert!(installed.join("readme.txt").exists());
}

#[test]
fn test_restore_without_references() {
    let snippet = TestSnippet::new("plain.sp", "print(1)\n");

    snippet
        .command()
        .args(["restore", snippet.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("No package references"));
}

#[test]
fn test_platforms_lists_known() {
    Command::cargo_bin("scratchpad")
        .expect("Failed to find scratchpad binary")
        .arg("platforms")
        .assert()
        .success()
        .stdout(predicate::str::contains("x64-core"))
        .stdout(predicate::str::contains("x86-desktop"));
}
