//! Throwaway repositories for tests that shell out to real git.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

pub fn run_git(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Initializes a repository with one commit on `main` and a local identity.
/// Returns the guard and the canonical repository root.
pub fn init_repo() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = fs::canonicalize(dir.path()).expect("canonicalize tempdir");
    run_git(&root, &["init", "--quiet"]);
    run_git(&root, &["config", "user.name", "Test User"]);
    run_git(&root, &["config", "user.email", "test@example.com"]);
    run_git(&root, &["config", "commit.gpgsign", "false"]);
    run_git(&root, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    commit_file(&root, "README.md", "init\n", "init");
    (dir, root)
}

pub fn commit_file(cwd: &Path, file: &str, contents: &str, message: &str) {
    fs::write(cwd.join(file), contents).expect("write file");
    run_git(cwd, &["add", file]);
    run_git(cwd, &["commit", "--quiet", "-m", message]);
}
