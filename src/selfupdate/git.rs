//! Git plumbing for the code backup repository.
//!
//! The backup directory is a plain git repo; every accepted version is one
//! commit, and rollback is a hard reset to the previous commit.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

const GIT_NAME: &str = "vigil";
const GIT_EMAIL: &str = "vigil@localhost";

fn git(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .env("GIT_AUTHOR_NAME", GIT_NAME)
        .env("GIT_AUTHOR_EMAIL", GIT_EMAIL)
        .env("GIT_COMMITTER_NAME", GIT_NAME)
        .env("GIT_COMMITTER_EMAIL", GIT_EMAIL)
        .current_dir(dir)
        .output()
        .with_context(|| format!("Failed to run git {}", args.join(" ")))
}

/// Initialize the backup as a git repo if it is not one already.
pub fn init_repo(dir: &Path) -> Result<()> {
    if dir.join(".git").exists() {
        debug!("Backup repo already initialized at {}", dir.display());
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    let output = git(dir, &["init"])?;
    if !output.status.success() {
        bail!(
            "git init failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// Stage everything and commit. A clean tree is a silent no-op.
pub fn commit_all(dir: &Path, message: &str) -> Result<()> {
    let add = git(dir, &["add", "-A"])?;
    if !add.status.success() {
        warn!("git add warning: {}", String::from_utf8_lossy(&add.stderr));
    }

    let status = git(dir, &["status", "--porcelain"])?;
    if String::from_utf8_lossy(&status.stdout).trim().is_empty() {
        debug!("No changes to commit");
        return Ok(());
    }

    let commit = git(dir, &["commit", "-m", message])?;
    if !commit.status.success() {
        let stderr = String::from_utf8_lossy(&commit.stderr);
        if !stderr.contains("nothing to commit") {
            bail!("git commit failed: {stderr}");
        }
    } else {
        debug!("Committed backup: {message}");
    }
    Ok(())
}

/// Hard-reset to the commit before HEAD (rollback of one version).
pub fn revert_last(dir: &Path) -> Result<()> {
    let output = git(dir, &["reset", "--hard", "HEAD~1"])?;
    if !output.status.success() {
        bail!(
            "git reset failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    // Files deleted by the reverted commit would linger as untracked copies.
    let clean = git(dir, &["clean", "-fd"])?;
    if !clean.status.success() {
        warn!(
            "git clean warning: {}",
            String::from_utf8_lossy(&clean.stderr)
        );
    }
    Ok(())
}

/// Current HEAD commit hash.
pub fn head_commit(dir: &Path) -> Result<String> {
    let output = git(dir, &["rev-parse", "HEAD"])?;
    if !output.status.success() {
        bail!("git rev-parse failed");
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// One-line log entries, newest first.
pub fn log(dir: &Path, limit: usize) -> Result<Vec<String>> {
    let count = format!("-{limit}");
    let output = git(dir, &["log", "--oneline", &count])?;
    if !output.status.success() {
        bail!("git log failed");
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(String::from)
        .collect())
}

/// Push the backup to a remote, embedding the token in the URL when given.
pub fn push_remote(dir: &Path, url: &str, token: Option<&str>) -> Result<()> {
    let push_url = match token {
        Some(token) if url.starts_with("https://") => {
            url.replacen("https://", &format!("https://{token}@"), 1)
        }
        _ => url.to_string(),
    };
    let output = git(dir, &["push", &push_url, "HEAD"])?;
    if !output.status.success() {
        bail!(
            "git push failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}
