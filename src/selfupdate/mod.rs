//! Versioned self-modification with validation and automatic rollback.
//!
//! Two trees: the *live* code this process shipped with, and a *backup*
//! under `<data>/code/backend` managed as a git repository (one commit per
//! version). Boot runs the recovery protocol: merge newly shipped files,
//! honor the revert flag, validate, and arm the flag again so a crash
//! before the health check rolls the next boot back.

pub mod git;

use crate::safety::SafetyValidator;
use anyhow::{bail, Context, Result};
use sha3::{Digest, Sha3_256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Files always taken from the newly shipped image during a merge, even when
/// the agent has modified its copy.
const INFRASTRUCTURE_PATHS: &[&str] = &[
    "Cargo.toml",
    "src/safety/rules.rs",
    "src/safety/validator.rs",
    "src/memory/blob.rs",
];

/// Files the validation step requires to exist and be non-empty.
const REQUIRED_PATHS: &[&str] = &["Cargo.toml", "src/main.rs", "src/lib.rs"];

/// A requested source modification.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UpdateProposal {
    pub paths: Vec<String>,
    pub new_contents: Vec<String>,
    pub message: String,
}

/// What boot did, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct BootReport {
    pub seeded: bool,
    pub image_merged: bool,
    pub reverted: bool,
    pub validation_failed: bool,
}

pub struct SelfUpdater {
    live_root: PathBuf,
    backup_root: PathBuf,
    code_dir: PathBuf,
    validate_command: Option<String>,
    remote_url: Option<String>,
    remote_token: Option<String>,
}

impl SelfUpdater {
    pub fn new(live_root: PathBuf, code_dir: PathBuf, validate_command: Option<String>) -> Self {
        Self {
            backup_root: code_dir.join("backend"),
            live_root,
            code_dir,
            validate_command,
            remote_url: None,
            remote_token: None,
        }
    }

    /// Mirror accepted versions to a remote repository (best effort).
    pub fn with_remote(mut self, url: Option<String>, token: Option<String>) -> Self {
        self.remote_url = url;
        self.remote_token = token;
        self
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    fn hash_marker(&self) -> PathBuf {
        self.code_dir.join(".image_hash")
    }

    fn revert_marker(&self) -> PathBuf {
        self.code_dir.join(".needs_revert")
    }

    fn healthy_marker(&self) -> PathBuf {
        self.code_dir.join(".healthy")
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Apply a proposal: validate paths, write to the backup, commit with a
    /// version bump, and mirror into the live tree.
    pub fn propose(
        &self,
        validator: &SafetyValidator,
        proposal: &UpdateProposal,
    ) -> Result<String> {
        if proposal.paths.len() != proposal.new_contents.len() {
            bail!(
                "Proposal has {} paths but {} contents",
                proposal.paths.len(),
                proposal.new_contents.len()
            );
        }
        if proposal.paths.is_empty() {
            bail!("Proposal names no paths");
        }
        validator.check_update_paths(&proposal.paths)?;

        for (path, content) in proposal.paths.iter().zip(&proposal.new_contents) {
            let backup = self.backup_root.join(path);
            if let Some(parent) = backup.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&backup, content)
                .with_context(|| format!("Failed to write {}", backup.display()))?;

            // Mirror into the live tree so the change rides the next restart.
            let live = self.live_root.join(path);
            if let Some(parent) = live.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&live, content)
                .with_context(|| format!("Failed to write {}", live.display()))?;
        }

        let version = self.bump_version()?;
        git::commit_all(
            &self.backup_root,
            &format!("v{version}: {}", proposal.message),
        )?;

        if let Some(url) = &self.remote_url {
            if let Err(err) =
                git::push_remote(&self.backup_root, url, self.remote_token.as_deref())
            {
                warn!("Remote push failed (continuing): {err:#}");
            }
        }

        let head = git::head_commit(&self.backup_root).unwrap_or_default();
        let summary = format!(
            "Updated {} file(s) as v{version} ({}): {}",
            proposal.paths.len(),
            &head[..head.len().min(8)],
            proposal.paths.join(", ")
        );
        info!("Self-update accepted: {summary}");
        Ok(summary)
    }

    fn bump_version(&self) -> Result<u64> {
        let path = self.backup_root.join("VERSION");
        let current = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        std::fs::write(&path, format!("{next}\n"))?;
        Ok(next)
    }

    /// Recent version log entries from the backup repository.
    pub fn version_log(&self, limit: usize) -> Result<Vec<String>> {
        git::log(&self.backup_root, limit)
    }

    // -----------------------------------------------------------------------
    // Boot protocol
    // -----------------------------------------------------------------------

    /// Run the full boot sequence. On return the live tree is the version
    /// the process should run, and the revert flag is armed.
    pub fn boot(&self) -> Result<BootReport> {
        std::fs::create_dir_all(&self.code_dir)?;
        let mut report = BootReport::default();

        // First boot: seed backup from the shipped image.
        if !self.backup_root.join(".git").exists() {
            info!("Seeding code backup from the shipped image");
            copy_tree(&self.live_root, &self.backup_root)?;
            git::init_repo(&self.backup_root)?;
            git::commit_all(&self.backup_root, "seed: shipped image")?;
            std::fs::write(self.hash_marker(), self.image_hash()?)?;
            report.seeded = true;
        }

        // Merge a newly shipped image into the backup.
        let shipped_hash = self.image_hash()?;
        let stored_hash = std::fs::read_to_string(self.hash_marker()).unwrap_or_default();
        if stored_hash.trim() != shipped_hash {
            info!("Shipped image changed; merging into backup");
            self.merge_image()?;
            git::commit_all(&self.backup_root, "image update")?;
            std::fs::write(self.hash_marker(), &shipped_hash)?;
            report.image_merged = true;
        }

        // Restore backup -> live.
        self.sync_backup_to_live()?;

        // A surviving revert flag means the last boot never reached healthy.
        if self.revert_marker().exists() {
            warn!("Revert flag present; rolling back the last version");
            git::revert_last(&self.backup_root)?;
            std::fs::remove_file(self.revert_marker()).ok();
            self.sync_backup_to_live()?;
            report.reverted = true;
        }

        // Validate what we are about to run.
        if let Err(err) = self.validate_live() {
            warn!("Live code failed validation ({err:#}); rolling back");
            git::revert_last(&self.backup_root)?;
            self.sync_backup_to_live()?;
            std::fs::remove_file(self.revert_marker()).ok();
            report.validation_failed = true;
            self.validate_live()
                .context("Backup is also invalid after rollback")?;
        }

        // Arm the flag; a healthy process clears it after 30 s of liveness.
        std::fs::write(self.revert_marker(), "armed\n")?;
        std::fs::remove_file(self.healthy_marker()).ok();
        Ok(report)
    }

    /// Mark the running version healthy: clears the revert flag.
    pub fn mark_healthy(&self) -> Result<()> {
        std::fs::write(self.healthy_marker(), "ok\n")?;
        std::fs::remove_file(self.revert_marker()).ok();
        info!("Version marked healthy");
        Ok(())
    }

    /// Validation stand-in for an import check: required files present and
    /// readable, plus an optional configured command.
    fn validate_live(&self) -> Result<()> {
        for required in REQUIRED_PATHS {
            let path = self.live_root.join(required);
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Missing or unreadable: {required}"))?;
            if contents.trim().is_empty() {
                bail!("Required file is empty: {required}");
            }
        }
        if let Some(command) = &self.validate_command {
            let mut parts = command.split_whitespace();
            let Some(program) = parts.next() else {
                return Ok(());
            };
            let output = std::process::Command::new(program)
                .args(parts)
                .current_dir(&self.live_root)
                .output()
                .with_context(|| format!("Failed to run validate command: {command}"))?;
            if !output.status.success() {
                bail!(
                    "Validate command failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
        }
        Ok(())
    }

    fn merge_image(&self) -> Result<()> {
        for relative in walk_files(&self.live_root)? {
            let src = self.live_root.join(&relative);
            let dst = self.backup_root.join(&relative);
            let relative_str = relative.to_string_lossy().replace('\\', "/");
            let is_infra = INFRASTRUCTURE_PATHS.iter().any(|p| relative_str == *p);
            // Agent-modified files survive the merge unless they are
            // infrastructure; everything new ships in.
            if !dst.exists() || is_infra {
                if let Some(parent) = dst.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&src, &dst)?;
            }
        }
        Ok(())
    }

    fn sync_backup_to_live(&self) -> Result<()> {
        for relative in walk_files(&self.backup_root)? {
            if relative.starts_with("VERSION") {
                continue;
            }
            let src = self.backup_root.join(&relative);
            let dst = self.live_root.join(&relative);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src, &dst)?;
        }
        Ok(())
    }

    /// Stable hash of the shipped image: sorted relative paths + contents.
    fn image_hash(&self) -> Result<String> {
        let mut hasher = Sha3_256::new();
        for relative in walk_files(&self.live_root)? {
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(std::fs::read(self.live_root.join(&relative))?);
        }
        let digest = hasher.finalize();
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

/// Relative paths of all regular files under `root`, sorted, skipping VCS
/// and build artifacts.
fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == ".git" || name == "target" || name == "node_modules" {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    out.push(relative.to_path_buf());
                }
            }
        }
    }
    out.sort();
    Ok(out)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for relative in walk_files(src)? {
        let from = src.join(&relative);
        let to = dst.join(&relative);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&from, &to)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::SafetyRules;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// A minimal shipped image satisfying the structural validation.
    fn seed_live(root: &Path) {
        std::fs::create_dir_all(root.join("src/tools")).unwrap();
        std::fs::write(root.join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        std::fs::write(root.join("src/main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub mod tools;\n").unwrap();
        std::fs::write(root.join("src/tools/mod.rs"), "// tools\n").unwrap();
    }

    fn setup() -> (tempfile::TempDir, SelfUpdater, SafetyValidator) {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live");
        seed_live(&live);
        let updater = SelfUpdater::new(live, dir.path().join("code"), None);
        (dir, updater, SafetyValidator::new(SafetyRules::global()))
    }

    #[test]
    fn first_boot_seeds_backup_and_arms_flag() {
        if !git_available() {
            return;
        }
        let (_dir, updater, _) = setup();
        let report = updater.boot().unwrap();
        assert!(report.seeded);
        assert!(updater.backup_root().join("src/main.rs").exists());
        assert!(updater.revert_marker().exists());

        updater.mark_healthy().unwrap();
        assert!(!updater.revert_marker().exists());
        assert!(updater.healthy_marker().exists());
    }

    #[test]
    fn proposal_writes_backup_and_live_with_version_bump() {
        if !git_available() {
            return;
        }
        let (_dir, updater, validator) = setup();
        updater.boot().unwrap();

        let proposal = UpdateProposal {
            paths: vec!["src/tools/mod.rs".into()],
            new_contents: vec!["// tools v2\n".into()],
            message: "extend tools".into(),
        };
        let summary = updater.propose(&validator, &proposal).unwrap();
        assert!(summary.contains("v1"));

        let backup = std::fs::read_to_string(updater.backup_root().join("src/tools/mod.rs")).unwrap();
        assert_eq!(backup, "// tools v2\n");

        let log = updater.version_log(5).unwrap();
        assert!(log[0].contains("extend tools"));
    }

    #[test]
    fn proposal_touching_rules_is_rejected_and_bytes_unchanged() {
        if !git_available() {
            return;
        }
        let (dir, updater, validator) = setup();
        updater.boot().unwrap();

        // Plant a rules file so we can check it stays untouched.
        let rules_path = dir.path().join("live/src/safety/rules.rs");
        std::fs::create_dir_all(rules_path.parent().unwrap()).unwrap();
        std::fs::write(&rules_path, "pub const RULES: u8 = 7;\n").unwrap();

        let proposal = UpdateProposal {
            paths: vec!["src/safety/rules.rs".into()],
            new_contents: vec!["// gutted\n".into()],
            message: "remove safety".into(),
        };
        let err = updater.propose(&validator, &proposal).unwrap_err();
        assert!(err.to_string().contains("safety rule 4"));
        assert_eq!(
            std::fs::read_to_string(&rules_path).unwrap(),
            "pub const RULES: u8 = 7;\n"
        );
    }

    #[test]
    fn broken_update_rolls_back_on_next_boot() {
        if !git_available() {
            return;
        }
        let (dir, updater, validator) = setup();
        updater.boot().unwrap();
        updater.mark_healthy().unwrap();

        let good_main = std::fs::read_to_string(dir.path().join("live/src/main.rs")).unwrap();

        // A structurally broken update: empties a required file.
        let proposal = UpdateProposal {
            paths: vec!["src/main.rs".into()],
            new_contents: vec!["".into()],
            message: "oops".into(),
        };
        updater.propose(&validator, &proposal).unwrap();

        // Next boot validates, fails, and resets to the commit before the
        // broken write; live gets re-synced from the restored backup.
        let report = updater.boot().unwrap();
        assert!(report.validation_failed);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("live/src/main.rs")).unwrap(),
            good_main
        );
        assert_eq!(
            std::fs::read_to_string(updater.backup_root().join("src/main.rs")).unwrap(),
            good_main
        );
    }

    #[test]
    fn crash_before_health_check_reverts_next_boot() {
        if !git_available() {
            return;
        }
        let (dir, updater, validator) = setup();
        updater.boot().unwrap();
        updater.mark_healthy().unwrap();

        // A valid-looking update that nevertheless crashes at runtime.
        let proposal = UpdateProposal {
            paths: vec!["src/lib.rs".into()],
            new_contents: vec!["pub mod tools; // crashes at runtime\n".into()],
            message: "risky change".into(),
        };
        updater.propose(&validator, &proposal).unwrap();

        // Boot arms the flag; the process "crashes" (mark_healthy never runs).
        updater.boot().unwrap();

        // Next boot sees the armed flag and rolls back.
        let report = updater.boot().unwrap();
        assert!(report.reverted);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("live/src/lib.rs")).unwrap(),
            "pub mod tools;\n"
        );
    }

    #[test]
    fn image_change_is_merged_without_clobbering_agent_edits() {
        if !git_available() {
            return;
        }
        let (dir, updater, validator) = setup();
        updater.boot().unwrap();
        updater.mark_healthy().unwrap();

        // Agent modifies a file.
        let proposal = UpdateProposal {
            paths: vec!["src/tools/mod.rs".into()],
            new_contents: vec!["// agent's version\n".into()],
            message: "agent edit".into(),
        };
        updater.propose(&validator, &proposal).unwrap();

        // Operator ships a new image: new file + changed tools file.
        std::fs::write(dir.path().join("live/src/new_module.rs"), "// shipped\n").unwrap();
        std::fs::write(dir.path().join("live/src/tools/mod.rs"), "// shipped v3\n").unwrap();

        let report = updater.boot().unwrap();
        assert!(report.image_merged);
        // New shipped file arrives; the agent's edit survives the merge.
        assert!(updater.backup_root().join("src/new_module.rs").exists());
        assert_eq!(
            std::fs::read_to_string(updater.backup_root().join("src/tools/mod.rs")).unwrap(),
            "// agent's version\n"
        );
    }
}
