//! Post-cycle persistence: stage and commit configured working directories.
//!
//! Runs after the lock is released. One commit per directory per cycle, and
//! only when staging actually picked something up. Failures here are logged
//! and swallowed; a broken git setup must not take down dispatch.

use anyhow::Result;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Stage and commit each configured directory. Returns the number of commits
/// made.
pub async fn persist_dirs(dirs: &[impl AsRef<Path>], message: &str) -> usize {
    let mut commits = 0;
    for dir in dirs {
        let dir = dir.as_ref();
        match commit_dir(dir, message).await {
            Ok(true) => {
                info!(dir = %dir.display(), "committed cycle changes");
                commits += 1;
            }
            Ok(false) => debug!(dir = %dir.display(), "nothing to commit"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "persist failed"),
        }
    }
    commits
}

/// Stage everything under `dir` and commit iff anything is staged.
async fn commit_dir(dir: &Path, message: &str) -> Result<bool> {
    git(dir, &["add", "-A"]).await?;

    // Exit 0 means the index matches HEAD, nothing staged.
    let staged = !git_status(dir, &["diff", "--cached", "--quiet"]).await?;
    if !staged {
        return Ok(false);
    }

    git(dir, &["commit", "-m", message]).await?;
    Ok(true)
}

async fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Run git and report only whether it exited zero.
async fn git_status(dir: &Path, args: &[&str]) -> Result<bool> {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await?;
    Ok(status.status.success())
}
