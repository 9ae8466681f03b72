//! Bare-repository provisioning driven by the access-rights table.
//!
//! Every repository declared under `accessRights` is guaranteed to exist
//! on disk in the depth-sharded layout.  Runs as a settings-change
//! observer: synchronously, with every failure logged and absorbed, since
//! a repository that cannot be provisioned must not take the store down.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::gateway::path;
use crate::settings::model::Settings;

/// Lightweight bare-repo heuristic: a directory with a `HEAD` file.
pub fn is_bare_repository(dir: &Path) -> bool {
    dir.is_dir() && dir.join("HEAD").is_file()
}

/// Ensure every repository named in `accessRights` exists on disk.
///
/// Observer entry point; never fails.  Repositories that already exist are
/// skipped, so calling this twice with an unchanged rights list is a no-op.
pub fn ensure_declared_repositories(settings: &Settings) {
    let root = PathBuf::from(&settings.repositories_directory);
    let git = if settings.git_command_file_path.is_empty() {
        "git".to_string()
    } else {
        settings.git_command_file_path.clone()
    };

    for right in &settings.access_rights {
        if let Err(err) = provision_repository(&git, &root, &right.path) {
            error!(path = %right.path, error = %err, "failed to provision repository");
        }
    }
}

/// Create the bare repository for one logical access-right path, enabling
/// push over HTTP.  Idempotent.
#[instrument(skip(git, root))]
pub fn provision_repository(git: &str, root: &Path, logical_path: &str) -> Result<()> {
    // Access-right paths go through the same validation as request paths;
    // a path the resolver would reject can never be served, so creating it
    // would only plant an unreachable directory.
    let identity = match path::resolve(&format!("/{logical_path}")) {
        Ok(identity) => identity,
        Err(reason) => {
            warn!(%logical_path, ?reason, "skipping unresolvable access-right path");
            return Ok(());
        }
    };

    let shard_dir = identity.project_root(root);
    let repo_dir = identity.repository_dir(root);

    if is_bare_repository(&repo_dir) {
        debug!(repo = %repo_dir.display(), "repository already provisioned");
        return Ok(());
    }

    std::fs::create_dir_all(&shard_dir)
        .with_context(|| format!("failed to create shard directory: {}", shard_dir.display()))?;

    run_git(
        git,
        &shard_dir,
        &["init", "--bare", &identity.repository_name],
    )?;
    run_git(git, &repo_dir, &["config", "http.receivepack", "true"])?;

    info!(repo = %repo_dir.display(), "provisioned bare repository");
    Ok(())
}

/// Run `git -C <dir> <args...>`, capturing output; non-zero exit is an
/// error carrying the trimmed stderr.
fn run_git(git: &str, dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new(git)
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .with_context(|| format!("failed to spawn {git}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git {} failed (status {}): {}",
            args.join(" "),
            output.status,
            stderr.trim(),
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
