//! Version-control tool integration: executable discovery and bare-repo
//! provisioning.

pub mod locate;
pub mod provision;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::settings::model::Settings;

/// Resolved locations of the version-control tool and its CGI backend.
#[derive(Debug, Clone)]
pub struct ResolvedTools {
    pub command_root: PathBuf,
    pub command_file_path: PathBuf,
    pub backend_file_path: PathBuf,
}

impl ResolvedTools {
    /// Write the resolved locations back into a settings snapshot.
    pub fn apply(&self, settings: &mut Settings) {
        settings.git_command_root = self.command_root.display().to_string();
        settings.git_command_file_path = self.command_file_path.display().to_string();
        settings.git_backend_file_path = self.backend_file_path.display().to_string();
    }
}

/// Resolve the `git` and `git-http-backend` executables, preferring paths
/// already present in `settings` when they still exist.
///
/// Failure here is fatal to startup: without these executables no
/// repository access is possible.
pub fn resolve_tools(settings: &Settings) -> Result<ResolvedTools> {
    let command_file_path = existing_file(&settings.git_command_file_path)
        .or_else(|| locate::locate_executable("git"))
        .context("git executable not found on PATH")?;

    let command_root = existing_dir(&settings.git_command_root)
        .or_else(|| {
            command_file_path
                .parent()
                .and_then(Path::parent)
                .or_else(|| command_file_path.parent())
                .map(Path::to_path_buf)
        })
        .context("cannot derive the git installation root")?;

    let backend_file_path = existing_file(&settings.git_backend_file_path)
        .or_else(|| locate::locate_executable_recursively("git-http-backend", &command_root))
        .with_context(|| {
            format!(
                "git-http-backend not found under {}",
                command_root.display()
            )
        })?;

    Ok(ResolvedTools {
        command_root,
        command_file_path,
        backend_file_path,
    })
}

fn existing_file(path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    (!path.is_empty() && candidate.is_file()).then(|| candidate.to_path_buf())
}

fn existing_dir(path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    (!path.is_empty() && candidate.is_dir()).then(|| candidate.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_backend_under_install_root() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("bin");
        let libexec = tmp.path().join("libexec").join("git-core");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(&libexec).unwrap();
        std::fs::write(bin.join("git"), "").unwrap();
        std::fs::write(libexec.join("git-http-backend"), "").unwrap();

        let settings = Settings {
            git_command_file_path: bin.join("git").display().to_string(),
            ..Settings::default()
        };
        let tools = resolve_tools(&settings).unwrap();
        assert_eq!(tools.command_root, tmp.path());
        assert_eq!(tools.backend_file_path, libexec.join("git-http-backend"));
    }

    #[test]
    fn missing_backend_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("git"), "").unwrap();

        let settings = Settings {
            git_command_file_path: bin.join("git").display().to_string(),
            ..Settings::default()
        };
        assert!(resolve_tools(&settings).is_err());
    }

    #[test]
    fn already_resolved_settings_pass_through() {
        let tmp = tempfile::tempdir().unwrap();
        let git = tmp.path().join("git");
        let backend = tmp.path().join("git-http-backend");
        std::fs::write(&git, "").unwrap();
        std::fs::write(&backend, "").unwrap();

        let settings = Settings {
            git_command_root: tmp.path().display().to_string(),
            git_command_file_path: git.display().to_string(),
            git_backend_file_path: backend.display().to_string(),
            ..Settings::default()
        };
        let tools = resolve_tools(&settings).unwrap();
        assert_eq!(tools.command_file_path, git);
        assert_eq!(tools.backend_file_path, backend);

        let mut updated = settings.clone();
        tools.apply(&mut updated);
        assert_eq!(updated.git_backend_file_path, backend.display().to_string());
    }
}
