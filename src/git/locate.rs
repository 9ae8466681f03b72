//! Executable discovery for the version-control tool and its CGI backend.
//!
//! `git` is found by walking `PATH`; `git-http-backend` lives somewhere
//! under the git installation root (libexec/git-core on most layouts,
//! mingw64/libexec on Windows installs) and is found by a breadth-first
//! tree search so the exact layout does not matter.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Find `file_name` in one of the `PATH` directories.
pub fn locate_executable(file_name: &str) -> Option<PathBuf> {
    let search_name = platform_file_name(file_name);
    let path_env = std::env::var_os("PATH")?;

    for dir in std::env::split_paths(&path_env) {
        let candidate = dir.join(&search_name);
        if candidate.is_file() {
            debug!(path = %candidate.display(), "located executable on PATH");
            return Some(candidate);
        }
    }
    None
}

/// Breadth-first search for `file_name` under `start_directory`.
///
/// Unreadable or vanished directories are skipped, not errors.
pub fn locate_executable_recursively(file_name: &str, start_directory: &Path) -> Option<PathBuf> {
    if !start_directory.is_dir() {
        return None;
    }
    let search_name = platform_file_name(file_name);

    let mut queue = VecDeque::new();
    queue.push_back(start_directory.to_path_buf());

    while let Some(current) = queue.pop_front() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let entry_path = entry.path();
            if entry_path.is_dir() {
                queue.push_back(entry_path);
            } else if entry.file_name() == search_name.as_str() {
                debug!(path = %entry_path.display(), "located executable in tree");
                return Some(entry_path);
            }
        }
    }
    None
}

/// On Windows an extensionless name gets `.exe` appended for the search.
fn platform_file_name(file_name: &str) -> String {
    if cfg!(windows) && !file_name.contains('.') {
        format!("{file_name}.exe")
    } else {
        file_name.to_string()
    }
}
