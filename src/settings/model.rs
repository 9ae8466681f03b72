//! Settings data model persisted to the JSON settings file.
//!
//! Field names serialize in camelCase so the on-disk file stays compatible
//! with hand-edited settings files (`gitCommandRoot`, `accessRights`, ...).
//! The file is shared with external editors; everything here is plain data
//! with serde derives, the concurrency story lives in [`super::store`].

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Password stored as the user typed it.  Only ever observed transiently:
/// the migration hook rewrites it before the next persist.
pub const PASSWORD_TYPE_CLEAR: &str = "clear";
/// Password stored as a hex-encoded digest.
pub const PASSWORD_TYPE_HASHED: &str = "hashed";

// ---------------------------------------------------------------------------
// Root settings object
// ---------------------------------------------------------------------------

/// Root configuration object backing the gateway.
///
/// Loaded once at startup, replaced wholesale on every committed change.
/// Readers only ever see immutable snapshots handed out by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Installation root of the version-control tool (parent of its bin dir).
    pub git_command_root: String,
    /// Resolved path of the `git` executable.
    pub git_command_file_path: String,
    /// Resolved path of the `git-http-backend` CGI executable.
    pub git_backend_file_path: String,
    /// Storage root under which bare repositories are sharded by path depth.
    pub repositories_directory: String,
    /// URL prefix the gateway claims; everything else falls through.
    pub base_path: String,
    pub accounts: Vec<Account>,
    pub access_rights: Vec<AccessRight>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            git_command_root: String::new(),
            git_command_file_path: String::new(),
            git_backend_file_path: String::new(),
            repositories_directory: "repositories".to_string(),
            base_path: "/gitrepos".to_string(),
            accounts: Vec::new(),
            access_rights: Vec::new(),
        }
    }
}

impl Settings {
    /// Accounts permitted for a logical repository path.
    ///
    /// Unions `accountNames` across every access right whose `path` equals
    /// `logical_path` case-insensitively, then resolves them against
    /// `accounts`.  Unknown names are skipped.
    pub fn accounts_for_path(&self, logical_path: &str) -> Vec<&Account> {
        let mut names: Vec<&str> = Vec::new();
        for right in &self.access_rights {
            if right.path.eq_ignore_ascii_case(logical_path) {
                for name in &right.account_names {
                    if !names.iter().any(|n| *n == name.as_str()) {
                        names.push(name);
                    }
                }
            }
        }

        self.accounts
            .iter()
            .filter(|account| names.iter().any(|n| *n == account.account_name))
            .collect()
    }

    /// Log duplicate account names.  Duplicates are tolerated at runtime
    /// (first entry wins nothing special, all are consulted) but indicate a
    /// hand-editing mistake worth surfacing.
    pub fn warn_on_duplicate_accounts(&self) {
        for (idx, account) in self.accounts.iter().enumerate() {
            let dup = self.accounts[..idx]
                .iter()
                .any(|a| a.account_name == account.account_name);
            if dup {
                warn!(
                    account = %account.account_name,
                    "duplicate accountName in settings file"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Accounts and credentials
// ---------------------------------------------------------------------------

/// An account with one or more Basic-auth credentials sharing its
/// authorization scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Account {
    pub account_name: String,
    pub password: String,
    pub password_type: String,
    pub basic_auths: Vec<BasicAuth>,
}

/// A single username/password pair.  `password_type` is either
/// [`PASSWORD_TYPE_CLEAR`] or [`PASSWORD_TYPE_HASHED`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
    pub password_type: String,
}

/// Maps a logical repository path (e.g. `team/project.git`) to the account
/// names permitted to use it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessRight {
    pub path: String,
    pub account_names: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_settings() -> Settings {
        Settings {
            accounts: vec![
                Account {
                    account_name: "alice".into(),
                    ..Account::default()
                },
                Account {
                    account_name: "bob".into(),
                    ..Account::default()
                },
            ],
            access_rights: vec![
                AccessRight {
                    path: "team/project.git".into(),
                    account_names: vec!["alice".into()],
                },
                AccessRight {
                    path: "Team/Project.git".into(),
                    account_names: vec!["alice".into(), "bob".into()],
                },
            ],
            ..Settings::default()
        }
    }

    #[test]
    fn accounts_for_path_unions_case_insensitive_matches() {
        let settings = sample_settings();
        let accounts = settings.accounts_for_path("team/project.git");
        let names: Vec<&str> = accounts.iter().map(|a| a.account_name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[test]
    fn accounts_for_path_unknown_path_is_empty() {
        let settings = sample_settings();
        assert!(settings.accounts_for_path("other/repo.git").is_empty());
    }

    #[test]
    fn accounts_for_path_skips_unresolved_names() {
        let mut settings = sample_settings();
        settings.access_rights[0].account_names.push("ghost".into());
        let accounts = settings.accounts_for_path("team/project.git");
        assert_eq!(accounts.len(), 2);
    }

    #[test]
    fn serde_uses_camel_case_field_names() {
        let json = serde_json::to_string(&sample_settings()).unwrap();
        assert!(json.contains("\"accessRights\""));
        assert!(json.contains("\"accountNames\""));
        assert!(json.contains("\"repositoriesDirectory\""));
        assert!(!json.contains("\"access_rights\""));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.base_path, "/gitrepos");
        assert!(settings.accounts.is_empty());
    }
}
