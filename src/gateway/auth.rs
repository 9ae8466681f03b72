//! Basic-auth credential extraction and per-repository authorization.
//!
//! Credentials are checked against the hot-reloadable settings snapshot:
//! access rights name the accounts allowed on a logical repository path,
//! and each account carries a list of Basic-auth username/password pairs.
//! Clear-text passwords are migrated to a hashed form before they ever
//! reach durable storage; see [`migrate_clear_passwords`].

use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::settings::model::{Settings, PASSWORD_TYPE_CLEAR, PASSWORD_TYPE_HASHED};

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// A decoded Basic-auth username/password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Why extraction failed, and whether the 401 should invite a retry.
///
/// Only the missing-header and invalid-format cases carry a
/// `WWW-Authenticate` challenge; an attempt that is already malformed or
/// uses another scheme is not prompted to try Basic again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRejection {
    pub message: &'static str,
    pub include_challenge: bool,
}

/// Pull Basic credentials out of the `Authorization` header.
pub fn extract_basic_credentials(headers: &HeaderMap) -> Result<BasicCredentials, AuthRejection> {
    let header_value = match headers.get(header::AUTHORIZATION) {
        Some(value) => value,
        None => {
            return Err(AuthRejection {
                message: "Unauthorized: Missing Authorization header.",
                include_challenge: true,
            })
        }
    };

    let unsupported = AuthRejection {
        message: "Unauthorized: Unsupported authorization method.",
        include_challenge: false,
    };
    let header_text = header_value.to_str().map_err(|_| unsupported)?;
    let encoded = match split_basic_scheme(header_text) {
        Some(rest) => rest.trim(),
        None => return Err(unsupported),
    };

    let decoded_bytes = BASE64.decode(encoded).map_err(|_| AuthRejection {
        message: "Unauthorized: Invalid Base64 encoding.",
        include_challenge: false,
    })?;
    let decoded = String::from_utf8_lossy(&decoded_bytes);

    let (username, password) = decoded.split_once(':').ok_or(AuthRejection {
        message: "Unauthorized: Invalid credentials format.",
        include_challenge: true,
    })?;

    Ok(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

fn split_basic_scheme(header_text: &str) -> Option<&str> {
    const SCHEME: &str = "Basic ";
    let prefix = header_text.get(..SCHEME.len())?;
    if prefix.eq_ignore_ascii_case(SCHEME) {
        header_text.get(SCHEME.len()..)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Decide whether `credentials` may access the repository at
/// `logical_path` (e.g. `team/project.git`) under `settings`.
///
/// The accounts named by matching access rights are flattened to their
/// Basic-auth credential lists; any entry with a matching username whose
/// password matches under its own `passwordType` rule authorizes the
/// request.
pub fn authorize(settings: &Settings, logical_path: &str, credentials: &BasicCredentials) -> bool {
    for account in settings.accounts_for_path(logical_path) {
        for auth in &account.basic_auths {
            if auth.username != credentials.username {
                continue;
            }
            if password_matches(&auth.password, &auth.password_type, &credentials.password) {
                return true;
            }
        }
    }
    false
}

fn password_matches(stored: &str, password_type: &str, supplied: &str) -> bool {
    if password_type.eq_ignore_ascii_case(PASSWORD_TYPE_CLEAR) {
        stored == supplied
    } else {
        stored == hash_password(supplied)
    }
}

// ---------------------------------------------------------------------------
// Password hashing / migration
// ---------------------------------------------------------------------------

/// Hex-encoded Sha256 digest of `password`.
///
/// A fast general-purpose hash, not a password KDF; kept because the stored
/// hashes are part of the settings-file contract.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Irreversibly rewrite every clear-text credential to its hashed form.
///
/// Registered as a pre-persist hook on the settings store so no clear-text
/// password is ever written back to disk after the first load.  Idempotent:
/// already-hashed credentials pass through untouched.
pub fn migrate_clear_passwords(settings: &mut Settings) {
    for account in &mut settings.accounts {
        migrate_credential(&mut account.password, &mut account.password_type);
        for auth in &mut account.basic_auths {
            migrate_credential(&mut auth.password, &mut auth.password_type);
        }
    }
}

fn migrate_credential(password: &mut String, password_type: &mut String) {
    if password_type.eq_ignore_ascii_case(PASSWORD_TYPE_CLEAR) {
        *password = hash_password(password);
        *password_type = PASSWORD_TYPE_HASHED.to_string();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
