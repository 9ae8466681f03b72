//! Request-path validation and repository resolution.
//!
//! Maps a raw URL path onto a repository identity in the depth-sharded
//! storage layout, or rejects it.  Every check is a hard reject that falls
//! through to the next handler: a hostile path is indistinguishable from a
//! path this gateway simply does not serve.

use std::path::{Path, PathBuf};

/// Segment suffix that marks the repository name.
pub const REPOSITORY_SUFFIX: &str = ".git";

/// Characters never allowed in a path segment destined for the filesystem.
/// Forward slash cannot occur post-split; this is the conservative union of
/// the remaining reserved characters across host platforms.
const ILLEGAL_SEGMENT_CHARS: &[char] = &['<', '>', ':', '"', '\\', '|', '?', '*'];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where a validated request lives in the sharded repository tree.
///
/// Computed per request from the URL alone; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryIdentity {
    /// Count of path segments preceding the repository name.
    pub shard_depth: usize,
    /// Segments preceding the repository name.
    pub path_segments: Vec<String>,
    /// The segment carrying [`REPOSITORY_SUFFIX`].
    pub repository_name: String,
    /// The repository segment and everything after it, re-joined with `/`
    /// and a leading separator.  Forwarded verbatim as CGI path info.
    pub remaining_path_info: String,
}

impl RepositoryIdentity {
    /// Logical repository path used for access-right matching, e.g.
    /// `team/project.git`.
    pub fn logical_path(&self) -> String {
        let mut parts = self.path_segments.clone();
        parts.push(self.repository_name.clone());
        parts.join("/")
    }

    /// Shard directory under `root` that the CGI backend resolves
    /// `PATH_INFO` against: `root/<depth>/<segments...>`.
    pub fn project_root(&self, root: &Path) -> PathBuf {
        let mut dir = root.join(self.shard_depth.to_string());
        for segment in &self.path_segments {
            dir.push(segment);
        }
        dir
    }

    /// On-disk bare repository directory:
    /// `root/<depth>/<segments...>/<name>`.
    pub fn repository_dir(&self, root: &Path) -> PathBuf {
        self.project_root(root).join(&self.repository_name)
    }
}

/// Why a path was not accepted.  Not an error; rejected requests fall
/// through to the next handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRejection {
    /// A segment percent-decodes to something other than itself.
    PercentEncoded,
    /// More empty segments than the single leading slash.
    EmptySegment,
    /// A segment is `.`, `..`, or the bare repository suffix.
    TraversalSegment,
    /// A segment carries characters illegal in file-system names.
    IllegalCharacter,
    /// Zero, or more than one, segment ends with the repository suffix.
    SuffixCount,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Validate `raw_path` (the URL path after the base prefix, still starting
/// with `/`) and split it into a [`RepositoryIdentity`].
pub fn resolve(raw_path: &str) -> Result<RepositoryIdentity, PathRejection> {
    let parts: Vec<&str> = raw_path.split('/').collect();

    // Stage 1: no percent-encoding anywhere.  Encoded traversal sequences
    // and encoded suffix smuggling both die here.
    for part in &parts {
        match urlencoding::decode(part) {
            Ok(decoded) => {
                if decoded != *part {
                    return Err(PathRejection::PercentEncoded);
                }
            }
            Err(_) => return Err(PathRejection::PercentEncoded),
        }
    }

    // Stage 2: exactly one empty segment (the leading slash).  A second one
    // means `//` somewhere in the path.
    let empty_count = parts.iter().filter(|p| p.trim().is_empty()).count();
    if empty_count != 1 {
        return Err(PathRejection::EmptySegment);
    }

    let segments: Vec<&str> = parts.into_iter().filter(|p| !p.trim().is_empty()).collect();
    if segments.is_empty() {
        return Err(PathRejection::SuffixCount);
    }

    // Stage 3: no dot-relative segments, and no segment that is the bare
    // suffix (a nested `.git` would confuse the split below).
    for segment in &segments {
        if *segment == "." || *segment == ".." || segment.eq_ignore_ascii_case(REPOSITORY_SUFFIX) {
            return Err(PathRejection::TraversalSegment);
        }
    }

    // Stage 4: filesystem-illegal characters.
    for segment in &segments {
        if segment
            .chars()
            .any(|c| c.is_control() || ILLEGAL_SEGMENT_CHARS.contains(&c))
        {
            return Err(PathRejection::IllegalCharacter);
        }
    }

    // Stage 5: exactly one repository segment.
    let suffix_count = segments.iter().filter(|s| has_suffix(s)).count();
    if suffix_count != 1 {
        return Err(PathRejection::SuffixCount);
    }

    let split_at = segments
        .iter()
        .position(|s| has_suffix(s))
        .ok_or(PathRejection::SuffixCount)?;

    let path_segments: Vec<String> = segments[..split_at]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let repository_name = segments[split_at].to_string();
    let remaining_path_info = format!("/{}", segments[split_at..].join("/"));

    Ok(RepositoryIdentity {
        shard_depth: path_segments.len(),
        path_segments,
        repository_name,
        remaining_path_info,
    })
}

fn has_suffix(segment: &str) -> bool {
    // A non-boundary tail cannot be the ASCII suffix.
    segment
        .len()
        .checked_sub(REPOSITORY_SUFFIX.len())
        .filter(|&at| at > 0)
        .and_then(|at| segment.get(at..))
        .is_some_and(|tail| tail.eq_ignore_ascii_case(REPOSITORY_SUFFIX))
}

/// Strip the configured base prefix from `path`, matching on a segment
/// boundary, case-insensitively.  Returns the remainder (starting with `/`)
/// or `None` when the path lies outside the prefix.
pub fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    let base = base_path.trim_end_matches('/');
    if base.is_empty() {
        return Some(path);
    }
    let (prefix, rest) = match (path.get(..base.len()), path.get(base.len()..)) {
        (Some(prefix), Some(rest)) => (prefix, rest),
        _ => return None,
    };
    if !prefix.eq_ignore_ascii_case(base) {
        return None;
    }
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_sharded_path() {
        let identity = resolve("/a/b/repo.git/info/refs").unwrap();
        assert_eq!(identity.shard_depth, 2);
        assert_eq!(identity.path_segments, vec!["a", "b"]);
        assert_eq!(identity.repository_name, "repo.git");
        assert_eq!(identity.remaining_path_info, "/repo.git/info/refs");
    }

    #[test]
    fn resolves_depth_zero() {
        let identity = resolve("/repo.git/git-upload-pack").unwrap();
        assert_eq!(identity.shard_depth, 0);
        assert!(identity.path_segments.is_empty());
        assert_eq!(identity.remaining_path_info, "/repo.git/git-upload-pack");
    }

    #[test]
    fn resolves_bare_repository_path() {
        let identity = resolve("/team/repo.git").unwrap();
        assert_eq!(identity.logical_path(), "team/repo.git");
        assert_eq!(identity.remaining_path_info, "/repo.git");
    }

    #[test]
    fn rejects_percent_encoded_segments() {
        assert_eq!(
            resolve("/a/%2e%2e/repo.git"),
            Err(PathRejection::PercentEncoded)
        );
        assert_eq!(
            resolve("/a/repo%2egit/info/refs"),
            Err(PathRejection::PercentEncoded)
        );
        assert_eq!(resolve("/%61/repo.git"), Err(PathRejection::PercentEncoded));
    }

    #[test]
    fn accepts_literal_percent_that_decodes_to_itself() {
        // "%zz" is not a valid escape; it decodes to itself and survives
        // stage 1 (it still carries no traversal risk).
        let identity = resolve("/a%zz/repo.git");
        assert!(identity.is_ok());
    }

    #[test]
    fn rejects_double_slashes() {
        assert_eq!(resolve("//a/repo.git"), Err(PathRejection::EmptySegment));
        assert_eq!(resolve("/a//repo.git"), Err(PathRejection::EmptySegment));
        assert_eq!(resolve("/a/repo.git/"), Err(PathRejection::EmptySegment));
    }

    #[test]
    fn rejects_missing_leading_slash() {
        assert_eq!(resolve("a/repo.git"), Err(PathRejection::EmptySegment));
    }

    #[test]
    fn rejects_dot_segments() {
        assert_eq!(
            resolve("/./repo.git"),
            Err(PathRejection::TraversalSegment)
        );
        assert_eq!(
            resolve("/a/../repo.git"),
            Err(PathRejection::TraversalSegment)
        );
    }

    #[test]
    fn rejects_bare_suffix_segment() {
        assert_eq!(
            resolve("/.git/repo.git"),
            Err(PathRejection::TraversalSegment)
        );
        assert_eq!(
            resolve("/a/.GIT/repo.git"),
            Err(PathRejection::TraversalSegment)
        );
    }

    #[test]
    fn rejects_illegal_characters() {
        assert_eq!(
            resolve("/a|b/repo.git"),
            Err(PathRejection::IllegalCharacter)
        );
        assert_eq!(
            resolve("/a/re\"po.git"),
            Err(PathRejection::IllegalCharacter)
        );
        assert_eq!(
            resolve("/a\u{1}/repo.git"),
            Err(PathRejection::IllegalCharacter)
        );
    }

    #[test]
    fn rejects_suffix_count_mismatch() {
        assert_eq!(resolve("/a/b/c"), Err(PathRejection::SuffixCount));
        assert_eq!(
            resolve("/one.git/two.git/info/refs"),
            Err(PathRejection::SuffixCount)
        );
        // The root path splits into two empty segments and dies earlier.
        assert_eq!(resolve("/"), Err(PathRejection::EmptySegment));
        assert_eq!(resolve(""), Err(PathRejection::SuffixCount));
    }

    #[test]
    fn suffix_match_is_case_insensitive() {
        let identity = resolve("/team/Repo.GIT/info/refs").unwrap();
        assert_eq!(identity.repository_name, "Repo.GIT");
    }

    #[test]
    fn storage_layout_is_depth_sharded() {
        let identity = resolve("/a/b/repo.git/info/refs").unwrap();
        let root = Path::new("/srv/repos");
        assert_eq!(
            identity.project_root(root),
            Path::new("/srv/repos/2/a/b")
        );
        assert_eq!(
            identity.repository_dir(root),
            Path::new("/srv/repos/2/a/b/repo.git")
        );
    }

    #[test]
    fn strip_base_path_matches_segment_boundary() {
        assert_eq!(
            strip_base_path("/gitrepos/a/repo.git", "/gitrepos"),
            Some("/a/repo.git")
        );
        assert_eq!(
            strip_base_path("/GitRepos/a/repo.git", "/gitrepos"),
            Some("/a/repo.git")
        );
        assert_eq!(strip_base_path("/gitreposx/a.git", "/gitrepos"), None);
        assert_eq!(strip_base_path("/other/a.git", "/gitrepos"), None);
        assert_eq!(strip_base_path("/gitrepos", "/gitrepos"), Some(""));
    }

    #[test]
    fn strip_base_path_empty_base_passes_through() {
        assert_eq!(strip_base_path("/a/repo.git", ""), Some("/a/repo.git"));
        assert_eq!(strip_base_path("/a/repo.git", "/"), Some("/a/repo.git"));
    }
}
