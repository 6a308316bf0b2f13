//! Namespace keys: the isolation unit of the vector index.
//!
//! A namespace key is derived from the normalized repository URL and the
//! commit hash, so the same repository at the same commit always maps to
//! the same key across process restarts:
//!
//! ```text
//! key = hex(sha256(normalized_url ‖ 0x00 ‖ commit_hash))[..32]
//! ```
//!
//! # Example
//!
//! ```rust
//! use repo_guide_core::namespace::Namespace;
//!
//! let a = Namespace::derive("https://github.com/acme/widget.git", "abc123");
//! let b = Namespace::derive("https://GitHub.com/acme/widget/", "abc123");
//! assert_eq!(a, b);
//! assert_eq!(a.as_str().len(), 32);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const KEY_HEX_LEN: usize = 32;

/// Key of one isolated partition of the vector index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    /// Derive the key for `repository_url` at `commit`.
    pub fn derive(repository_url: &str, commit: &str) -> Self {
        let normalized = normalize_repository_url(repository_url);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([0u8]);
        hasher.update(commit.trim().as_bytes());
        let digest = hex::encode(hasher.finalize());
        Namespace(digest[..KEY_HEX_LEN].to_string())
    }

    /// Wrap a key that was derived earlier (e.g. typed by a user).
    pub fn from_key(key: impl Into<String>) -> Self {
        Namespace(key.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical form of a repository URL.
///
/// Equivalent spellings of the same remote normalize identically:
/// scheme, credentials, a trailing `/` or `.git` and host case are dropped,
/// and scp-style `git@host:owner/repo` becomes `host/owner/repo`. Local
/// filesystem paths are kept as given apart from a trailing `/`.
pub fn normalize_repository_url(url: &str) -> String {
    let mut s = url.trim().trim_end_matches('/');
    if let Some(stripped) = s.strip_suffix(".git") {
        s = stripped.trim_end_matches('/');
    }

    let (scheme, rest) = match s.find("://") {
        Some(i) => (Some(&s[..i]), &s[i + 3..]),
        None => (None, s),
    };

    if scheme == Some("file") || (scheme.is_none() && is_local_path(rest)) {
        return rest.to_string();
    }

    // Drop `user@` / `user:password@` ahead of the host.
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let rest = match rest[..authority_end].rfind('@') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };

    let split_at = if scheme.is_none() {
        // scp form: host:owner/repo
        rest.find(':').or_else(|| rest.find('/'))
    } else {
        rest.find('/')
    };

    match split_at {
        Some(i) => {
            let host = rest[..i].to_lowercase();
            let path = rest[i + 1..].trim_start_matches('/');
            format!("{}/{}", host, path)
        }
        None => rest.to_lowercase(),
    }
}

fn is_local_path(s: &str) -> bool {
    if s.starts_with('/') || s.starts_with('.') || s.starts_with('~') || s.starts_with('\\') {
        return true;
    }
    let bytes = s.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        // Windows drive letter
        return bytes.len() == 2 || bytes[2] == b'\\' || bytes[2] == b'/';
    }
    !s.contains(':') && !s.contains('@') && !starts_with_host(s)
}

/// `github.com/acme/widget` written without a scheme: a dotted first
/// segment ending in an alphabetic label of two or more characters,
/// followed by a path.
fn starts_with_host(s: &str) -> bool {
    let Some((first, path)) = s.split_once('/') else {
        return false;
    };
    if path.trim_matches('/').is_empty() || !first.contains('.') {
        return false;
    }
    let hostname_chars = first
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    let tld = first.rsplit('.').next().unwrap_or("");
    hostname_chars && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// Human-readable slug for a repository: `owner_repo` for hosted
/// repositories, otherwise the URL with non-alphanumerics collapsed to `_`.
pub fn repo_slug(url: &str) -> String {
    let normalized = normalize_repository_url(url);
    let segments: Vec<&str> = normalized
        .split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .collect();

    let source = if segments.len() >= 3 && segments[0].contains('.') {
        format!("{}_{}", segments[1], segments[2])
    } else {
        normalized.clone()
    };

    let mut slug = String::with_capacity(source.len());
    let mut last_underscore = false;
    for c in source.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            slug.push(c);
            last_underscore = false;
        } else if !last_underscore {
            slug.push('_');
            last_underscore = true;
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "repo".to_string()
    } else {
        slug.to_string()
    }
}

/// First 12 hex chars of SHA-256 over the normalized URL.
pub fn url_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_repository_url(url).as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_https_variants() {
        let expected = "github.com/acme/widget";
        assert_eq!(normalize_repository_url("https://github.com/acme/widget"), expected);
        assert_eq!(normalize_repository_url("https://github.com/acme/widget.git"), expected);
        assert_eq!(normalize_repository_url("https://github.com/acme/widget/"), expected);
        assert_eq!(normalize_repository_url("  HTTPS://GitHub.com/acme/widget  "), expected);
        assert_eq!(normalize_repository_url("http://token@github.com/acme/widget"), expected);
    }

    #[test]
    fn test_normalize_scp_and_ssh() {
        assert_eq!(
            normalize_repository_url("git@github.com:acme/widget.git"),
            "github.com/acme/widget"
        );
        assert_eq!(
            normalize_repository_url("ssh://git@github.com/acme/widget"),
            "github.com/acme/widget"
        );
    }

    #[test]
    fn test_normalize_keeps_path_case() {
        assert_eq!(
            normalize_repository_url("https://github.com/Acme/Widget"),
            "github.com/Acme/Widget"
        );
    }

    #[test]
    fn test_normalize_local_paths() {
        assert_eq!(normalize_repository_url("/tmp/repos/widget/"), "/tmp/repos/widget");
        assert_eq!(normalize_repository_url("file:///tmp/repos/widget"), "/tmp/repos/widget");
        assert_eq!(normalize_repository_url("./widget"), "./widget");
    }

    #[test]
    fn test_normalize_schemeless_host() {
        assert_eq!(
            normalize_repository_url("GitHub.com/acme/widget"),
            "github.com/acme/widget"
        );
        assert_eq!(
            Namespace::derive("GitHub.com/acme/widget.git", "abc123"),
            Namespace::derive("https://github.com/acme/widget", "abc123")
        );
        // Relative paths without a dotted host segment stay local.
        assert_eq!(normalize_repository_url("repos/Widget"), "repos/Widget");
        assert_eq!(normalize_repository_url("out.d/Widget"), "out.d/Widget");
    }

    #[test]
    fn test_namespace_deterministic() {
        let a = Namespace::derive("https://github.com/acme/widget", "abc123");
        let b = Namespace::derive("https://github.com/acme/widget", "abc123");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_namespace_known_value() {
        let mut hasher = Sha256::new();
        hasher.update(b"github.com/acme/widget\0abc123");
        let expected = &hex::encode(hasher.finalize())[..32];
        let ns = Namespace::derive("git@github.com:acme/widget.git", "abc123");
        assert_eq!(ns.as_str(), expected);
    }

    #[test]
    fn test_namespace_differs_by_commit_and_repo() {
        let base = Namespace::derive("https://github.com/acme/widget", "abc123");
        assert_ne!(base, Namespace::derive("https://github.com/acme/widget", "abc124"));
        assert_ne!(base, Namespace::derive("https://github.com/acme/gadget", "abc123"));
    }

    #[test]
    fn test_repo_slug() {
        assert_eq!(repo_slug("https://github.com/acme/widget.git"), "acme_widget");
        assert_eq!(repo_slug("git@gitlab.com:team/tool"), "team_tool");
        assert_eq!(repo_slug("/tmp/some dir/widget"), "tmp_some_dir_widget");
    }

    #[test]
    fn test_url_hash_stable_across_spellings() {
        assert_eq!(
            url_hash("https://github.com/acme/widget.git"),
            url_hash("git@github.com:acme/widget")
        );
        assert_eq!(url_hash("https://github.com/acme/widget").len(), 12);
    }
}
