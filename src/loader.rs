//! Git repository loader.
//!
//! Resolves a repository URL to a working copy at a known commit:
//!
//! 1. Derive the working directory `{repos_dir}/{slug}-{hash12}`.
//! 2. Take the per-directory lease (see [`RepoLocks`]).
//! 3. Clone when there is no `.git`; otherwise repoint `origin`, fetch
//!    with `--prune`, and hard-reset the resolved branch onto the remote
//!    tip. Local edits in the working copy never survive an update.
//! 4. Read the full `HEAD` commit hash.
//!
//! The returned [`Checkout`] holds the lease. Dropping it (after ingestion
//! finished reading the files, or on any failure path) releases the
//! directory for the next request of the same URL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use repo_guide_core::namespace::{repo_slug, url_hash};

use crate::config::LoaderConfig;

/// Why a clone or fetch could not reach the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneFailure {
    Network,
    Auth,
    NotFound,
    Other,
}

impl CloneFailure {
    fn is_retryable(&self) -> bool {
        matches!(self, CloneFailure::Network | CloneFailure::Other)
    }
}

impl std::fmt::Display for CloneFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloneFailure::Network => "network error",
            CloneFailure::Auth => "authentication required",
            CloneFailure::NotFound => "repository not found",
            CloneFailure::Other => "git error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("cannot fetch {url}: {kind}: {message}")]
    Clone {
        url: String,
        kind: CloneFailure,
        message: String,
    },
    #[error("working copy {} is unusable: {message}", path.display())]
    RepositoryState { path: PathBuf, message: String },
    #[error("`git {command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("working copy {} stayed busy for {after:?}", path.display())]
    LockTimeout { path: PathBuf, after: Duration },
    #[error("failed to run git (is it installed?): {0}")]
    GitUnavailable(String),
}

/// Map git's stderr to a [`CloneFailure`].
pub fn classify_git_failure(stderr: &str) -> CloneFailure {
    let s = stderr.to_lowercase();
    const AUTH: &[&str] = &[
        "authentication failed",
        "could not read username",
        "could not read password",
        "permission denied",
        "403",
        "terminal prompts disabled",
    ];
    const NOT_FOUND: &[&str] = &[
        "repository not found",
        "does not exist",
        "not found",
        "does not appear to be a git repository",
        "404",
    ];
    const NETWORK: &[&str] = &[
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "connection reset",
        "network is unreachable",
        "operation timed out",
        "unable to access",
        "early eof",
    ];

    if AUTH.iter().any(|p| s.contains(p)) {
        CloneFailure::Auth
    } else if NOT_FOUND.iter().any(|p| s.contains(p)) {
        CloneFailure::NotFound
    } else if NETWORK.iter().any(|p| s.contains(p)) {
        CloneFailure::Network
    } else {
        CloneFailure::Other
    }
}

/// A full 40-hex SHA-1 commit id.
pub fn is_full_commit_hash(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// One exclusive lock per working directory.
///
/// Two requests for the same URL share a directory and must not run git in
/// it at the same time; requests for different URLs never wait on each
/// other. Entries nobody holds or waits on are dropped on the next
/// acquire.
#[derive(Clone, Default)]
pub struct RepoLocks {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait at most `wait` for exclusive use of `dir`.
    pub async fn acquire(&self, dir: &Path, wait: Duration) -> Result<OwnedMutexGuard<()>, LoaderError> {
        let lock = {
            let mut map = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(map.entry(dir.to_path_buf()).or_default())
        };
        tokio::time::timeout(wait, lock.lock_owned())
            .await
            .map_err(|_| LoaderError::LockTimeout {
                path: dir.to_path_buf(),
                after: wait,
            })
    }

    /// Directories currently tracked.
    pub fn len(&self) -> usize {
        match self.locks.lock() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A working copy at a resolved commit, held exclusively until dropped.
#[derive(Debug)]
pub struct Checkout {
    repository_url: String,
    workdir: PathBuf,
    branch: String,
    commit: String,
    _lease: OwnedMutexGuard<()>,
}

impl Checkout {
    pub fn repository_url(&self) -> &str {
        &self.repository_url
    }

    pub fn path(&self) -> &Path {
        &self.workdir
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Full 40-hex commit hash of `HEAD`.
    pub fn commit(&self) -> &str {
        &self.commit
    }
}

/// Clones and updates working copies with the `git` binary.
pub struct GitLoader {
    repos_dir: PathBuf,
    branch: Option<String>,
    timeout: Duration,
    clone_attempts: u32,
    locks: RepoLocks,
}

impl GitLoader {
    pub fn new(config: &LoaderConfig) -> Self {
        Self {
            repos_dir: config.repos_dir.clone(),
            branch: config.branch.clone(),
            timeout: config.git_timeout(),
            clone_attempts: config.clone_attempts.max(1),
            locks: RepoLocks::new(),
        }
    }

    /// Share a lock table with another loader over the same `repos_dir`.
    pub fn with_locks(mut self, locks: RepoLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Upper bound on waiting for another checkout of the same URL: every
    /// clone attempt may run to its timeout, plus the fetch and reset.
    fn lock_wait(&self) -> Duration {
        self.timeout * (self.clone_attempts + 2)
    }

    /// Working directory used for `url`.
    pub fn workdir_for(&self, url: &str) -> PathBuf {
        self.repos_dir
            .join(format!("{}-{}", repo_slug(url), url_hash(url)))
    }

    /// Bring the working copy of `url` to the tip of its branch.
    ///
    /// `branch` overrides the configured branch for this call.
    pub async fn checkout(&self, url: &str, branch: Option<&str>) -> Result<Checkout, LoaderError> {
        let url = url.trim();
        let workdir = self.workdir_for(url);
        let lease = self.locks.acquire(&workdir, self.lock_wait()).await?;
        let branch = branch.map(str::to_string).or_else(|| self.branch.clone());

        let existing = workdir.join(".git").exists() && self.verify(&workdir).await;
        if existing {
            self.update(url, &workdir, branch.as_deref()).await?;
        } else {
            self.clone_fresh(url, &workdir, branch.as_deref()).await?;
        }

        let commit = self.head_commit(&workdir).await?;
        let branch = self
            .git_stdout(Some(&workdir), &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        info!(url, commit = %commit, branch = %branch, "working copy ready");

        Ok(Checkout {
            repository_url: url.to_string(),
            workdir,
            branch,
            commit,
            _lease: lease,
        })
    }

    async fn verify(&self, workdir: &Path) -> bool {
        match self.git(Some(workdir), &["rev-parse", "--git-dir"]).await {
            Ok(out) if out.status.success() => true,
            Ok(out) => {
                warn!(
                    path = %workdir.display(),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "existing working copy is not a git repository; recloning"
                );
                false
            }
            Err(e) => {
                warn!(path = %workdir.display(), error = %e, "could not verify working copy; recloning");
                false
            }
        }
    }

    async fn clone_fresh(
        &self,
        url: &str,
        workdir: &Path,
        branch: Option<&str>,
    ) -> Result<(), LoaderError> {
        if let Some(parent) = workdir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LoaderError::RepositoryState {
                    path: parent.to_path_buf(),
                    message: e.to_string(),
                })?;
        }

        let dest = workdir.to_string_lossy().to_string();
        let mut args = vec!["clone", "--no-tags"];
        if let Some(b) = branch {
            args.extend(["--branch", b]);
        }
        args.extend(["--", url, dest.as_str()]);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            remove_partial(workdir).await;
            debug!(url, attempt, "git clone");

            let failure = match self.git(None, &args).await {
                Ok(out) if out.status.success() => return Ok(()),
                Ok(out) => {
                    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
                    LoaderError::Clone {
                        url: url.to_string(),
                        kind: classify_git_failure(&stderr),
                        message: stderr,
                    }
                }
                Err(e) => e,
            };
            remove_partial(workdir).await;

            let retryable = match &failure {
                LoaderError::Clone { kind, .. } => kind.is_retryable(),
                LoaderError::Timeout { .. } => true,
                _ => false,
            };
            if !retryable || attempt >= self.clone_attempts {
                return Err(failure);
            }
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            warn!(url, attempt, error = %failure, ?delay, "clone failed; retrying");
            tokio::time::sleep(delay).await;
        }
    }

    async fn update(&self, url: &str, workdir: &Path, branch: Option<&str>) -> Result<(), LoaderError> {
        // Repoint origin at the requested URL.
        match self.git(Some(workdir), &["remote", "get-url", "origin"]).await? {
            out if out.status.success() => {
                let current = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if current != url {
                    self.git_stdout(Some(workdir), &["remote", "set-url", "origin", url])
                        .await?;
                }
            }
            _ => {
                self.git_stdout(Some(workdir), &["remote", "add", "origin", url])
                    .await?;
            }
        }

        debug!(url, "git fetch");
        let out = self
            .git(Some(workdir), &["fetch", "--prune", "--no-tags", "origin"])
            .await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(LoaderError::Clone {
                url: url.to_string(),
                kind: classify_git_failure(&stderr),
                message: stderr,
            });
        }

        let branch = self.resolve_branch(workdir, branch).await?;
        let remote_ref = format!("origin/{}", branch);
        self.git_stdout(Some(workdir), &["checkout", "-f", "-B", &branch, &remote_ref])
            .await?;
        self.git_stdout(Some(workdir), &["reset", "--hard", &remote_ref])
            .await?;
        self.git_stdout(Some(workdir), &["clean", "-ffdx"]).await?;
        Ok(())
    }

    /// Configured branch, else the remote's default, else `main`, else
    /// `master`.
    async fn resolve_branch(&self, workdir: &Path, wanted: Option<&str>) -> Result<String, LoaderError> {
        if let Some(b) = wanted {
            if self.remote_branch_exists(workdir, b).await? {
                return Ok(b.to_string());
            }
            return Err(LoaderError::RepositoryState {
                path: workdir.to_path_buf(),
                message: format!("branch '{}' not found on origin", b),
            });
        }

        let head = self
            .git(
                Some(workdir),
                &["symbolic-ref", "--quiet", "--short", "refs/remotes/origin/HEAD"],
            )
            .await?;
        if head.status.success() {
            let head = String::from_utf8_lossy(&head.stdout).trim().to_string();
            if let Some(b) = head.strip_prefix("origin/") {
                if self.remote_branch_exists(workdir, b).await? {
                    return Ok(b.to_string());
                }
            }
        }

        for candidate in ["main", "master"] {
            if self.remote_branch_exists(workdir, candidate).await? {
                return Ok(candidate.to_string());
            }
        }
        Err(LoaderError::RepositoryState {
            path: workdir.to_path_buf(),
            message: "could not determine a branch to check out".to_string(),
        })
    }

    async fn remote_branch_exists(&self, workdir: &Path, branch: &str) -> Result<bool, LoaderError> {
        let reference = format!("refs/remotes/origin/{}", branch);
        let out = self
            .git(Some(workdir), &["rev-parse", "--verify", "--quiet", &reference])
            .await?;
        Ok(out.status.success())
    }

    async fn head_commit(&self, workdir: &Path) -> Result<String, LoaderError> {
        let commit = self.git_stdout(Some(workdir), &["rev-parse", "HEAD"]).await?;
        if !is_full_commit_hash(&commit) {
            return Err(LoaderError::RepositoryState {
                path: workdir.to_path_buf(),
                message: format!("unexpected HEAD commit '{}'", commit),
            });
        }
        Ok(commit.to_ascii_lowercase())
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit.
    async fn git_stdout(&self, dir: Option<&Path>, args: &[&str]) -> Result<String, LoaderError> {
        let out = self.git(dir, args).await?;
        if !out.status.success() {
            return Err(LoaderError::RepositoryState {
                path: dir.map(Path::to_path_buf).unwrap_or_default(),
                message: format!(
                    "git {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> Result<Output, LoaderError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(e)) => Err(LoaderError::GitUnavailable(e.to_string())),
            Err(_) => Err(LoaderError::Timeout {
                command: args.first().copied().unwrap_or("").to_string(),
                after: self.timeout,
            }),
        }
    }
}

async fn remove_partial(workdir: &Path) {
    if tokio::fs::metadata(workdir).await.is_ok() {
        if let Err(e) = tokio::fs::remove_dir_all(workdir).await {
            warn!(path = %workdir.display(), error = %e, "failed to remove partial clone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn sh_git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            status.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&status.stderr)
        );
    }

    fn make_origin(tmp: &TempDir) -> PathBuf {
        let origin = tmp.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        sh_git(&origin, &["init", "--quiet"]);
        sh_git(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        std::fs::write(origin.join("README.md"), "# Origin\n").unwrap();
        sh_git(&origin, &["add", "."]);
        sh_git(&origin, &["commit", "--quiet", "-m", "first"]);
        origin
    }

    fn loader(tmp: &TempDir) -> GitLoader {
        GitLoader::new(&LoaderConfig {
            repos_dir: tmp.path().join("repos"),
            branch: None,
            git_timeout_secs: 60,
            clone_attempts: 2,
        })
    }

    #[test]
    fn test_classify_git_failure() {
        assert_eq!(
            classify_git_failure("fatal: Authentication failed for 'https://x'"),
            CloneFailure::Auth
        );
        assert_eq!(
            classify_git_failure("remote: Repository not found.\nfatal: repository 'x' not found"),
            CloneFailure::NotFound
        );
        assert_eq!(
            classify_git_failure("fatal: unable to access 'x': Could not resolve host: github.com"),
            CloneFailure::Network
        );
        assert_eq!(classify_git_failure("fatal: something odd"), CloneFailure::Other);
    }

    #[test]
    fn test_full_commit_hash() {
        assert!(is_full_commit_hash(&"a".repeat(40)));
        assert!(!is_full_commit_hash("abc123"));
        assert!(!is_full_commit_hash(&"g".repeat(40)));
    }

    #[test]
    fn test_workdir_is_stable_per_url() {
        let tmp = TempDir::new().unwrap();
        let loader = loader(&tmp);
        let a = loader.workdir_for("https://github.com/acme/widget.git");
        let b = loader.workdir_for("https://github.com/acme/widget");
        assert_eq!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("acme_widget-"));
        assert_ne!(a, loader.workdir_for("https://github.com/acme/gadget"));
    }

    #[tokio::test]
    async fn test_locks_serialize_same_directory() {
        let locks = RepoLocks::new();
        let dir = PathBuf::from("/tmp/same");
        let wait = Duration::from_millis(50);
        let held = locks.acquire(&dir, wait).await.unwrap();

        let blocked = locks.acquire(&dir, wait).await;
        assert!(matches!(blocked, Err(LoaderError::LockTimeout { .. })));

        let other = locks.acquire(Path::new("/tmp/other"), wait).await;
        assert!(other.is_ok());

        drop(held);
        let after = locks.acquire(&dir, Duration::from_millis(500)).await;
        assert!(after.is_ok());
    }

    #[tokio::test]
    async fn test_released_locks_are_forgotten() {
        let locks = RepoLocks::new();
        let wait = Duration::from_millis(50);
        for i in 0..10 {
            let guard = locks
                .acquire(&PathBuf::from(format!("/tmp/repo-{}", i)), wait)
                .await
                .unwrap();
            drop(guard);
        }
        let held = locks.acquire(Path::new("/tmp/held"), wait).await.unwrap();
        assert_eq!(locks.len(), 1);
        let _next = locks.acquire(Path::new("/tmp/next"), wait).await.unwrap();
        assert_eq!(locks.len(), 2);
        drop(held);
    }

    #[tokio::test]
    async fn test_clone_then_update() {
        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let origin = make_origin(&tmp);
        let url = origin.to_string_lossy().to_string();
        let loader = loader(&tmp);

        let first = loader.checkout(&url, None).await.unwrap();
        assert!(is_full_commit_hash(first.commit()));
        assert_eq!(first.branch(), "main");
        assert!(first.path().join("README.md").exists());
        let first_commit = first.commit().to_string();
        let workdir = first.path().to_path_buf();
        drop(first);

        // Local noise in the working copy must not survive an update.
        std::fs::write(workdir.join("scratch.txt"), "junk").unwrap();
        std::fs::write(workdir.join("README.md"), "edited locally").unwrap();

        std::fs::write(origin.join("lib.rs"), "pub fn f() {}\n").unwrap();
        sh_git(&origin, &["add", "."]);
        sh_git(&origin, &["commit", "--quiet", "-m", "second"]);

        let second = loader.checkout(&url, None).await.unwrap();
        assert_ne!(second.commit(), first_commit);
        assert!(second.path().join("lib.rs").exists());
        assert!(!second.path().join("scratch.txt").exists());
        assert_eq!(
            std::fs::read_to_string(second.path().join("README.md")).unwrap(),
            "# Origin\n"
        );
    }

    #[tokio::test]
    async fn test_missing_repository_is_clone_error() {
        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let loader = loader(&tmp);
        let missing = tmp.path().join("does-not-exist");
        let err = loader
            .checkout(&missing.to_string_lossy(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Clone { .. }), "got {:?}", err);
        assert!(!loader.workdir_for(&missing.to_string_lossy()).exists());
    }

    #[tokio::test]
    async fn test_unknown_branch_is_rejected() {
        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let origin = make_origin(&tmp);
        let url = origin.to_string_lossy().to_string();
        let loader = loader(&tmp);

        drop(loader.checkout(&url, None).await.unwrap());
        let err = loader.checkout(&url, Some("nope")).await.unwrap_err();
        assert!(matches!(err, LoaderError::RepositoryState { .. }));
    }
}
