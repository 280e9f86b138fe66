//! Git object store: a single long-lived bare repository used as a
//! content-addressed cache of upstream build contexts.
//!
//! Remote fetches and ref mutation shell out to `git` (tag writes are
//! serialized by the orchestration loop); object reads go through `gix`.
//! Garbage collection is disabled at init so dangling commits stay
//! reachable between runs.

mod fs;

pub use fs::{CommitFs, FileKind, FileStat};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{BrewError, Result};
use crate::manifest::GIT_COMMIT_RE;

/// The git locators of one manifest entry on one architecture.
#[derive(Debug, Clone, Copy)]
pub struct GitSource<'a> {
    pub repo: &'a str,
    pub fetch: &'a str,
    pub commit: &'a str,
}

impl GitSource<'_> {
    /// `<repo> NL <fetch> NL <commit>` -- the resolution memo key.
    pub fn cache_key(&self) -> String {
        [self.repo, self.fetch, self.commit].join("\n")
    }
}

pub struct GitStore {
    dir: PathBuf,
    initialized: Cell<bool>,
    resolve_cache: RefCell<HashMap<String, String>>,
}

impl GitStore {
    /// A store rooted at `<cache_root>/git`.
    pub fn new(cache_root: &Path) -> GitStore {
        GitStore {
            dir: cache_root.join("git"),
            initialized: Cell::new(false),
            resolve_cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Initialize the bare repository if necessary and force `gc.auto=0`
    /// (dangling commits must survive between runs).
    pub async fn ensure_init(&self) -> Result<()> {
        if self.initialized.get() {
            return Ok(());
        }
        if !self.dir.join("HEAD").exists() {
            std::fs::create_dir_all(&self.dir).map_err(|e| BrewError::io(self.dir.clone(), e))?;
            self.git(&["init", "--quiet", "--bare", "."]).await?;
        }
        self.git(&["config", "gc.auto", "0"]).await?;
        self.initialized.set(true);
        Ok(())
    }

    /// Run `git` inside the store, surfacing stderr on non-zero exit.
    async fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!(?args, "git");
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BrewError::io(&self.dir, e))?;
        if !output.status.success() {
            return Err(BrewError::Process {
                argv: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn open(&self) -> Result<gix::Repository> {
        gix::open(&self.dir).map_err(|e| BrewError::Git(e.to_string()))
    }

    /// Resolve `committish` against local objects only, peeling to a
    /// full-length commit id.
    fn local_commit(&self, committish: &str) -> Result<String> {
        let repo = self.open()?;
        if committish.len() == 40 || committish.len() == 64 {
            if let Ok(oid) = gix::ObjectId::from_hex(committish.as_bytes()) {
                let obj = repo
                    .find_object(oid)
                    .map_err(|e| BrewError::Git(format!("{committish}: {e}")))?;
                if obj.kind != gix::object::Kind::Commit {
                    return Err(BrewError::Git(format!("{committish} is not a commit")));
                }
                return Ok(committish.to_string());
            }
        }
        let id = repo
            .rev_parse_single(committish)
            .map_err(|e| BrewError::Git(format!("{committish}: {e}")))?;
        let obj = id
            .object()
            .map_err(|e| BrewError::Git(format!("{committish}: {e}")))?;
        let commit = obj
            .peel_to_kind(gix::object::Kind::Commit)
            .map_err(|e| BrewError::Git(format!("{committish}: {e}")))?;
        Ok(commit.id.to_string())
    }

    /// Resolve a manifest entry's commit to a full commit id, fetching
    /// from the remote when it is not already present.
    ///
    /// `browse_tag` (when non-empty) receives a local tag pointing at the
    /// resolved commit so repeat runs are idempotent and the cache is
    /// browsable.
    pub async fn resolve_commit(&self, source: GitSource<'_>, browse_tag: &str) -> Result<String> {
        let cache_key = source.cache_key();
        if let Some(commit) = self.resolve_cache.borrow().get(&cache_key) {
            return Ok(commit.clone());
        }

        self.ensure_init().await?;

        if GIT_COMMIT_RE.is_match(source.commit) {
            if let Ok(commit) = self.local_commit(source.commit) {
                self.finish_resolve(&cache_key, &commit, browse_tag).await?;
                return Ok(commit);
            }
        }

        let mut repo_url = source.repo.to_string();
        if let Some(rest) = repo_url.strip_prefix("git://github.com/") {
            warn!("insecure protocol git:// detected: {}", repo_url);
            repo_url = format!("https://github.com/{}", rest);
        }

        // a fresh temp ref namespace, removed once resolution is done
        let refs_dir = self.dir.join("refs").join("remotes");
        std::fs::create_dir_all(&refs_dir).map_err(|e| BrewError::io(&refs_dir, e))?;

        let mut fetch_specs: Vec<(String, String)> = Vec::new(); // (refspec, resolve target)
        let mut temp_guard = None;

        if source.commit == "FETCH_HEAD" {
            // fetch the remote ref to a stable local tag so repeat runs hit
            // the local lookup instead of the network
            let local_ref = format!("refs/tags/{}", normalize_for_tag_usage(&cache_key));
            if let Ok(commit) = self.local_commit(&local_ref) {
                self.finish_resolve(&cache_key, &commit, browse_tag).await?;
                return Ok(commit);
            }
            fetch_specs.push((format!("{}:{}", source.fetch, local_ref), local_ref.clone()));
        } else {
            let temp_dir = tempfile::Builder::new()
                .prefix("temp")
                .tempdir_in(&refs_dir)
                .map_err(|e| BrewError::io(&refs_dir, e))?;
            let temp_name = temp_dir
                .path()
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("temp")
                .to_string();
            let temp_ref = format!("refs/remotes/{}/temp", temp_name);
            // direct-commit fetch first: O(commit-reachable) when the
            // remote accepts it, with the declared ref as fallback
            fetch_specs.push((
                format!("{}:{}", source.commit, temp_ref),
                source.commit.to_string(),
            ));
            fetch_specs.push((
                format!("{}:{}", source.fetch, temp_ref),
                source.commit.to_string(),
            ));
            temp_guard = Some(temp_dir);
        }

        let mut attempts = Vec::new();
        let mut resolved = None;
        for (refspec, target) in &fetch_specs {
            match self
                .git(&["fetch", "--no-tags", repo_url.as_str(), refspec.as_str()])
                .await
            {
                Err(e) => {
                    attempts.push(format!("failed fetching {:?}: {}", refspec, e));
                    continue;
                }
                Ok(_) => match self.local_commit(target) {
                    Err(e) => {
                        attempts.push(format!(
                            "failed finding commit {:?} after fetching {:?}: {}",
                            target, refspec, e
                        ));
                        continue;
                    }
                    Ok(commit) => {
                        resolved = Some(commit);
                        break;
                    }
                },
            }
        }
        drop(temp_guard);

        let commit = resolved.ok_or_else(|| BrewError::GitFetch {
            commit: source.commit.to_string(),
            attempts,
        })?;

        self.finish_resolve(&cache_key, &commit, browse_tag).await?;
        Ok(commit)
    }

    async fn finish_resolve(&self, cache_key: &str, commit: &str, browse_tag: &str) -> Result<()> {
        if !browse_tag.is_empty() {
            // -f replaces any stale tag from a previous run
            self.git(&["tag", "-f", browse_tag, commit]).await?;
        }
        self.resolve_cache
            .borrow_mut()
            .insert(cache_key.to_string(), commit.to_string());
        Ok(())
    }

    /// A read-only filesystem rooted at the commit's tree.
    pub fn commit_fs(&self, commit: &str) -> Result<CommitFs> {
        CommitFs::open(&self.dir, commit)
    }

    /// The contents of one file at `path` in `commit`.
    pub fn show(&self, commit: &str, path: &str) -> Result<String> {
        let fs = self.commit_fs(commit)?;
        let bytes = fs.read_file(path)?;
        String::from_utf8(bytes).map_err(|e| BrewError::Git(format!("{commit}:{path}: {e}")))
    }
}

static GIT_BAD_TAG_CHARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        "(?:",
        "[^0-9a-zA-Z/._-]+",
        "|/[.]+",
        "|[.]lock(?:/|$)",
        "|[.][.]+",
        "|[/.]+$",
        "|^[/.]+",
        ")"
    ))
    .unwrap()
});

static GIT_MULTIPLE_SLASHES: Lazy<Regex> = Lazy::new(|| Regex::new("//+").unwrap());

/// Strip/replace characters that are invalid in a git tag name.
pub fn normalize_for_tag_usage(text: &str) -> String {
    let replaced = GIT_BAD_TAG_CHARS.replace_all(text, "-");
    GIT_MULTIPLE_SLASHES.replace_all(&replaced, "/").to_string()
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;
    use std::process::Command;

    /// Build a throwaway source repository, returning the commit id of HEAD.
    pub fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "Test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_AUTHOR_DATE", "2020-01-02T03:04:05 +0000")
            .env("GIT_COMMITTER_NAME", "Test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_DATE", "2020-01-02T03:04:05 +0000")
            .status()
            .expect("git invocation failed");
        assert!(status.success(), "git {:?} failed", args);
    }

    pub fn git_out(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git invocation failed");
        assert!(output.status.success(), "git {:?} failed", args);
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    pub fn init_source_repo(dir: &Path) -> String {
        git(dir, &["init", "--quiet", "-b", "main"]);
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("Dockerfile"), "FROM busybox:uclibc\n").unwrap();
        std::fs::write(dir.join("sub/file.txt"), "hello\n").unwrap();
        std::fs::write(dir.join("sub/tool.sh"), "#!/bin/sh\necho hi\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                dir.join("sub/tool.sh"),
                std::fs::Permissions::from_mode(0o755),
            )
            .unwrap();
            std::os::unix::fs::symlink("file.txt", dir.join("sub/link.txt")).unwrap();
            std::os::unix::fs::symlink("/etc/passwd", dir.join("sub/abs-link")).unwrap();
            std::os::unix::fs::symlink("../../escape", dir.join("sub/escape-link")).unwrap();
        }
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "--quiet", "-m", "fixture"]);
        git(dir, &["tag", "v1"]);
        git_out(dir, &["rev-parse", "HEAD"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_normalization() {
        assert_eq!(
            normalize_for_tag_usage("https://github.com/x/y.git\nrefs/heads/master\nFETCH_HEAD"),
            "https-/github.com/x/y.git-refs/heads/master-FETCH_HEAD"
        );
        assert_eq!(normalize_for_tag_usage("a//b"), "a/b");
        assert_eq!(normalize_for_tag_usage("..a.."), "-a-");
        assert_eq!(normalize_for_tag_usage("/leading/trailing/"), "-leading/trailing-");
    }

    #[tokio::test]
    async fn resolves_commits_and_memoizes() {
        let source_dir = tempfile::TempDir::new().unwrap();
        let commit = testutil::init_source_repo(source_dir.path());

        let cache_dir = tempfile::TempDir::new().unwrap();
        let store = GitStore::new(cache_dir.path());

        let url = source_dir.path().to_str().unwrap().to_string();
        let source = GitSource {
            repo: &url,
            fetch: "refs/heads/main",
            commit: &commit,
        };

        let resolved = store.resolve_commit(source, "amd64/test/fixture").await.unwrap();
        assert_eq!(resolved, commit);

        // memoized; a second resolution must not hit the remote at all
        let resolved = store.resolve_commit(source, "amd64/test/fixture").await.unwrap();
        assert_eq!(resolved, commit);

        // the browse tag exists and points at the commit
        let tagged = store.local_commit("refs/tags/amd64/test/fixture").unwrap();
        assert_eq!(tagged, commit);
    }

    #[tokio::test]
    async fn fetch_head_uses_a_stable_local_tag() {
        let source_dir = tempfile::TempDir::new().unwrap();
        let commit = testutil::init_source_repo(source_dir.path());

        let cache_dir = tempfile::TempDir::new().unwrap();
        let store = GitStore::new(cache_dir.path());

        let url = source_dir.path().to_str().unwrap().to_string();
        let source = GitSource {
            repo: &url,
            fetch: "refs/tags/v1",
            commit: "FETCH_HEAD",
        };

        let resolved = store.resolve_commit(source, "").await.unwrap();
        assert_eq!(resolved, commit);

        let local_ref = format!("refs/tags/{}", normalize_for_tag_usage(&source.cache_key()));
        assert_eq!(store.local_commit(&local_ref).unwrap(), resolved);

        // deleting the source proves a fresh store on the same cache
        // resolves from the stable local tag without the network
        drop(source_dir);
        let fresh = GitStore::new(cache_dir.path());
        let resolved_again = fresh.resolve_commit(source, "").await.unwrap();
        assert_eq!(resolved_again, resolved);
    }

    #[tokio::test]
    async fn aggregates_fetch_failures() {
        let cache_dir = tempfile::TempDir::new().unwrap();
        let store = GitStore::new(cache_dir.path());

        let source = GitSource {
            repo: "/nonexistent/source/repo",
            fetch: "refs/heads/main",
            commit: "0ce80411b9f41e9c3a21fc0a1bffba6ae761825a",
        };
        match store.resolve_commit(source, "").await.unwrap_err() {
            BrewError::GitFetch { attempts, .. } => {
                // both the direct-commit attempt and the declared-ref
                // fallback must be reported
                assert_eq!(attempts.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn show_reads_a_blob() {
        let source_dir = tempfile::TempDir::new().unwrap();
        let commit = testutil::init_source_repo(source_dir.path());

        let cache_dir = tempfile::TempDir::new().unwrap();
        let store = GitStore::new(cache_dir.path());
        let url = source_dir.path().to_str().unwrap().to_string();
        store
            .resolve_commit(
                GitSource {
                    repo: &url,
                    fetch: "refs/heads/main",
                    commit: &commit,
                },
                "",
            )
            .await
            .unwrap();

        assert_eq!(
            store.show(&commit, "Dockerfile").unwrap(),
            "FROM busybox:uclibc\n"
        );
        assert_eq!(store.show(&commit, "sub/file.txt").unwrap(), "hello\n");
    }
}
