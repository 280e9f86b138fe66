//! A read-only virtual filesystem rooted at a git commit's tree.
//!
//! Every entry reports the commit's timestamp (the later of committer and
//! author time) and a fixed POSIX mode derived from the git object mode.
//! Walks never follow symlinks implicitly; read operations resolve them,
//! and absolute symlinks or symlinks escaping the tree are errors.
//! Submodules (gitlink entries) appear as empty directories.

use std::path::Path;

use gix::bstr::ByteSlice;

use crate::error::{BrewError, Result};

/// Maximum symlink hops on a read path.
const MAX_SYMLINK_DEPTH: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Executable,
    Dir,
    Symlink,
    /// A submodule commit pointer, presented as an empty directory.
    Gitlink,
}

impl FileKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, FileKind::Dir | FileKind::Gitlink)
    }

    /// The fixed POSIX mode for this kind of entry.
    pub fn mode(&self) -> u32 {
        match self {
            FileKind::Regular => 0o664,
            FileKind::Executable => 0o775,
            FileKind::Dir | FileKind::Gitlink => 0o775,
            FileKind::Symlink => 0o777,
        }
    }
}

/// Stat information for one entry.
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Base name of the entry ("." for the filesystem root).
    pub name: String,
    pub kind: FileKind,
    /// Blob size for non-directories, 0 otherwise.
    pub size: u64,
    /// Commit timestamp (seconds since the epoch).
    pub mod_time: i64,
    oid: gix::ObjectId,
}

/// A filesystem view of one commit (optionally sub-rooted).
pub struct CommitFs {
    repo: gix::Repository,
    /// Tree id of the commit root (symlink targets resolve against this).
    root_tree: gix::ObjectId,
    /// Path of this view's root below the commit root ("" at the top).
    prefix: String,
    mod_time: i64,
}

fn giterr(context: &str, err: impl std::fmt::Display) -> BrewError {
    BrewError::Git(format!("{context}: {err}"))
}

/// Clean a slash-separated path: drop `.` segments, apply `..`. Returns
/// None when the path escapes the root.
fn clean_path(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

fn join_paths(base: &str, rel: &str) -> String {
    if base.is_empty() {
        rel.to_string()
    } else if rel.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, rel)
    }
}

impl CommitFs {
    /// Open the filesystem of `commit` inside the bare repository at `dir`.
    pub fn open(dir: &Path, commit: &str) -> Result<CommitFs> {
        let repo = gix::open(dir).map_err(|e| giterr("open", e))?;
        let oid = gix::ObjectId::from_hex(commit.as_bytes())
            .map_err(|e| giterr(commit, e))?;
        let commit_obj = repo
            .find_object(oid)
            .map_err(|e| giterr(commit, e))?
            .try_into_commit()
            .map_err(|e| giterr(commit, e))?;

        let committer_time = commit_obj
            .committer()
            .map_err(|e| giterr(commit, e))?
            .time
            .seconds;
        let author_time = commit_obj
            .author()
            .map_err(|e| giterr(commit, e))?
            .time
            .seconds;

        let root_tree = commit_obj
            .tree_id()
            .map_err(|e| giterr(commit, e))?
            .detach();

        drop(commit_obj);

        Ok(CommitFs {
            repo,
            root_tree,
            prefix: String::new(),
            mod_time: committer_time.max(author_time),
        })
    }

    /// The commit timestamp every entry reports.
    pub fn mod_time(&self) -> i64 {
        self.mod_time
    }

    /// A view sub-rooted at `dir` (which must be a directory).
    pub fn sub(&self, dir: &str) -> Result<CommitFs> {
        let stat = self.stat(dir)?;
        if !stat.kind.is_dir() {
            return Err(BrewError::Git(format!("{:?} is not a directory", dir)));
        }
        let full = self.full_path(dir)?;
        Ok(CommitFs {
            repo: self.repo.clone(),
            root_tree: self.root_tree,
            prefix: full,
            mod_time: self.mod_time,
        })
    }

    fn full_path(&self, rel: &str) -> Result<String> {
        let cleaned = clean_path(rel).ok_or_else(|| {
            BrewError::Git(format!("path {:?} escapes the tree", rel))
        })?;
        Ok(join_paths(&self.prefix, &cleaned))
    }

    /// Look up `full` (relative to the commit root) without following a
    /// final symlink.
    fn lookup(&self, full: &str) -> Result<FileStat> {
        let mut tree_oid = self.root_tree;
        if full.is_empty() {
            return Ok(FileStat {
                name: ".".to_string(),
                kind: FileKind::Dir,
                size: 0,
                mod_time: self.mod_time,
                oid: tree_oid,
            });
        }

        let mut components = full.split('/').peekable();
        while let Some(component) = components.next() {
            let entry = self.dir_entry(tree_oid, component, full)?;
            if components.peek().is_none() {
                return Ok(entry);
            }
            if !entry.kind.is_dir() {
                return Err(BrewError::Git(format!(
                    "cannot descend into non-directory {:?} in {:?}",
                    component, full
                )));
            }
            if entry.kind == FileKind::Gitlink {
                return Err(BrewError::Git(format!(
                    "cannot descend into submodule {:?} in {:?}",
                    component, full
                )));
            }
            tree_oid = entry.oid;
        }
        unreachable!("split always yields at least one component")
    }

    fn dir_entry(&self, tree_oid: gix::ObjectId, name: &str, context: &str) -> Result<FileStat> {
        let tree = self
            .repo
            .find_object(tree_oid)
            .map_err(|e| giterr(context, e))?
            .try_into_tree()
            .map_err(|e| giterr(context, e))?;
        for entry in tree.iter() {
            let entry = entry.map_err(|e| giterr(context, e))?;
            if entry.filename().as_bytes() == name.as_bytes() {
                let oid = entry.id().detach();
                let kind = entry_kind(entry.mode());
                let size = match kind {
                    FileKind::Regular | FileKind::Executable | FileKind::Symlink => {
                        self.blob_size(oid, context)?
                    }
                    _ => 0,
                };
                return Ok(FileStat {
                    name: name.to_string(),
                    kind,
                    size,
                    mod_time: self.mod_time,
                    oid,
                });
            }
        }
        Err(BrewError::Git(format!(
            "{:?} not found in tree (looking up {:?})",
            name, context
        )))
    }

    fn blob_size(&self, oid: gix::ObjectId, context: &str) -> Result<u64> {
        let obj = self.repo.find_object(oid).map_err(|e| giterr(context, e))?;
        Ok(obj.data.len() as u64)
    }

    fn blob_data(&self, oid: gix::ObjectId, context: &str) -> Result<Vec<u8>> {
        let obj = self.repo.find_object(oid).map_err(|e| giterr(context, e))?;
        Ok(obj.data.clone())
    }

    /// Resolve a symlink entry at `full` to the cleaned target path
    /// (relative to the commit root).
    fn resolve_link(&self, full: &str, stat: &FileStat) -> Result<String> {
        let target_bytes = self.blob_data(stat.oid, full)?;
        let target = String::from_utf8_lossy(&target_bytes).to_string();
        if target.is_empty() {
            return Err(BrewError::Git(format!("unexpected: empty symlink {:?}", full)));
        }
        if target.starts_with('/') {
            return Err(BrewError::Git(format!(
                "unsupported: {:?} is an absolute symlink ({:?})",
                full, target
            )));
        }
        let parent = match full.rfind('/') {
            Some(idx) => &full[..idx],
            None => "",
        };
        clean_path(&join_paths(parent, &target)).ok_or_else(|| {
            BrewError::Git(format!(
                "unsupported: {:?} is a relative symlink outside the tree ({:?})",
                full, target
            ))
        })
    }

    fn stat_full(&self, full: &str, follow: bool) -> Result<FileStat> {
        let mut full = full.to_string();
        for _ in 0..MAX_SYMLINK_DEPTH {
            let stat = self.lookup(&full)?;
            if !follow || stat.kind != FileKind::Symlink {
                return Ok(stat);
            }
            full = self.resolve_link(&full, &stat)?;
        }
        Err(BrewError::Git(format!(
            "too many levels of symbolic links resolving {:?}",
            full
        )))
    }

    /// Stat `path`, following symlinks.
    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let full = self.full_path(path)?;
        self.stat_full(&full, true)
    }

    /// The raw target of the symlink at `path` (no resolution).
    pub fn read_link(&self, path: &str) -> Result<String> {
        let full = self.full_path(path)?;
        let stat = self.stat_full(&full, false)?;
        if stat.kind != FileKind::Symlink {
            return Err(BrewError::Git(format!("{:?} is not a symlink", path)));
        }
        let target = self.blob_data(stat.oid, &full)?;
        Ok(String::from_utf8_lossy(&target).to_string())
    }

    /// Read the file at `path` (symlinks resolved).
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(path)?;
        let stat = self.stat_full(&full, true)?;
        match stat.kind {
            FileKind::Regular | FileKind::Executable => self.blob_data(stat.oid, &full),
            _ => Err(BrewError::Git(format!("{:?} is not a regular file", path))),
        }
    }

    /// List the directory at `path`, sorted by name. Symlinked entries are
    /// reported as symlinks (not followed); submodules list as empty dirs.
    pub fn read_dir(&self, path: &str) -> Result<Vec<FileStat>> {
        let full = self.full_path(path)?;
        let stat = self.stat_full(&full, true)?;
        if stat.kind == FileKind::Gitlink {
            return Ok(Vec::new());
        }
        if stat.kind != FileKind::Dir {
            return Err(BrewError::Git(format!("{:?} is not a directory", path)));
        }

        let tree = self
            .repo
            .find_object(stat.oid)
            .map_err(|e| giterr(&full, e))?
            .try_into_tree()
            .map_err(|e| giterr(&full, e))?;

        let mut entries = Vec::new();
        for entry in tree.iter() {
            let entry = entry.map_err(|e| giterr(&full, e))?;
            let name = entry.filename().to_str_lossy().into_owned();
            let oid = entry.id().detach();
            let kind = entry_kind(entry.mode());
            let size = match kind {
                FileKind::Regular | FileKind::Executable | FileKind::Symlink => {
                    self.blob_size(oid, &full)?
                }
                _ => 0,
            };
            entries.push(FileStat {
                name,
                kind,
                size,
                mod_time: self.mod_time,
                oid,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

fn entry_kind(mode: gix::objs::tree::EntryMode) -> FileKind {
    use gix::objs::tree::EntryKind;
    match mode.kind() {
        EntryKind::Tree => FileKind::Dir,
        EntryKind::Blob => FileKind::Regular,
        EntryKind::BlobExecutable => FileKind::Executable,
        EntryKind::Link => FileKind::Symlink,
        EntryKind::Commit => FileKind::Gitlink,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::gitstore::testutil;
    use crate::gitstore::{GitSource, GitStore};

    async fn fixture() -> (tempfile::TempDir, GitStore, String) {
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
        (cache_dir, store, commit)
    }

    #[tokio::test]
    async fn stat_modes_and_times() {
        let (_cache, store, commit) = fixture().await;
        let fs = store.commit_fs(&commit).unwrap();

        let root = fs.stat(".").unwrap();
        assert_eq!(root.kind, FileKind::Dir);
        assert_eq!(root.kind.mode(), 0o775);
        // fixture commits are pinned to 2020-01-02T03:04:05Z
        assert_eq!(root.mod_time, 1577934245);

        let file = fs.stat("sub/file.txt").unwrap();
        assert_eq!(file.kind, FileKind::Regular);
        assert_eq!(file.kind.mode(), 0o664);
        assert_eq!(file.size, 6);
        assert_eq!(file.mod_time, root.mod_time);

        let tool = fs.stat("sub/tool.sh").unwrap();
        assert_eq!(tool.kind, FileKind::Executable);
        assert_eq!(tool.kind.mode(), 0o775);
    }

    #[tokio::test]
    async fn symlinks_resolve_for_reads_only() {
        let (_cache, store, commit) = fixture().await;
        let fs = store.commit_fs(&commit).unwrap();

        // stat and read follow the link
        let stat = fs.stat("sub/link.txt").unwrap();
        assert_eq!(stat.kind, FileKind::Regular);
        assert_eq!(fs.read_file("sub/link.txt").unwrap(), b"hello\n");

        // read_link reports the raw target
        assert_eq!(fs.read_link("sub/link.txt").unwrap(), "file.txt");

        // the directory listing does not follow it
        let listing = fs.read_dir("sub").unwrap();
        let link = listing.iter().find(|e| e.name == "link.txt").unwrap();
        assert_eq!(link.kind, FileKind::Symlink);
        assert_eq!(link.kind.mode(), 0o777);
    }

    #[tokio::test]
    async fn bad_symlinks_error() {
        let (_cache, store, commit) = fixture().await;
        let fs = store.commit_fs(&commit).unwrap();

        let err = fs.read_file("sub/abs-link").unwrap_err();
        assert!(err.to_string().contains("absolute symlink"), "{err}");

        let err = fs.read_file("sub/escape-link").unwrap_err();
        assert!(err.to_string().contains("outside the tree"), "{err}");
    }

    #[tokio::test]
    async fn read_dir_is_sorted_and_sub_roots() {
        let (_cache, store, commit) = fixture().await;
        let fs = store.commit_fs(&commit).unwrap();

        let names: Vec<String> = fs
            .read_dir(".")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["Dockerfile", "sub"]);

        let sub = fs.sub("sub").unwrap();
        let names: Vec<String> = sub
            .read_dir(".")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(
            names,
            vec!["abs-link", "escape-link", "file.txt", "link.txt", "tool.sh"]
        );
        assert_eq!(sub.read_file("file.txt").unwrap(), b"hello\n");

        // a symlink inside the sub view still resolves against the commit
        // root (and stays inside the tree)
        assert_eq!(sub.read_file("link.txt").unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn missing_paths_error() {
        let (_cache, store, commit) = fixture().await;
        let fs = store.commit_fs(&commit).unwrap();
        assert!(fs.stat("nope").is_err());
        assert!(fs.read_file("sub/nope").is_err());
        assert!(fs.sub("Dockerfile").is_err());
    }
}
