//! Library lookup: resolving repo arguments to parsed manifests.
//!
//! A repo argument is `<name>[:<tag>]` where `<name>` is resolved (in
//! order) as a remote URL, a file path, or a file under the library
//! directory. Loaded repos are cached for the life of the run.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::error::{BrewError, Result};
use crate::manifest::{parse, Manifest, ManifestEntry};

/// A repository resolved from a library argument, optionally narrowed to a
/// single tag (or shared tag).
#[derive(Debug, Clone)]
pub struct Repo {
    pub repo_name: String,
    pub tag_name: Option<String>,
    /// Indexes into `manifest.entries` when narrowed to a tag.
    pub tag_entries: Option<Vec<usize>>,
    pub manifest: Manifest,
}

impl Repo {
    /// The entries this repo argument selects, in manifest order.
    pub fn entries(&self) -> Vec<&ManifestEntry> {
        match &self.tag_entries {
            Some(indexes) => indexes.iter().map(|&i| &self.manifest.entries[i]).collect(),
            None => self.manifest.entries.iter().collect(),
        }
    }

    /// `<repo>:<first tag>` -- the identifier used in diagnostics.
    pub fn entry_identifier(&self, entry: &ManifestEntry) -> String {
        let tag = entry.tags.first().map(String::as_str).unwrap_or("");
        format!("{}:{}", self.repo_name, tag)
    }

    /// The namespaced tags of `entry`: `<namespace>/<repo>:<tag>` for each
    /// tag (first only with `uniq`), shared tags appended when not `uniq`.
    pub fn tags(&self, namespace: &str, uniq: bool, entry: &ManifestEntry) -> Vec<String> {
        let repo = namespaced_repo(namespace, &self.repo_name);
        let mut ret = Vec::new();
        for (i, tag) in entry.tags.iter().enumerate() {
            if uniq && i > 0 {
                break;
            }
            ret.push(format!("{}:{}", repo, tag));
        }
        if !uniq {
            for tag in &entry.shared_tags {
                ret.push(format!("{}:{}", repo, tag));
            }
        }
        ret
    }

    /// Whether `entry` should be skipped under the configured constraints.
    ///
    /// Every constraint on the entry must hold: `x` holds when `x` is in
    /// the active set, `!x` holds when `x` is not. Entries without
    /// constraints are skipped only under `exclusive_constraints`.
    pub fn skip_constraints(
        &self,
        entry: &ManifestEntry,
        arch: &str,
        active: &[String],
        exclusive: bool,
    ) -> bool {
        let constraints = entry.arch_constraints(arch);
        if constraints.is_empty() {
            return exclusive;
        }
        for constraint in constraints {
            let ok = match constraint.strip_prefix('!') {
                Some(negated) => !active.iter().any(|c| c == negated),
                None => active.iter().any(|c| c == constraint),
            };
            if !ok {
                return true;
            }
        }
        false
    }
}

/// `path::join`-style namespace prefixing (empty namespace is a no-op).
pub fn namespaced_repo(namespace: &str, repo_name: &str) -> String {
    if namespace.is_empty() {
        repo_name.to_string()
    } else {
        format!("{}/{}", namespace, repo_name)
    }
}

/// The library directory plus the per-run repo cache.
pub struct Library {
    dir: PathBuf,
    cache: RefCell<HashMap<String, Rc<Repo>>>,
}

impl Library {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Library {
            dir: dir.into(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All repo names in the library directory, sorted.
    pub fn all_repos(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| BrewError::io(self.dir.clone(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| BrewError::io(self.dir.clone(), e))?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Resolve a repo argument to a parsed (and possibly tag-narrowed)
    /// repository.
    pub async fn fetch(&self, repo: &str) -> Result<Rc<Repo>> {
        if let Some(cached) = self.cache.borrow().get(repo) {
            return Ok(Rc::clone(cached));
        }

        let fetched = Rc::new(self.fetch_uncached(repo).await?);
        self.cache
            .borrow_mut()
            .insert(repo.to_string(), Rc::clone(&fetched));
        Ok(fetched)
    }

    async fn fetch_uncached(&self, repo: &str) -> Result<Repo> {
        let base = repo.rsplit('/').next().unwrap_or(repo);
        let (repo_name, tag_name) = match base.split_once(':') {
            Some((name, tag)) if !name.is_empty() => (name.to_string(), Some(tag.to_string())),
            _ => (base.to_string(), None),
        };
        let source = match &tag_name {
            Some(tag) => repo
                .strip_suffix(&format!(":{}", tag))
                .unwrap_or(repo)
                .to_string(),
            None => repo.to_string(),
        };

        let content = self.read_source(&source).await?;
        let manifest = parse(&content)?;

        let tag_entries = match &tag_name {
            Some(tag) => {
                let mut indexes: Vec<usize> = manifest
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.tags.iter().any(|t| t == tag))
                    .map(|(i, _)| i)
                    .collect();
                if indexes.is_empty() {
                    indexes = manifest
                        .entries
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| e.shared_tags.iter().any(|t| t == tag))
                        .map(|(i, _)| i)
                        .collect();
                }
                if indexes.is_empty() {
                    return Err(BrewError::TagNotFound {
                        repo: repo_name,
                        tag: tag.clone(),
                    });
                }
                Some(indexes)
            }
            None => None,
        };

        Ok(Repo {
            repo_name,
            tag_name,
            tag_entries,
            manifest,
        })
    }

    async fn read_source(&self, source: &str) -> Result<String> {
        if source.starts_with("http://") || source.starts_with("https://") {
            debug!(url = source, "fetching remote manifest");
            let response = reqwest::get(source).await?.error_for_status()?;
            return Ok(response.text().await?);
        }

        for path in [PathBuf::from(source), self.dir.join(source)] {
            match std::fs::read_to_string(&path) {
                Ok(content) => return Ok(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(BrewError::io(path, e)),
            }
        }

        Err(BrewError::ManifestNotFound {
            repo: source.to_string(),
            library: self.dir.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASH_MANIFEST: &str = "\
Maintainers: Some Body <somebody@example.com> (@somebody)
GitRepo: https://example.com/docker-bash.git

Tags: 4.4.12, 4.4, 4, latest
GitCommit: 1cbb5cf49b4c53bd5a986abf7a1afeb9a80eac1e
Directory: 4.4

Tags: 4.3
SharedTags: stable
GitCommit: d7e2a8d90a9b8f5dfd5bcd428e0c33b68c40cc19
Directory: 4.3
";

    fn library_with_bash() -> (tempfile::TempDir, Library) {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("bash"), BASH_MANIFEST).unwrap();
        let library = Library::new(dir.path());
        (dir, library)
    }

    #[tokio::test]
    async fn fetches_by_name_and_tag() {
        let (_dir, library) = library_with_bash();

        let repo = library.fetch("bash").await.unwrap();
        assert_eq!(repo.repo_name, "bash");
        assert_eq!(repo.entries().len(), 2);

        let narrowed = library.fetch("bash:4.4").await.unwrap();
        assert_eq!(narrowed.tag_name.as_deref(), Some("4.4"));
        assert_eq!(narrowed.entries().len(), 1);
        assert_eq!(narrowed.entries()[0].tags[0], "4.4.12");
    }

    #[tokio::test]
    async fn shared_tag_selects_all_members() {
        let (_dir, library) = library_with_bash();
        let narrowed = library.fetch("bash:stable").await.unwrap();
        assert_eq!(narrowed.entries().len(), 1);
        assert_eq!(narrowed.entries()[0].tags[0], "4.3");
    }

    #[tokio::test]
    async fn missing_manifest_and_tag_are_distinct_errors() {
        let (_dir, library) = library_with_bash();

        let err = library.fetch("nope").await.unwrap_err();
        assert!(matches!(err, BrewError::ManifestNotFound { .. }), "{err}");

        let err = library.fetch("bash:9.9").await.unwrap_err();
        assert!(matches!(err, BrewError::TagNotFound { .. }), "{err}");
    }

    #[tokio::test]
    async fn all_repos_are_sorted() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("zsh"), BASH_MANIFEST).unwrap();
        std::fs::write(dir.path().join("bash"), BASH_MANIFEST).unwrap();
        let library = Library::new(dir.path());
        assert_eq!(library.all_repos().unwrap(), vec!["bash", "zsh"]);
    }

    #[test]
    fn tags_include_shared_unless_uniq() {
        let manifest = parse(BASH_MANIFEST).unwrap();
        let repo = Repo {
            repo_name: "bash".to_string(),
            tag_name: None,
            tag_entries: None,
            manifest,
        };
        let entry = &repo.manifest.entries[1];
        assert_eq!(
            repo.tags("", false, entry),
            vec!["bash:4.3", "bash:stable"]
        );
        assert_eq!(repo.tags("ns", true, entry), vec!["ns/bash:4.3"]);
    }

    #[test]
    fn constraint_skipping() {
        let manifest = parse(BASH_MANIFEST).unwrap();
        let mut entry = manifest.entries[0].clone();
        let repo = Repo {
            repo_name: "bash".to_string(),
            tag_name: None,
            tag_entries: None,
            manifest: Manifest::default(),
        };

        // no constraints: only skipped in exclusive mode
        assert!(!repo.skip_constraints(&entry, "amd64", &[], false));
        assert!(repo.skip_constraints(&entry, "amd64", &[], true));

        entry.constraints = vec!["special-builder".to_string()];
        assert!(repo.skip_constraints(&entry, "amd64", &[], false));
        assert!(!repo.skip_constraints(
            &entry,
            "amd64",
            &["special-builder".to_string()],
            false
        ));

        entry.constraints = vec!["!special-builder".to_string()];
        assert!(!repo.skip_constraints(&entry, "amd64", &[], false));
        assert!(repo.skip_constraints(
            &entry,
            "amd64",
            &["special-builder".to_string()],
            false
        ));
    }
}
