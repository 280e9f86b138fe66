//! Cache-key derivation: the deterministic "cache hash" addressing a
//! built artifact, plus the per-run memoization of build-file metadata,
//! resolved commits and base-image ids that feed it.

use std::cell::RefCell;
use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::buildfile::{self, Metadata};
use crate::config::Config;
use crate::engine::Engine;
use crate::error::Result;
use crate::gitstore::{normalize_for_tag_usage, GitSource, GitStore};
use crate::manifest::{ManifestEntry, Repo};

/// The repository holding content-addressed build cache tags.
pub const CACHE_REPO: &str = "bashbrew/cache";

/// `bashbrew/cache:<hash>` for a computed hash.
pub fn cache_tag(hash: &str) -> String {
    format!("{}:{}", CACHE_REPO, hash)
}

/// Compose the cache hash from its ordered contributing bits: the git
/// locators, the build file location, the builder (only when explicitly
/// set) and the resolved image id of every base image in order.
pub fn compose_cache_hash(
    git_repo: &str,
    git_commit: &str,
    directory: &str,
    file: &str,
    builder: &str,
    from_ids: &[String],
) -> String {
    let mut bits = vec![git_repo, git_commit, directory, file];
    if !builder.is_empty() {
        bits.push(builder);
    }
    for id in from_ids {
        bits.push(id);
    }
    hex::encode(Sha256::digest(bits.join("\n")))
}

/// Per-run resolution state shared by the graph engine and the planner.
pub struct MetadataResolver<'a> {
    config: &'a Config,
    gitstore: &'a GitStore,
    engine: &'a Engine,
    buildfile_cache: RefCell<HashMap<String, Metadata>>,
    from_id_cache: RefCell<HashMap<String, String>>,
}

impl<'a> MetadataResolver<'a> {
    pub fn new(config: &'a Config, gitstore: &'a GitStore, engine: &'a Engine) -> Self {
        let mut from_ids = HashMap::new();
        // scratch is a built-in, not a real image
        from_ids.insert("scratch".to_string(), "scratch".to_string());
        MetadataResolver {
            config,
            gitstore,
            engine,
            buildfile_cache: RefCell::new(HashMap::new()),
            from_id_cache: RefCell::new(from_ids),
        }
    }

    /// Preseed base-image ids (tests and dry runs).
    pub fn seed_from_id(&self, image: &str, id: &str) {
        self.from_id_cache
            .borrow_mut()
            .insert(image.to_string(), id.to_string());
    }

    /// Ensure the entry's commit (on `arch`) is resolved in the git
    /// store, creating the per-arch browse tag.
    pub async fn fetch_commit(
        &self,
        repo: &Repo,
        entry: &ManifestEntry,
        arch: &str,
    ) -> Result<String> {
        let source = GitSource {
            repo: entry.arch_git_repo(arch),
            fetch: entry.arch_git_fetch(arch),
            commit: entry.arch_git_commit(arch),
        };
        let primary_tag = entry.tags.first().map(String::as_str).unwrap_or("");
        let browse = normalize_for_tag_usage(&format!(
            "{}/{}/{}/{}",
            arch, self.config.namespace, repo.repo_name, primary_tag
        ));
        self.gitstore.resolve_commit(source, &browse).await
    }

    /// The build-file metadata of `entry` on `arch`, memoized on
    /// `(commit, path)`. `oci-import` entries use the constant scratch
    /// metadata without touching git.
    pub async fn arch_metadata(
        &self,
        repo: &Repo,
        entry: &ManifestEntry,
        arch: &str,
    ) -> Result<Metadata> {
        if entry.arch_builder(arch) == "oci-import" {
            return Ok(Metadata::scratch());
        }

        let commit = self.fetch_commit(repo, entry, arch).await?;
        let file = join_path(entry.arch_directory(arch), entry.arch_file(arch));
        let key = format!("{}\n{}", commit, file);

        if let Some(meta) = self.buildfile_cache.borrow().get(&key) {
            return Ok(meta.clone());
        }

        let contents = self.gitstore.show(&commit, &file)?;
        let meta = buildfile::parse(&contents);
        debug!(commit = %commit, file = %file, froms = ?meta.froms, "parsed build file");
        self.buildfile_cache.borrow_mut().insert(key, meta.clone());
        Ok(meta)
    }

    /// Every external base image of `entry` on `arch`, in order.
    pub async fn arch_froms(
        &self,
        repo: &Repo,
        entry: &ManifestEntry,
        arch: &str,
    ) -> Result<Vec<String>> {
        Ok(self.arch_metadata(repo, entry, arch).await?.froms)
    }

    /// The local image id of `from`, memoized for the run.
    pub async fn from_id(&self, from: &str) -> Result<String> {
        if let Some(id) = self.from_id_cache.borrow().get(from) {
            return Ok(id.clone());
        }
        let id = self.engine.inspect_image_id(from).await?;
        self.from_id_cache
            .borrow_mut()
            .insert(from.to_string(), id.clone());
        Ok(id)
    }

    /// The cache hash of `entry` on the active architecture.
    pub async fn cache_hash(&self, repo: &Repo, entry: &ManifestEntry) -> Result<String> {
        let arch = &self.config.arch;
        let commit = self.fetch_commit(repo, entry, arch).await?;
        let meta = self.arch_metadata(repo, entry, arch).await?;

        let mut from_ids = Vec::with_capacity(meta.froms.len());
        for from in &meta.froms {
            from_ids.push(self.from_id(from).await?);
        }

        Ok(compose_cache_hash(
            entry.arch_git_repo(arch),
            &commit,
            entry.arch_directory(arch),
            entry.arch_file(arch),
            entry.arch_builder(arch),
            &from_ids,
        ))
    }

    /// The cache tag (`bashbrew/cache:<hash>`) of `entry`.
    pub async fn cache_name(&self, repo: &Repo, entry: &ManifestEntry) -> Result<String> {
        Ok(cache_tag(&self.cache_hash(repo, entry).await?))
    }
}

fn join_path(directory: &str, file: &str) -> String {
    if directory == "." || directory.is_empty() {
        file.to_string()
    } else {
        format!("{}/{}", directory.trim_end_matches('/'), file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPO: &str = "https://example.com/hello.git";
    const COMMIT: &str = "0ce80411b9f41e9c3a21fc0a1bffba6ae761825a";

    #[test]
    fn cache_hash_is_stable() {
        let ids = vec!["sha256:aaaa".to_string(), "scratch".to_string()];
        let first = compose_cache_hash(REPO, COMMIT, "1.6", "Dockerfile", "", &ids);
        let second = compose_cache_hash(REPO, COMMIT, "1.6", "Dockerfile", "", &ids);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn cache_hash_tracks_every_contributing_bit() {
        let ids = vec!["sha256:aaaa".to_string()];
        let base = compose_cache_hash(REPO, COMMIT, "1.6", "Dockerfile", "", &ids);

        let other_commit = compose_cache_hash(
            REPO,
            "d7e2a8d90a9b8f5dfd5bcd428e0c33b68c40cc19",
            "1.6",
            "Dockerfile",
            "",
            &ids,
        );
        assert_ne!(base, other_commit);

        let other_dir = compose_cache_hash(REPO, COMMIT, "1.7", "Dockerfile", "", &ids);
        assert_ne!(base, other_dir);

        let other_file = compose_cache_hash(REPO, COMMIT, "1.6", "Dockerfile.slim", "", &ids);
        assert_ne!(base, other_file);

        let other_ids = vec!["sha256:bbbb".to_string()];
        let other_from = compose_cache_hash(REPO, COMMIT, "1.6", "Dockerfile", "", &other_ids);
        assert_ne!(base, other_from);
    }

    #[test]
    fn builder_contributes_only_when_set() {
        let ids = vec!["scratch".to_string()];
        let implicit = compose_cache_hash(REPO, COMMIT, ".", "Dockerfile", "", &ids);
        let buildkit = compose_cache_hash(REPO, COMMIT, ".", "Dockerfile", "buildkit", &ids);
        assert_ne!(implicit, buildkit);
    }

    #[test]
    fn cache_tag_shape() {
        let hash = compose_cache_hash(REPO, COMMIT, ".", "Dockerfile", "", &[]);
        let tag = cache_tag(&hash);
        assert!(tag.starts_with("bashbrew/cache:"));
        assert_eq!(tag.len(), "bashbrew/cache:".len() + 64);
    }
}
