//! Action planning and execution: decide per entry whether to build,
//! re-import from the content store, or re-tag an existing build, and
//! drive the external engine accordingly. Push and multi-arch publication
//! follow the same shape.

use std::io::Write as _;

use tracing::{debug, info, warn};

use crate::arch;
use crate::cache::MetadataResolver;
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{BrewError, Result};
use crate::gitstore::GitStore;
use crate::graph;
use crate::manifest::{namespaced_repo, Library, ManifestEntry, Repo};
use crate::oci::Descriptor;
use crate::ociimport;
use crate::registry::{Reference, RegistryClient};
use crate::store::{self, ContentStore};
use crate::tarscrub;

/// Pre-build pull policy for non-`scratch` base images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    Missing,
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = BrewError;

    fn from_str(s: &str) -> Result<PullPolicy> {
        match s {
            "always" => Ok(PullPolicy::Always),
            "missing" => Ok(PullPolicy::Missing),
            "never" => Ok(PullPolicy::Never),
            other => Err(BrewError::Other(anyhow::anyhow!(
                "invalid value for --pull: {:?}",
                other
            ))),
        }
    }
}

/// Everything a run needs, wired together once per invocation.
pub struct Planner<'a> {
    pub config: &'a Config,
    pub library: &'a Library,
    pub gitstore: &'a GitStore,
    pub engine: &'a Engine,
    pub store: &'a dyn ContentStore,
    pub resolver: &'a MetadataResolver<'a>,
    pub registry: RegistryClient,
}

/// Gather the repo arguments for a command (`--all` prepends every
/// library repo).
pub fn gather_repos(library: &Library, all: bool, args: &[String]) -> Result<Vec<String>> {
    let mut repos = Vec::new();
    if all {
        repos.extend(library.all_repos()?);
    }
    repos.extend(args.iter().cloned());
    if repos.is_empty() {
        return Err(BrewError::Other(anyhow::anyhow!(
            "need at least one repo (either explicitly or via --all)"
        )));
    }
    Ok(repos)
}

impl Planner<'_> {
    fn skip(&self, repo: &Repo, entry: &ManifestEntry) -> bool {
        repo.skip_constraints(
            entry,
            &self.config.arch,
            &self.config.constraints,
            self.config.exclusive_constraints,
        )
    }

    /// Sort repo arguments into build order (dependencies first).
    pub async fn sort_repos(
        &self,
        repo_args: Vec<String>,
        apply_constraints: bool,
    ) -> Result<Vec<String>> {
        graph::sort_repo_args(
            self.library,
            self.resolver,
            self.config,
            repo_args,
            apply_constraints,
        )
        .await
    }

    /// This repo's selected entries in intra-repository build order.
    pub async fn sorted_entries<'r>(
        &self,
        repo: &'r Repo,
        apply_constraints: bool,
    ) -> Result<Vec<&'r ManifestEntry>> {
        graph::sorted_repo_entries(self.resolver, self.config, repo, apply_constraints).await
    }

    fn canonical_tags(&self, tags: &[String]) -> Result<Vec<String>> {
        tags.iter()
            .map(|tag| Ok(Reference::parse(tag)?.canonical()))
            .collect()
    }

    /// Export `desc` from the content store and `docker load` it under
    /// `tags`.
    async fn docker_load(&self, desc: &Descriptor, tags: &[String]) -> Result<()> {
        let names = self.canonical_tags(tags)?;
        let mut tarball = tempfile::NamedTempFile::new()
            .map_err(|e| BrewError::io("oci export", e))?;
        store::export_oci_layout(self.store, desc, &names, tarball.as_file_mut())?;
        tarball
            .as_file_mut()
            .flush()
            .map_err(|e| BrewError::io("oci export", e))?;
        self.engine.load_file(tarball.path()).await
    }

    async fn build_context(&self, commit: &str, directory: &str) -> Result<Vec<u8>> {
        let fs = self.gitstore.commit_fs(commit)?.sub(directory)?;
        let mut context = Vec::new();
        tarscrub::write_tar(&fs, &mut context)?;
        Ok(context)
    }

    /// Build (or re-tag) every selected entry of `repo`, in order.
    pub async fn build_repo(
        &self,
        repo: &Repo,
        uniq: bool,
        pull: PullPolicy,
        dry_run: bool,
    ) -> Result<()> {
        let arch = &self.config.arch;
        let entries = self.sorted_entries(repo, true).await?;

        for entry in entries {
            if self.skip(repo, entry) {
                continue;
            }
            let identifier = repo.entry_identifier(entry);

            let froms = self.resolver.arch_froms(repo, entry, arch).await?;
            let from_scratch = froms.iter().any(|from| from == "scratch");

            if pull != PullPolicy::Never {
                for from in &froms {
                    if from == "scratch" {
                        continue;
                    }
                    let do_pull = match pull {
                        PullPolicy::Always => true,
                        PullPolicy::Missing => {
                            self.engine.inspect_image_id(from).await.is_err()
                        }
                        PullPolicy::Never => false,
                    };
                    if do_pull {
                        println!("Pulling {} ({})", from, identifier);
                        if !dry_run {
                            self.engine.pull(from).await?;
                        }
                    }
                }
            }

            let cache_tag = self.resolver.cache_name(repo, entry).await?;
            let image_tags = repo.tags(&self.config.namespace, uniq, entry);
            let mut tags = vec![cache_tag.clone()];
            tags.extend(image_tags.iter().cloned());

            let cache_name = Reference::parse(&cache_tag)?.canonical();
            let cached_desc = self.store.image_get(&cache_name)?;
            let in_engine = cached_desc.is_none()
                && self.engine.inspect_image_id(&cache_tag).await.is_ok();

            if cached_desc.is_none() && !in_engine {
                println!("Building {} ({})", cache_tag, identifier);
                if dry_run {
                    continue;
                }
                let commit = self.resolver.fetch_commit(repo, entry, arch).await?;
                let directory = entry.arch_directory(arch);
                let file = entry.arch_file(arch);

                match entry.arch_builder(arch) {
                    "classic" | "buildkit" | "" => {
                        let platform = if from_scratch {
                            arch::oci_platform(arch)
                                .map(|p| p.to_string())
                                .unwrap_or_default()
                        } else {
                            String::new()
                        };
                        let context = self.build_context(&commit, directory).await?;

                        if entry.arch_builder(arch) == "buildkit" {
                            let stdout = self
                                .engine
                                .buildx_build(&tags, file, &context, &platform)
                                .await?;
                            if self.engine.buildx_emits_oci() {
                                store::import_oci_layout_tar(
                                    self.store,
                                    &mut stdout.as_slice(),
                                )?;
                                let desc = self
                                    .store
                                    .image_get(&cache_name)?
                                    .ok_or_else(|| BrewError::Registry {
                                        reference: cache_tag.clone(),
                                        reason: "buildx output did not register the cache tag"
                                            .to_string(),
                                    })?;
                                println!("Importing {} into the engine", desc.digest);
                                self.docker_load(&desc, &tags).await?;
                            }
                        } else {
                            self.engine.build(&tags, file, &context, &platform).await?;
                        }
                    }
                    "oci-import" => {
                        let fs = self.gitstore.commit_fs(&commit)?;
                        let names = self.canonical_tags(&tags)?;
                        let desc = ociimport::import(
                            self.store, &fs, &names, &commit, directory, file,
                        )?;
                        println!("Importing {} ({}) into the engine", identifier, desc.digest);
                        self.docker_load(&desc, &image_tags).await?;
                    }
                    other => {
                        return Err(BrewError::UnknownBuilder {
                            builder: other.to_string(),
                            tags: entry.tags_string(),
                        })
                    }
                }
            } else if let Some(desc) = cached_desc {
                println!("Using {} ({})", cache_tag, identifier);
                if !dry_run {
                    println!("Importing {} into the engine", desc.digest);
                    self.docker_load(&desc, &tags).await?;
                }
            } else {
                println!("Using {} ({})", cache_tag, identifier);
                if !dry_run {
                    // a degenerate "FROM <cacheTag>" build: the engine's
                    // cheapest way to apply many tags at once
                    let dockerfile = format!("FROM {}\n", cache_tag);
                    self.engine
                        .build(&image_tags, "", dockerfile.as_bytes(), "")
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Push every selected entry's tags that are not already up to date.
    pub async fn push_repo(
        &self,
        repo: &Repo,
        uniq: bool,
        target_namespace: &str,
        dry_run: bool,
        force: bool,
    ) -> Result<()> {
        let arch = &self.config.arch;
        let tag_repo = namespaced_repo(target_namespace, &repo.repo_name);

        for entry in repo.entries() {
            if self.skip(repo, entry) {
                continue;
            }
            let identifier = repo.entry_identifier(entry);

            // shared tags are never pushed directly (see put-shared)
            let mut tags = Vec::new();
            for (i, tag) in entry.tags.iter().enumerate() {
                if uniq && i > 0 {
                    break;
                }
                tags.push(format!("{}:{}", tag_repo, tag));
            }

            // without a computable cache hash we cannot have built this
            let cache_tag = self.resolver.cache_name(repo, entry).await?;
            let cache_name = Reference::parse(&cache_tag)?.canonical();

            if let Some(desc) = self.store.image_get(&cache_name)? {
                debug!(digest = %desc.digest, cache_tag = %cache_tag, "found in content store");
                let mut skip = Vec::new();
                let mut update = Vec::new();
                for tag in &tags {
                    if force {
                        update.push(tag.clone());
                        continue;
                    }
                    match self.registry.resolve(tag).await {
                        Ok(remote)
                            if remote.desc.media_type == desc.media_type
                                && remote.desc.digest == desc.digest
                                && remote.desc.size == desc.size =>
                        {
                            skip.push(tag.clone())
                        }
                        _ => update.push(tag.clone()),
                    }
                }
                if update.is_empty() {
                    eprintln!("skipping {} (remote tags all up-to-date)", identifier);
                    continue;
                }
                if !skip.is_empty() {
                    eprintln!(
                        "partially skipping {} (remote tags up-to-date: {})",
                        identifier,
                        skip.join(", ")
                    );
                }
                println!("Pushing {} to {}", desc.digest, update.join(", "));
                if !dry_run {
                    for tag in &update {
                        let reference = Reference::parse(tag)?;
                        self.registry
                            .push_descriptor(self.store, &reference, &desc)
                            .await?;
                    }
                }
                continue;
            }

            if entry.arch_builder(arch) == "oci-import" {
                return Err(BrewError::Registry {
                    reference: identifier,
                    reason: "oci-import artifact missing from the content store".to_string(),
                });
            }

            'tags: for tag in &tags {
                if !force {
                    let local_id = self.engine.inspect_image_id(tag).await?;
                    if local_id.is_empty() {
                        return Err(BrewError::Registry {
                            reference: tag.clone(),
                            reason: "local image does not seem to exist".to_string(),
                        });
                    }
                    let registry_ids = self.registry.image_ids(tag).await;
                    debug!(tag = %tag, local = %local_id, remote = ?registry_ids, "push check");
                    for registry_id in registry_ids {
                        if registry_id == local_id {
                            eprintln!("skipping {} (remote image matches local)", tag);
                            continue 'tags;
                        }
                    }
                }
                println!("Pushing {}", tag);
                if !dry_run {
                    self.engine.push(tag).await?;
                }
            }
        }

        Ok(())
    }

    /// Publish multi-arch manifest lists for the repo's shared-tag groups
    /// (plus one list per entry, or per entry on the active arch only
    /// with `single_arch`).
    pub async fn put_shared(
        &self,
        repo: &Repo,
        single_arch: bool,
        target_namespace: &str,
        dry_run: bool,
        force: bool,
    ) -> Result<()> {
        let target_repo = namespaced_repo(target_namespace, &repo.repo_name);

        // (shared tags, member entries)
        let mut groups: Vec<(Vec<String>, Vec<&ManifestEntry>)> = Vec::new();
        if !single_arch {
            // every multi-architecture tag group gets a manifest list of
            // its own, SharedTags or not
            for entry in repo.entries() {
                groups.push((entry.tags.clone(), vec![entry]));
            }
        }
        if repo.tag_name.is_none() {
            for group in repo.manifest.shared_tag_groups() {
                let entries = group
                    .entries
                    .iter()
                    .map(|&i| &repo.manifest.entries[i])
                    .collect();
                groups.push((group.shared_tags, entries));
            }
        } else {
            warn!("a single tag was requested -- skipping SharedTags");
        }

        if groups.is_empty() {
            return Ok(());
        }

        let mut failed = Vec::new();
        for (shared_tags, entries) in groups {

            let (yaml, expected_digests) =
                match self.manifest_tool_yaml(repo, &entries, single_arch).await? {
                    Some(parts) => parts,
                    None => {
                        eprintln!(
                            "skipping {}:{} (nothing to push)",
                            target_repo, shared_tags[0]
                        );
                        continue;
                    }
                };

            if expected_digests.is_empty() {
                warn!(
                    "no images expected to push for {}:{}",
                    target_repo, shared_tags[0]
                );
            }

            let mut tags_to_push = Vec::new();
            for tag in &shared_tags {
                let image = format!("{}:{}", target_repo, tag);
                if !force {
                    let remote_digests = self
                        .registry
                        .manifest_list_digests(&image)
                        .await
                        .unwrap_or_default();
                    if remote_digests == expected_digests {
                        eprintln!(
                            "skipping {} ({} remote digests up-to-date)",
                            image,
                            remote_digests.len()
                        );
                        continue;
                    }
                }
                tags_to_push.push(tag.clone());
            }
            if tags_to_push.is_empty() {
                continue;
            }

            let group_identifier = format!("{}:{}", target_repo, tags_to_push[0]);
            println!("Putting {}", group_identifier);
            if !dry_run {
                let mut spec = format!("image: {}:{}\n", target_repo, tags_to_push[0]);
                if tags_to_push.len() > 1 {
                    spec.push_str("tags:\n");
                    for tag in &tags_to_push[1..] {
                        spec.push_str(&format!("  - {}\n", tag));
                    }
                }
                spec.push_str(&yaml);
                if let Err(err) = self.engine.manifest_tool_push(&spec).await {
                    warn!("failed putting {}, skipping (collecting errors)", group_identifier);
                    failed.push(format!("- {}: {}", group_identifier, err));
                    continue;
                }
                info!(group = %group_identifier, "manifest list published");
            }
        }

        if !failed.is_empty() {
            return Err(BrewError::Other(anyhow::anyhow!(
                "failed putting groups:\n{}",
                failed.join("\n")
            )));
        }
        Ok(())
    }

    /// The `manifests:` YAML stanza and the expected member digests for a
    /// shared-tag group; None when there is nothing to push.
    async fn manifest_tool_yaml(
        &self,
        repo: &Repo,
        entries: &[&ManifestEntry],
        single_arch: bool,
    ) -> Result<Option<(String, Vec<String>)>> {
        let mut yaml = String::new();
        let mut remote_digests = Vec::new();

        for entry in entries {
            for entry_arch in entry.architectures() {
                if single_arch && entry_arch != &self.config.arch {
                    continue;
                }
                let Some(platform) = arch::oci_platform(entry_arch) else {
                    // the parser validates Architectures; an unknown label
                    // here means the manifest bypassed it
                    return Err(BrewError::UnsupportedArchitecture {
                        arch: entry_arch.clone(),
                        tags: entry.tags_string(),
                    });
                };
                let Some(arch_namespace) = self.config.arch_namespace(entry_arch) else {
                    warn!(
                        "no arch-namespace specified for {:?}; skipping ({})",
                        entry_arch,
                        repo.entry_identifier(entry)
                    );
                    continue;
                };

                let arch_image = format!(
                    "{}/{}:{}",
                    arch_namespace,
                    repo.repo_name,
                    entry.tags.first().map(String::as_str).unwrap_or("")
                );
                let digests = self
                    .registry
                    .manifest_list_digests(&arch_image)
                    .await
                    .unwrap_or_default();
                if digests.len() != 1 {
                    warn!("expected 1 image for {:?}; got {}", arch_image, digests.len());
                }
                remote_digests.extend(digests);

                yaml.push_str(&format!("  - image: {}\n", arch_image));
                yaml.push_str("    platform:\n");
                yaml.push_str(&format!("      os: {}\n", platform.os));
                yaml.push_str(&format!("      architecture: {}\n", platform.architecture));
                if !platform.variant.is_empty() {
                    yaml.push_str(&format!("      variant: {}\n", platform.variant));
                }
            }
        }

        if yaml.is_empty() {
            return Ok(None);
        }
        Ok(Some((format!("manifests:\n{}", yaml), remote_digests)))
    }

}
