//! Catalog manifest model: one file per repository, one entry per tag group.
//!
//! A manifest carries a global default entry plus per-tag entries. Unset
//! entry fields inherit from the global entry; individual fields can also
//! be overridden per architecture (`arm64v8-GitCommit: ...`). Two dialects
//! are parsed: the header-based format (preferred) and the legacy
//! line-based format.

mod library;
mod line_based;
mod parse;

pub use library::{namespaced_repo, Library, Repo};
pub use line_based::parse_line_based;
pub use parse::parse_rfc2822;

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::arch;
use crate::error::{BrewError, Result};

/// Default architecture set for entries that do not declare any.
pub const DEFAULT_ARCHITECTURE: &str = "amd64";

/// `GitFetch` value marking entries that came from the line-based dialect.
pub const DEFAULT_LINE_BASED_FETCH: &str = "refs/heads/*";

/// Accepted `Builder` values.
pub const BUILDERS: &[&str] = &["", "classic", "buildkit", "oci-import"];

/// Hex-ish commit ids (anything git could resolve as an abbreviated sha).
pub static GIT_COMMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{1,64}$").unwrap());

/// Full-length SHA-1 / SHA-256 commit ids.
pub static FULL_GIT_COMMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{40}$|^[0-9a-f]{64}$").unwrap());

/// `Display Name[ <email>] (@handle)`
static MAINTAINER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s<>()][^<>()]*(?:\s+<[^\s<>()]+>)?\s+\(@[^\s<>()]+\)$").unwrap()
});

const MAINTAINER_FORMAT: &str = "Display Name <contact@example.com> (@github-handle)";

/// A conservative refname shape for `GitFetch` values.
static GIT_FETCH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^refs/[A-Za-z0-9._/*-]+$").unwrap());

/// One tag group of a manifest. Unset fields (None / empty) inherit from
/// the global entry; see [`ManifestEntry::defaults_from`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestEntry {
    pub maintainers: Vec<String>,
    pub tags: Vec<String>,
    pub shared_tags: Vec<String>,
    pub architectures: Option<Vec<String>>,
    pub git_repo: Option<String>,
    pub git_fetch: Option<String>,
    pub git_commit: Option<String>,
    pub directory: Option<String>,
    pub file: Option<String>,
    pub builder: Option<String>,
    pub constraints: Vec<String>,

    // Per-architecture overrides of the seven build locator fields.
    pub arch_git_repo: BTreeMap<String, String>,
    pub arch_git_fetch: BTreeMap<String, String>,
    pub arch_git_commit: BTreeMap<String, String>,
    pub arch_directory: BTreeMap<String, String>,
    pub arch_file: BTreeMap<String, String>,
    pub arch_builder: BTreeMap<String, String>,
    pub arch_constraints: BTreeMap<String, Vec<String>>,
}

/// The built-in defaults the global entry itself inherits from.
pub fn default_entry() -> ManifestEntry {
    ManifestEntry {
        architectures: Some(vec![DEFAULT_ARCHITECTURE.to_string()]),
        git_fetch: Some("refs/heads/master".to_string()),
        directory: Some(".".to_string()),
        file: Some("Dockerfile".to_string()),
        ..ManifestEntry::default()
    }
}

impl ManifestEntry {
    /// Fill unset fields from `defaults` (the global entry, or the built-in
    /// defaults for the global entry itself). `SharedTags` are unioned with
    /// the defaults' shared tags first; architecture override maps are
    /// merged with this entry's values winning.
    pub fn defaults_from(mut self, defaults: &ManifestEntry) -> ManifestEntry {
        if self.maintainers.is_empty() {
            self.maintainers = defaults.maintainers.clone();
        }
        if !defaults.shared_tags.is_empty() {
            let mut merged = defaults.shared_tags.clone();
            for tag in self.shared_tags {
                if !merged.contains(&tag) {
                    merged.push(tag);
                }
            }
            self.shared_tags = merged;
        }
        if self.architectures.is_none() {
            self.architectures = defaults.architectures.clone();
        }
        if self.git_repo.is_none() {
            self.git_repo = defaults.git_repo.clone();
        }
        if self.git_fetch.is_none() {
            self.git_fetch = defaults.git_fetch.clone();
        }
        if self.git_commit.is_none() {
            self.git_commit = defaults.git_commit.clone();
        }
        if self.directory.is_none() {
            self.directory = defaults.directory.clone();
        }
        if self.file.is_none() {
            self.file = defaults.file.clone();
        }
        if self.builder.is_none() {
            self.builder = defaults.builder.clone();
        }
        if self.constraints.is_empty() {
            self.constraints = defaults.constraints.clone();
        }
        for (map, defaults_map) in [
            (&mut self.arch_git_repo, &defaults.arch_git_repo),
            (&mut self.arch_git_fetch, &defaults.arch_git_fetch),
            (&mut self.arch_git_commit, &defaults.arch_git_commit),
            (&mut self.arch_directory, &defaults.arch_directory),
            (&mut self.arch_file, &defaults.arch_file),
            (&mut self.arch_builder, &defaults.arch_builder),
        ] {
            for (k, v) in defaults_map {
                map.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        for (k, v) in &defaults.arch_constraints {
            self.arch_constraints
                .entry(k.clone())
                .or_insert_with(|| v.clone());
        }
        self
    }

    /// Unset fields equal to `defaults` (used when rendering, so inherited
    /// values are elided from the output).
    pub fn clear_defaults(&self, defaults: &ManifestEntry) -> ManifestEntry {
        let mut cleared = self.clone();
        if cleared.maintainers == defaults.maintainers {
            cleared.maintainers = Vec::new();
        }
        if cleared.shared_tags == defaults.shared_tags {
            cleared.shared_tags = Vec::new();
        }
        if cleared.architectures == defaults.architectures {
            cleared.architectures = None;
        }
        if cleared.git_repo == defaults.git_repo {
            cleared.git_repo = None;
        }
        if cleared.git_fetch == defaults.git_fetch {
            cleared.git_fetch = None;
        }
        if cleared.git_commit == defaults.git_commit {
            cleared.git_commit = None;
        }
        if cleared.directory == defaults.directory {
            cleared.directory = None;
        }
        if cleared.file == defaults.file {
            cleared.file = None;
        }
        if cleared.builder == defaults.builder {
            cleared.builder = None;
        }
        if cleared.constraints == defaults.constraints {
            cleared.constraints = Vec::new();
        }
        if cleared.arch_git_repo == defaults.arch_git_repo {
            cleared.arch_git_repo = BTreeMap::new();
        }
        if cleared.arch_git_fetch == defaults.arch_git_fetch {
            cleared.arch_git_fetch = BTreeMap::new();
        }
        if cleared.arch_git_commit == defaults.arch_git_commit {
            cleared.arch_git_commit = BTreeMap::new();
        }
        if cleared.arch_directory == defaults.arch_directory {
            cleared.arch_directory = BTreeMap::new();
        }
        if cleared.arch_file == defaults.arch_file {
            cleared.arch_file = BTreeMap::new();
        }
        if cleared.arch_builder == defaults.arch_builder {
            cleared.arch_builder = BTreeMap::new();
        }
        if cleared.arch_constraints == defaults.arch_constraints {
            cleared.arch_constraints = BTreeMap::new();
        }
        cleared
    }

    pub fn tags_string(&self) -> String {
        self.tags.join(", ")
    }

    pub fn architectures(&self) -> &[String] {
        self.architectures.as_deref().unwrap_or(&[])
    }

    pub fn has_architecture(&self, arch: &str) -> bool {
        self.architectures().iter().any(|a| a == arch)
    }

    pub fn arch_git_repo(&self, arch: &str) -> &str {
        self.arch_git_repo
            .get(arch)
            .map(String::as_str)
            .unwrap_or_else(|| self.git_repo.as_deref().unwrap_or(""))
    }

    pub fn arch_git_fetch(&self, arch: &str) -> &str {
        self.arch_git_fetch
            .get(arch)
            .map(String::as_str)
            .unwrap_or_else(|| self.git_fetch.as_deref().unwrap_or("refs/heads/master"))
    }

    pub fn arch_git_commit(&self, arch: &str) -> &str {
        self.arch_git_commit
            .get(arch)
            .map(String::as_str)
            .unwrap_or_else(|| self.git_commit.as_deref().unwrap_or(""))
    }

    pub fn arch_directory(&self, arch: &str) -> &str {
        self.arch_directory
            .get(arch)
            .map(String::as_str)
            .unwrap_or_else(|| self.directory.as_deref().unwrap_or("."))
    }

    pub fn arch_file(&self, arch: &str) -> &str {
        self.arch_file
            .get(arch)
            .map(String::as_str)
            .unwrap_or_else(|| self.file.as_deref().unwrap_or("Dockerfile"))
    }

    pub fn arch_builder(&self, arch: &str) -> &str {
        self.arch_builder
            .get(arch)
            .map(String::as_str)
            .unwrap_or_else(|| self.builder.as_deref().unwrap_or(""))
    }

    pub fn arch_constraints(&self, arch: &str) -> &[String] {
        self.arch_constraints
            .get(arch)
            .map(Vec::as_slice)
            .unwrap_or(&self.constraints)
    }

    /// The newline-joined git cache key for this entry on `arch`.
    pub fn git_cache_key(&self, arch: &str) -> String {
        [
            self.arch_git_repo(arch),
            self.arch_git_fetch(arch),
            self.arch_git_commit(arch),
        ]
        .join("\n")
    }

    /// True when the two entries describe the same build artifacts (tags
    /// and shared tags excluded); such entries are merged on add.
    pub fn same_build_artifacts(&self, other: &ManifestEntry) -> bool {
        self.architectures == other.architectures
            && self.git_repo == other.git_repo
            && self.git_fetch == other.git_fetch
            && self.git_commit == other.git_commit
            && self.directory == other.directory
            && self.file == other.file
            && self.builder == other.builder
            && self.constraints == other.constraints
            && self.arch_git_repo == other.arch_git_repo
            && self.arch_git_fetch == other.arch_git_fetch
            && self.arch_git_commit == other.arch_git_commit
            && self.arch_directory == other.arch_directory
            && self.arch_file == other.arch_file
            && self.arch_builder == other.arch_builder
            && self.arch_constraints == other.arch_constraints
    }

    fn invalid_maintainers(&self) -> Vec<&str> {
        self.maintainers
            .iter()
            .filter(|m| !MAINTAINER_RE.is_match(m))
            .map(String::as_str)
            .collect()
    }

    /// Validate maintainer contacts against the contact grammar.
    pub fn check_maintainers(&self) -> Result<()> {
        let invalid = self.invalid_maintainers();
        if invalid.is_empty() {
            Ok(())
        } else {
            Err(BrewError::InvalidMaintainers {
                value: invalid.join(", "),
                expected: MAINTAINER_FORMAT.to_string(),
            })
        }
    }

    fn dedupe_shared_tags(&mut self) {
        let mut seen = Vec::with_capacity(self.shared_tags.len());
        for tag in std::mem::take(&mut self.shared_tags) {
            if !seen.contains(&tag) {
                seen.push(tag);
            }
        }
        self.shared_tags = seen;
    }

    fn write_paragraph(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut line = |f: &mut fmt::Formatter<'_>, key: &str, value: &str| -> fmt::Result {
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "{}: {}", key, value)
        };

        if !self.maintainers.is_empty() {
            line(f, "Maintainers", &self.maintainers.join(", "))?;
        }
        if !self.tags.is_empty() {
            line(f, "Tags", &self.tags.join(", "))?;
        }
        if !self.shared_tags.is_empty() {
            line(f, "SharedTags", &self.shared_tags.join(", "))?;
        }
        if let Some(arches) = &self.architectures {
            line(f, "Architectures", &arches.join(", "))?;
        }
        if let Some(v) = &self.git_repo {
            line(f, "GitRepo", v)?;
        }
        for (arch, v) in &self.arch_git_repo {
            line(f, &format!("{}-GitRepo", arch), v)?;
        }
        if let Some(v) = &self.git_fetch {
            line(f, "GitFetch", v)?;
        }
        for (arch, v) in &self.arch_git_fetch {
            line(f, &format!("{}-GitFetch", arch), v)?;
        }
        if let Some(v) = &self.git_commit {
            line(f, "GitCommit", v)?;
        }
        for (arch, v) in &self.arch_git_commit {
            line(f, &format!("{}-GitCommit", arch), v)?;
        }
        if let Some(v) = &self.directory {
            line(f, "Directory", v)?;
        }
        for (arch, v) in &self.arch_directory {
            line(f, &format!("{}-Directory", arch), v)?;
        }
        if let Some(v) = &self.file {
            line(f, "File", v)?;
        }
        for (arch, v) in &self.arch_file {
            line(f, &format!("{}-File", arch), v)?;
        }
        if let Some(v) = &self.builder {
            line(f, "Builder", v)?;
        }
        for (arch, v) in &self.arch_builder {
            line(f, &format!("{}-Builder", arch), v)?;
        }
        if !self.constraints.is_empty() {
            line(f, "Constraints", &self.constraints.join(", "))?;
        }
        for (arch, v) in &self.arch_constraints {
            line(f, &format!("{}-Constraints", arch), &v.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_paragraph(f)
    }
}

/// A group of entries that share one or more shared tags (derived, not
/// stored): the unit of multi-arch manifest-list publication.
#[derive(Debug, Clone)]
pub struct SharedTagGroup {
    pub shared_tags: Vec<String>,
    /// Indexes into `Manifest::entries`, in manifest order.
    pub entries: Vec<usize>,
}

/// A parsed manifest file: one global default entry and the tag entries in
/// file order.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub global: ManifestEntry,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Validate and append `entry`, merging it into an existing entry with
    /// the same build artifacts. `entry` must already have inheritance
    /// applied (see [`ManifestEntry::defaults_from`]).
    pub fn add_entry(&mut self, mut entry: ManifestEntry) -> Result<()> {
        if entry.tags.is_empty() {
            return Err(BrewError::ManifestParse {
                line: 0,
                text: String::new(),
                reason: "missing Tags".to_string(),
            });
        }
        entry.dedupe_shared_tags();

        // Legacy line-based entries carry a tag name instead of a commit;
        // rewrite them to fetch the tag ref at FETCH_HEAD.
        if entry.git_fetch.as_deref() == Some(DEFAULT_LINE_BASED_FETCH) {
            if let Some(commit) = &entry.git_commit {
                if !GIT_COMMIT_RE.is_match(commit) {
                    entry.git_fetch = Some(format!("refs/tags/{}", commit));
                    entry.git_commit = Some("FETCH_HEAD".to_string());
                }
            }
        }

        let tags = entry.tags_string();
        if entry.git_repo.as_deref().unwrap_or("").is_empty()
            || entry.git_fetch.as_deref().unwrap_or("").is_empty()
            || entry.git_commit.as_deref().unwrap_or("").is_empty()
        {
            return Err(BrewError::ManifestParse {
                line: 0,
                text: tags.clone(),
                reason: "missing one of GitRepo, GitFetch, or GitCommit".to_string(),
            });
        }

        for fetch in std::iter::once(entry.git_fetch.as_deref().unwrap_or(""))
            .chain(entry.arch_git_fetch.values().map(String::as_str))
        {
            if !GIT_FETCH_RE.is_match(fetch) {
                return Err(BrewError::ManifestParse {
                    line: 0,
                    text: fetch.to_string(),
                    reason: format!("invalid GitFetch ref (tags {:?})", tags),
                });
            }
        }

        for commit in std::iter::once(entry.git_commit.as_deref().unwrap_or(""))
            .chain(entry.arch_git_commit.values().map(String::as_str))
        {
            if commit != "FETCH_HEAD" && !GIT_COMMIT_RE.is_match(commit) {
                return Err(BrewError::ManifestParse {
                    line: 0,
                    text: commit.to_string(),
                    reason: format!("invalid GitCommit (tags {:?})", tags),
                });
            }
        }

        for builder in std::iter::once(entry.builder.as_deref().unwrap_or(""))
            .chain(entry.arch_builder.values().map(String::as_str))
        {
            if !BUILDERS.contains(&builder) {
                return Err(BrewError::UnknownBuilder {
                    builder: builder.to_string(),
                    tags: tags.clone(),
                });
            }
        }

        for label in entry.architectures() {
            if !arch::is_supported(label) {
                return Err(BrewError::UnsupportedArchitecture {
                    arch: label.clone(),
                    tags: entry.tags_string(),
                });
            }
        }

        for tag in &entry.tags {
            if entry.tags.iter().filter(|t| *t == tag).count() > 1
                || self.entries.iter().any(|e| e.tags.contains(tag))
            {
                return Err(BrewError::DuplicateTag {
                    tag: tag.clone(),
                    tags: entry.tags_string(),
                });
            }
        }

        for existing in &mut self.entries {
            if existing.same_build_artifacts(&entry) {
                existing.tags.extend(entry.tags);
                for shared in entry.shared_tags {
                    if !existing.shared_tags.contains(&shared) {
                        existing.shared_tags.push(shared);
                    }
                }
                return Ok(());
            }
        }

        self.entries.push(entry);
        Ok(())
    }

    /// The entry whose `Tags` contain `tag`, if any.
    pub fn get_tag(&self, tag: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.tags.iter().any(|t| t == tag))
    }

    /// The entries whose `SharedTags` contain `tag` (manifest order).
    pub fn get_shared_tag(&self, tag: &str) -> Vec<&ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.shared_tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Shared tags grouped by identical entry membership, in order of
    /// first appearance.
    pub fn shared_tag_groups(&self) -> Vec<SharedTagGroup> {
        let mut order: Vec<String> = Vec::new();
        let mut members: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, entry) in self.entries.iter().enumerate() {
            for shared in &entry.shared_tags {
                if !members.contains_key(shared) {
                    order.push(shared.clone());
                }
                members.entry(shared.clone()).or_default().push(i);
            }
        }

        let mut groups: Vec<SharedTagGroup> = Vec::new();
        for shared in order {
            let entries = &members[&shared];
            if let Some(group) = groups.iter_mut().find(|g| &g.entries == entries) {
                group.shared_tags.push(shared);
            } else {
                groups.push(SharedTagGroup {
                    shared_tags: vec![shared],
                    entries: entries.clone(),
                });
            }
        }
        groups
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.global.clear_defaults(&default_entry()).write_paragraph(f)?;
        for entry in &self.entries {
            write!(f, "\n\n")?;
            entry.clear_defaults(&self.global).write_paragraph(f)?;
        }
        Ok(())
    }
}

/// Parse a manifest, trying the header-based dialect first and falling
/// back to the line-based dialect; when both fail, the header-based
/// dialect's error is surfaced.
pub fn parse(input: &str) -> Result<Manifest> {
    match parse_rfc2822(input) {
        Ok(manifest) => Ok(manifest),
        Err(err2822) => match parse_line_based(input) {
            Ok(manifest) => Ok(manifest),
            Err(_) => Err(err2822),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOLANG_MANIFEST: &str = r#"# RFC 2822

	# I LOVE CAKE

Maintainers: InfoSiftr <github@infosiftr.com> (@infosiftr),
             Johan Euphrosine <proppy@google.com> (@proppy)
GitRepo: https://github.com/docker-library/golang.git
GitFetch: refs/heads/master
SharedTags: latest


 # hi


 	 # blasphemer


# Go 1.6
Tags: 1.6.1, 1.6, 1
GitCommit: 0ce80411b9f41e9c3a21fc0a1bffba6ae761825a
Directory: 1.6
Constraints: some-random-build-server


# Go 1.5
Tags: 1.5.3
SharedTags: 1.5.3-debian, 1.5-debian
GitCommit: d7e2a8d90a9b8f5dfd5bcd428e0c33b68c40cc19
Directory: 1.5


Tags: 1.5
SharedTags: 1.5-debian
GitCommit: d7e2a8d90a9b8f5dfd5bcd428e0c33b68c40cc19
Directory: 1.5
"#;

    const GOLANG_RENDERED: &str = "\
Maintainers: InfoSiftr <github@infosiftr.com> (@infosiftr), Johan Euphrosine <proppy@google.com> (@proppy)
SharedTags: latest
GitRepo: https://github.com/docker-library/golang.git

Tags: 1.6.1, 1.6, 1
GitCommit: 0ce80411b9f41e9c3a21fc0a1bffba6ae761825a
Directory: 1.6
Constraints: some-random-build-server

Tags: 1.5.3, 1.5
SharedTags: latest, 1.5.3-debian, 1.5-debian
GitCommit: d7e2a8d90a9b8f5dfd5bcd428e0c33b68c40cc19
Directory: 1.5";

    #[test]
    fn parses_and_renders_header_dialect() {
        let manifest = parse(GOLANG_MANIFEST).unwrap();
        assert_eq!(manifest.to_string(), GOLANG_RENDERED);
    }

    #[test]
    fn render_round_trips() {
        let manifest = parse(GOLANG_MANIFEST).unwrap();
        let rendered = manifest.to_string();
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(reparsed.to_string(), rendered);
    }

    #[test]
    fn merges_entries_with_same_build_artifacts() {
        let manifest = parse(GOLANG_MANIFEST).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.entries[1].tags, vec!["1.5.3", "1.5"]);
        assert_eq!(
            manifest.entries[1].shared_tags,
            vec!["latest", "1.5.3-debian", "1.5-debian"]
        );
    }

    #[test]
    fn shared_tag_groups_follow_entry_membership() {
        let manifest = parse(GOLANG_MANIFEST).unwrap();
        let groups = manifest.shared_tag_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].shared_tags, vec!["latest"]);
        assert_eq!(groups[0].entries, vec![0, 1]);
        assert_eq!(groups[1].shared_tags, vec!["1.5.3-debian", "1.5-debian"]);
        assert_eq!(groups[1].entries, vec![1]);
    }

    #[test]
    fn get_tag_and_shared_tag() {
        let manifest = parse(GOLANG_MANIFEST).unwrap();
        assert!(manifest.get_tag("1.6").is_some());
        assert!(manifest.get_tag("nope").is_none());
        assert_eq!(manifest.get_shared_tag("latest").len(), 2);
        assert_eq!(manifest.get_shared_tag("1.5-debian").len(), 1);
    }

    #[test]
    fn completely_bogus_input_surfaces_header_error() {
        let err = parse("this is just completely bogus and invalid no matter how you slice it")
            .unwrap_err();
        assert!(
            matches!(err, BrewError::ManifestParse { .. }),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn invalid_maintainers_fail_the_parse() {
        let err = parse(
            "Maintainers: Valid Name (@valid-handle), Valid Name <valid-email> (@valid-handle), Invalid Maintainer (invalid-handle)",
        )
        .unwrap_err();
        assert!(
            matches!(err, BrewError::InvalidMaintainers { .. }),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        let input = "GitRepo: https://example.com/x.git\n\nTags: a\nGitCommit: 0ce80411b9f41e9c3a21fc0a1bffba6ae761825a\n\nTags: a\nGitCommit: d7e2a8d90a9b8f5dfd5bcd428e0c33b68c40cc19\n";
        let err = parse(input).unwrap_err();
        assert!(matches!(err, BrewError::DuplicateTag { .. }), "{err}");
    }

    #[test]
    fn unknown_builder_is_rejected() {
        let input = "GitRepo: https://example.com/x.git\n\nTags: a\nGitCommit: 0ce80411b9f41e9c3a21fc0a1bffba6ae761825a\nBuilder: mystery\n";
        let err = parse(input).unwrap_err();
        assert!(matches!(err, BrewError::UnknownBuilder { .. }), "{err}");
    }

    #[test]
    fn unsupported_architecture_is_rejected() {
        let input = "GitRepo: https://example.com/x.git\n\nTags: a\nGitCommit: 0ce80411b9f41e9c3a21fc0a1bffba6ae761825a\nArchitectures: vax\n";
        let err = parse(input).unwrap_err();
        assert!(matches!(err, BrewError::UnsupportedArchitecture { .. }), "{err}");
    }

    #[test]
    fn arch_overrides_resolve_and_render() {
        let input = "GitRepo: https://example.com/x.git\n\nTags: a\nGitCommit: 0ce80411b9f41e9c3a21fc0a1bffba6ae761825a\nArchitectures: amd64, arm64v8\narm64v8-GitCommit: d7e2a8d90a9b8f5dfd5bcd428e0c33b68c40cc19\narm64v8-Directory: arm64\n";
        let manifest = parse(input).unwrap();
        let entry = &manifest.entries[0];
        assert_eq!(
            entry.arch_git_commit("amd64"),
            "0ce80411b9f41e9c3a21fc0a1bffba6ae761825a"
        );
        assert_eq!(
            entry.arch_git_commit("arm64v8"),
            "d7e2a8d90a9b8f5dfd5bcd428e0c33b68c40cc19"
        );
        assert_eq!(entry.arch_directory("arm64v8"), "arm64");
        assert_eq!(entry.arch_directory("amd64"), ".");

        let rendered = manifest.to_string();
        assert!(rendered.contains("arm64v8-GitCommit: d7e2a8d90a9b8f5dfd5bcd428e0c33b68c40cc19"));
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(reparsed.to_string(), rendered);
    }

    #[test]
    fn git_cache_key_joins_locators() {
        let manifest = parse(GOLANG_MANIFEST).unwrap();
        let entry = &manifest.entries[0];
        assert_eq!(
            entry.git_cache_key("amd64"),
            "https://github.com/docker-library/golang.git\nrefs/heads/master\n0ce80411b9f41e9c3a21fc0a1bffba6ae761825a"
        );
    }
}
