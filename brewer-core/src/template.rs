//! Template rendering for `cat --format`.
//!
//! Formats are tera templates. The context exposes the repository under
//! `repo` (name, tag selection, rendered manifest and entries) plus the
//! helper functions `i`, `arch`, `namespace`, `archNamespace`, `gitCache`,
//! `ociPlatform`, `defaults` and the `archFilter` filter.

use serde::Serialize;
use tera::Tera;

use crate::arch;
use crate::config::Config;
use crate::error::{BrewError, Result};
use crate::manifest::{default_entry, ManifestEntry, Repo};

/// The default format: each selected entry's paragraph (or the whole
/// manifest), repos separated by blank lines.
pub const DEFAULT_FORMAT: &str = "{% if i %}\n\n{% endif %}\
{% if repo.tag_entries %}\
{% for e in repo.tag_entries %}{% if loop.index0 %}\n\n{% endif %}{{ e.rendered }}{% endfor %}\
{% else %}{{ repo.manifest }}{% endif %}";

#[derive(Serialize)]
struct EntryContext {
    tags: Vec<String>,
    shared_tags: Vec<String>,
    architectures: Vec<String>,
    git_repo: String,
    git_fetch: String,
    git_commit: String,
    directory: String,
    file: String,
    builder: String,
    constraints: Vec<String>,
    rendered: String,
}

fn entry_context(entry: &ManifestEntry, defaults: &ManifestEntry) -> EntryContext {
    EntryContext {
        tags: entry.tags.clone(),
        shared_tags: entry.shared_tags.clone(),
        architectures: entry.architectures().to_vec(),
        git_repo: entry.git_repo.clone().unwrap_or_default(),
        git_fetch: entry.git_fetch.clone().unwrap_or_default(),
        git_commit: entry.git_commit.clone().unwrap_or_default(),
        directory: entry.directory.clone().unwrap_or_default(),
        file: entry.file.clone().unwrap_or_default(),
        builder: entry.builder.clone().unwrap_or_default(),
        constraints: entry.constraints.clone(),
        rendered: entry.clear_defaults(defaults).to_string(),
    }
}

#[derive(Serialize)]
struct RepoContext {
    name: String,
    tag_name: Option<String>,
    manifest: String,
    entries: Vec<EntryContext>,
    tag_entries: Option<Vec<EntryContext>>,
}

fn repo_context(repo: &Repo) -> RepoContext {
    RepoContext {
        name: repo.repo_name.clone(),
        tag_name: repo.tag_name.clone(),
        manifest: repo.manifest.to_string(),
        entries: repo
            .manifest
            .entries
            .iter()
            .map(|e| entry_context(e, &repo.manifest.global))
            .collect(),
        tag_entries: repo.tag_entries.as_ref().map(|indexes| {
            indexes
                .iter()
                .map(|&i| entry_context(&repo.manifest.entries[i], &repo.manifest.global))
                .collect()
        }),
    }
}

/// A compiled format plus the per-run helper state.
pub struct Renderer {
    tera: Tera,
}

impl Renderer {
    pub fn new(format: &str, config: &Config) -> Result<Renderer> {
        let mut tera = Tera::default();
        tera.add_raw_template("format", format)
            .map_err(|e| BrewError::ManifestParse {
                line: 0,
                text: format.to_string(),
                reason: format!("failed parsing format template: {}", e),
            })?;
        tera.autoescape_on(vec![]);

        let active_arch = config.arch.clone();
        tera.register_function(
            "arch",
            move |_: &std::collections::HashMap<String, tera::Value>| {
                Ok(tera::Value::String(active_arch.clone()))
            },
        );

        let namespace = config.namespace.clone();
        tera.register_function(
            "namespace",
            move |_: &std::collections::HashMap<String, tera::Value>| {
                Ok(tera::Value::String(namespace.clone()))
            },
        );

        let arch_namespaces = config.arch_namespaces.clone();
        tera.register_function(
            "archNamespace",
            move |args: &std::collections::HashMap<String, tera::Value>| {
                let arch = args
                    .get("arch")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default();
                Ok(tera::Value::String(
                    arch_namespaces.get(arch).cloned().unwrap_or_default(),
                ))
            },
        );

        let git_cache = config.cache.join("git");
        tera.register_function(
            "gitCache",
            move |_: &std::collections::HashMap<String, tera::Value>| {
                Ok(tera::Value::String(git_cache.display().to_string()))
            },
        );

        tera.register_function(
            "ociPlatform",
            |args: &std::collections::HashMap<String, tera::Value>| {
                let label = args
                    .get("arch")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default();
                match arch::oci_platform(label) {
                    Some(platform) => Ok(tera::to_value(platform)?),
                    None => Ok(tera::Value::Null),
                }
            },
        );

        tera.register_function(
            "defaults",
            |_: &std::collections::HashMap<String, tera::Value>| {
                let defaults = default_entry();
                let context = entry_context(&defaults, &defaults);
                Ok(tera::to_value(context)?)
            },
        );

        tera.register_filter(
            "archFilter",
            |value: &tera::Value, args: &std::collections::HashMap<String, tera::Value>| {
                let arch = args
                    .get("arch")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string();
                let entries = value.as_array().cloned().unwrap_or_default();
                let filtered: Vec<tera::Value> = entries
                    .into_iter()
                    .filter(|entry| {
                        entry
                            .get("architectures")
                            .and_then(|value| value.as_array())
                            .map(|arches| arches.iter().any(|a| a.as_str() == Some(&arch)))
                            .unwrap_or(false)
                    })
                    .collect();
                Ok(tera::Value::Array(filtered))
            },
        );

        Ok(Renderer { tera })
    }

    /// Render one repo; `i` is its position in the argument list.
    pub fn render(&mut self, repo: &Repo, i: usize) -> Result<String> {
        let mut context = tera::Context::new();
        context.insert("i", &i);
        context.insert("repo", &repo_context(repo));
        self.tera
            .render("format", &context)
            .map_err(|e| BrewError::ManifestParse {
                line: 0,
                text: String::new(),
                reason: format!("failed executing format template: {}", e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::manifest::parse;

    const MANIFEST: &str = "\
Maintainers: Some Body <somebody@example.com> (@somebody)
GitRepo: https://example.com/docker-bash.git

Tags: 4.4, latest
Architectures: amd64, arm64v8
GitCommit: 1cbb5cf49b4c53bd5a986abf7a1afeb9a80eac1e
Directory: 4.4

Tags: 4.3
Architectures: amd64
GitCommit: d7e2a8d90a9b8f5dfd5bcd428e0c33b68c40cc19
Directory: 4.3
";

    fn repo() -> Repo {
        Repo {
            repo_name: "bash".to_string(),
            tag_name: None,
            tag_entries: None,
            manifest: parse(MANIFEST).unwrap(),
        }
    }

    #[test]
    fn default_format_prints_the_manifest() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config::test_config(dir.path());
        let mut renderer = Renderer::new(DEFAULT_FORMAT, &config).unwrap();

        let repo = repo();
        let out = renderer.render(&repo, 0).unwrap();
        assert_eq!(out, repo.manifest.to_string());

        // position separator between repos
        let out = renderer.render(&repo, 1).unwrap();
        assert!(out.starts_with("\n\n"));
    }

    #[test]
    fn default_format_prints_selected_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config::test_config(dir.path());
        let mut renderer = Renderer::new(DEFAULT_FORMAT, &config).unwrap();

        let mut repo = repo();
        repo.tag_name = Some("4.3".to_string());
        repo.tag_entries = Some(vec![1]);
        let out = renderer.render(&repo, 0).unwrap();
        assert!(out.contains("Tags: 4.3"));
        assert!(!out.contains("Tags: 4.4"));
    }

    #[test]
    fn helper_functions_and_filters() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = config::test_config(dir.path());
        config
            .arch_namespaces
            .insert("amd64".to_string(), "amd64ns".to_string());

        let format = "{{ arch() }} {{ archNamespace(arch=\"amd64\") }} \
                      {{ ociPlatform(arch=\"arm32v7\") | get(key=\"os\") }}/{{ ociPlatform(arch=\"arm32v7\") | get(key=\"variant\") }} \
                      {{ repo.entries | archFilter(arch=\"arm64v8\") | length }} \
                      {{ defaults() | get(key=\"file\") }}";
        let mut renderer = Renderer::new(format, &config).unwrap();
        let out = renderer.render(&repo(), 0).unwrap();
        assert_eq!(out, "amd64 amd64ns linux/v7 1 Dockerfile");
    }

    #[test]
    fn git_cache_helper_points_into_the_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config::test_config(dir.path());
        let mut renderer = Renderer::new("{{ gitCache() }}", &config).unwrap();
        let out = renderer.render(&repo(), 0).unwrap();
        assert!(out.ends_with("/cache/git"), "{out}");
    }
}
