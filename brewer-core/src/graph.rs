//! Dependency graph over catalog tags.
//!
//! Edges run from a base image to every tag whose build file references
//! it. The repo-level projection drives the cross-repository build order;
//! the same projection inside one repository orders its entries; the
//! tag-level edges back the parents/children walks.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::cache::MetadataResolver;
use crate::config::Config;
use crate::error::{BrewError, Result};
use crate::manifest::{namespaced_repo, Library, Repo};

/// One repository's ordering input: its name and the repo names of every
/// base image its entries reference.
#[derive(Debug, Clone)]
pub struct RepoNode {
    pub name: String,
    pub from_repos: Vec<String>,
}

/// Topologically order `nodes` so every dependency comes before its
/// dependents. Edges to repos outside the set are ignored; self-edges are
/// dropped; ties keep input order; a cycle is an error.
pub fn build_order(nodes: &[RepoNode]) -> Result<Vec<usize>> {
    let index_by_name: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut outbound: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut seen_edges = HashSet::new();
    for (i, node) in nodes.iter().enumerate() {
        for from in &node.from_repos {
            let Some(&dep) = index_by_name.get(from.as_str()) else {
                continue;
            };
            if dep == i || !seen_edges.insert((dep, i)) {
                continue;
            }
            outbound[dep].push(i);
            in_degree[i] += 1;
        }
    }

    let mut order = Vec::with_capacity(nodes.len());
    let mut emitted = vec![false; nodes.len()];
    while order.len() < nodes.len() {
        // lowest input index first keeps ties stable across runs
        let next = (0..nodes.len()).find(|&i| !emitted[i] && in_degree[i] == 0);
        let Some(next) = next else {
            let stuck: Vec<String> = nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| !emitted[*i])
                .map(|(_, node)| node.name.clone())
                .collect();
            return Err(BrewError::Cycle { names: stuck });
        };
        emitted[next] = true;
        order.push(next);
        for &dependent in &outbound[next] {
            in_degree[dependent] -= 1;
        }
    }
    Ok(order)
}

/// Order one repository's entries so a tag built `FROM` a sibling tag
/// comes after it. A tag `FROM` its own entry is not a cycle by
/// convention and is ignored; real intra-repo cycles are errors.
pub fn sorted_entry_indexes(
    repo_name: &str,
    entry_tags: &[Vec<String>],
    entry_froms: &[Vec<String>],
) -> Result<Vec<usize>> {
    // tag suffix -> owning entry
    let mut owner: HashMap<&str, usize> = HashMap::new();
    for (i, tags) in entry_tags.iter().enumerate() {
        for tag in tags {
            owner.insert(tag.as_str(), i);
        }
    }

    let nodes: Vec<RepoNode> = entry_froms
        .iter()
        .enumerate()
        .map(|(i, froms)| {
            let mut deps = Vec::new();
            for from in froms {
                let (from_repo, from_tag) = match from.split_once(':') {
                    Some(pair) => pair,
                    None => (from.as_str(), "latest"),
                };
                if from_repo != repo_name {
                    continue;
                }
                if let Some(&dep) = owner.get(from_tag) {
                    if dep != i {
                        deps.push(format!("{}", dep));
                    }
                }
            }
            RepoNode {
                name: format!("{}", i),
                from_repos: deps,
            }
        })
        .collect();

    build_order(&nodes).map_err(|err| match err {
        BrewError::Cycle { names } => BrewError::Cycle {
            names: names
                .iter()
                .filter_map(|i| i.parse::<usize>().ok())
                .filter_map(|i| entry_tags.get(i).and_then(|tags| tags.first()))
                .map(|tag| format!("{}:{}", repo_name, tag))
                .collect(),
        },
        other => other,
    })
}

fn skip_constraints(repo: &Repo, entry: &crate::manifest::ManifestEntry, config: &Config) -> bool {
    repo.skip_constraints(
        entry,
        &config.arch,
        &config.constraints,
        config.exclusive_constraints,
    )
}

/// Sort repo arguments into build order (dependencies first, ties in
/// input order).
pub async fn sort_repo_args(
    library: &Library,
    resolver: &MetadataResolver<'_>,
    config: &Config,
    repo_args: Vec<String>,
    apply_constraints: bool,
) -> Result<Vec<String>> {
    if repo_args.len() <= 1 {
        return Ok(repo_args);
    }

    let mut nodes = Vec::with_capacity(repo_args.len());
    for arg in &repo_args {
        let repo = library.fetch(arg).await?;
        let mut from_repos = Vec::new();
        for entry in repo.entries() {
            if apply_constraints && skip_constraints(&repo, entry, config) {
                continue;
            }
            let froms = resolver.arch_froms(&repo, entry, &config.arch).await?;
            for from in froms {
                let from_repo = from.split(':').next().unwrap_or(&from).to_string();
                if from_repo != repo.repo_name && !from_repos.contains(&from_repo) {
                    from_repos.push(from_repo);
                }
            }
        }
        nodes.push(RepoNode {
            name: repo.repo_name.clone(),
            from_repos,
        });
    }

    let order = build_order(&nodes)?;
    Ok(order.into_iter().map(|i| repo_args[i].clone()).collect())
}

/// One repo's selected entries in intra-repository build order.
pub async fn sorted_repo_entries<'r>(
    resolver: &MetadataResolver<'_>,
    config: &Config,
    repo: &'r Repo,
    apply_constraints: bool,
) -> Result<Vec<&'r crate::manifest::ManifestEntry>> {
    let entries = repo.entries();
    let mut tags = Vec::with_capacity(entries.len());
    let mut froms = Vec::with_capacity(entries.len());
    for entry in &entries {
        tags.push(entry.tags.clone());
        if apply_constraints && skip_constraints(repo, entry, config) {
            // constrained-out entries keep their slot but contribute no
            // edges (and cost no git fetch)
            froms.push(Vec::new());
            continue;
        }
        froms.push(resolver.arch_froms(repo, entry, &config.arch).await?);
    }
    let order = sorted_entry_indexes(&repo.repo_name, &tags, &froms)?;
    Ok(order.into_iter().map(|i| entries[i]).collect())
}

fn push_uniq(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|v| v == value) {
        false
    } else {
        list.push(value.to_string());
        true
    }
}

/// Walk options shared by `parents` and `children`.
#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    pub apply_constraints: bool,
    pub arch_filter: bool,
    pub uniq: bool,
    /// 0 = unbounded; -1 (children only) = print the argument itself and
    /// do not walk.
    pub depth: i32,
}

/// The tags built `FROM` each of `args` (directly or transitively),
/// in walk order.
pub async fn children(
    library: &Library,
    resolver: &MetadataResolver<'_>,
    config: &Config,
    args: &[String],
    options: WalkOptions,
) -> Result<Vec<String>> {
    let all_repos = library.all_repos()?;

    // canonical tag mapping and per-tag architecture sets
    let mut canonical: HashMap<String, String> = HashMap::new();
    let mut arches: HashMap<String, Vec<String>> = HashMap::new();
    for name in &all_repos {
        let repo = library.fetch(name).await?;
        for entry in repo.entries() {
            if options.apply_constraints
                && repo.skip_constraints(
                    entry,
                    &config.arch,
                    &config.constraints,
                    config.exclusive_constraints,
                )
            {
                continue;
            }
            if options.arch_filter && !entry.has_architecture(&config.arch) {
                continue;
            }

            let tags = repo.tags(&config.namespace, false, entry);
            for tag in &tags {
                canonical.insert(tag.clone(), tags[0].clone());
            }

            let entry_arches: Vec<String> =
                if !options.apply_constraints && !options.arch_filter {
                    entry.architectures().to_vec()
                } else {
                    vec![config.arch.clone()]
                };
            for entry_arch in entry_arches {
                push_uniq(arches.entry(tags[0].clone()).or_default(), &entry_arch);
            }
        }
    }

    // FROM -> canonical child tags, and repo -> tags (including
    // no-longer-supported tags reached only as FROMs)
    let mut child_map: HashMap<String, Vec<String>> = HashMap::new();
    let mut repo_tags: HashMap<String, Vec<String>> = HashMap::new();
    for name in &all_repos {
        let repo = library.fetch(name).await?;
        let ns_repo = namespaced_repo(&config.namespace, &repo.repo_name);

        for entry in repo.entries() {
            if options.apply_constraints
                && repo.skip_constraints(
                    entry,
                    &config.arch,
                    &config.constraints,
                    config.exclusive_constraints,
                )
            {
                continue;
            }
            if options.arch_filter && !entry.has_architecture(&config.arch) {
                continue;
            }

            let entry_arches: Vec<String> =
                if !options.apply_constraints && !options.arch_filter {
                    entry.architectures().to_vec()
                } else {
                    vec![config.arch.clone()]
                };

            let tag = format!("{}:{}", ns_repo, entry.tags[0]);
            push_uniq(repo_tags.entry(ns_repo.clone()).or_default(), &tag);

            for entry_arch in &entry_arches {
                let froms = resolver.arch_froms(&repo, entry, entry_arch).await?;
                for from in froms {
                    let from = match canonical.get(&from) {
                        Some(canon) => canon.clone(),
                        None => {
                            // unsupported base: record the implied arch so
                            // filtering still works when walking through it
                            push_uniq(arches.entry(from.clone()).or_default(), entry_arch);
                            from
                        }
                    };
                    push_uniq(child_map.entry(from.clone()).or_default(), &tag);
                    if let Some((from_repo, _)) = from.split_once(':') {
                        push_uniq(repo_tags.entry(from_repo.to_string()).or_default(), &from);
                    }
                }
            }
        }
    }

    let mut out = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for arg in args {
        let tags: Vec<String> = if child_map.contains_key(arg) {
            vec![arg.clone()]
        } else if let Some(canon) = canonical.get(arg) {
            vec![canon.clone()]
        } else if let Some(tags) = repo_tags.get(&namespaced_repo(&config.namespace, arg)) {
            tags.clone()
        } else if let Some(tags) = repo_tags.get(arg) {
            tags.clone()
        } else {
            Vec::new()
        };
        if tags.is_empty() {
            return Err(BrewError::TagNotFound {
                repo: arg.clone(),
                tag: arg.clone(),
            });
        }

        for tag in tags {
            let supported_arches = arches.get(&tag).cloned().unwrap_or_default();
            debug!(tag = %tag, arches = ?supported_arches, "walking children");
            if options.depth == -1 {
                out.push(tag);
                continue;
            }
            let mut lookup = vec![tag];
            let mut remaining = options.depth;
            while !lookup.is_empty() && (options.depth == 0 || remaining > 0) {
                let mut next_lookup = Vec::new();
                for tag in &lookup {
                    for kid in child_map.get(tag).cloned().unwrap_or_default() {
                        let kid_arches = arches.get(&kid).cloned().unwrap_or_default();
                        let supported = kid_arches
                            .iter()
                            .any(|a| supported_arches.iter().any(|s| s == a));
                        if !supported {
                            continue;
                        }
                        next_lookup.push(kid.clone());
                        if options.uniq && !seen.insert(kid.clone()) {
                            continue;
                        }
                        out.push(kid);
                    }
                }
                lookup = next_lookup;
                remaining -= 1;
            }
        }
    }

    Ok(out)
}

/// The base images each of `args` is built `FROM` (directly or
/// transitively), in walk order. Repos that are not in the catalog stop
/// the walk silently unless they were named as arguments.
pub async fn parents(
    library: &Library,
    resolver: &MetadataResolver<'_>,
    config: &Config,
    args: &[String],
    options: WalkOptions,
) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for arg in args {
        let mut lookup = vec![arg.clone()];
        // architectures under which the walk is being considered; carried
        // forward so a linux-only leaf never reports windows-only parents
        let mut lookup_arches: Vec<String> = Vec::new();
        let mut remaining = options.depth;
        let mut at_root = true;

        while !lookup.is_empty() && (options.depth == 0 || remaining > 0) {
            let mut next_lookup: Vec<String> = Vec::new();
            for reference in &lookup {
                let repo = match library.fetch(reference).await {
                    Ok(repo) => repo,
                    Err(err) if !at_root && err.is_not_found() => continue,
                    Err(err) => return Err(err),
                };
                for entry in repo.entries() {
                    if options.apply_constraints
                        && repo.skip_constraints(
                            entry,
                            &config.arch,
                            &config.constraints,
                            config.exclusive_constraints,
                        )
                    {
                        continue;
                    }
                    if options.arch_filter && !entry.has_architecture(&config.arch) {
                        continue;
                    }

                    if at_root {
                        if !options.apply_constraints && !options.arch_filter {
                            for entry_arch in entry.architectures() {
                                push_uniq(&mut lookup_arches, entry_arch);
                            }
                        } else {
                            push_uniq(&mut lookup_arches, &config.arch);
                        }
                    }

                    let mut entry_froms = Vec::new();
                    for lookup_arch in lookup_arches.clone() {
                        if !entry.has_architecture(&lookup_arch) {
                            continue;
                        }
                        let froms = resolver.arch_froms(&repo, entry, &lookup_arch).await?;
                        for from in froms {
                            if from == "scratch" {
                                // a built-in, not anyone's actual parent
                                continue;
                            }
                            push_uniq(&mut entry_froms, &from);
                        }
                    }
                    for from in entry_froms {
                        push_uniq(&mut next_lookup, &from);
                        if options.uniq && !seen.insert(from.clone()) {
                            continue;
                        }
                        out.push(from);
                    }
                }
            }
            lookup = next_lookup;
            remaining -= 1;
            at_root = false;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, deps: &[&str]) -> RepoNode {
        RepoNode {
            name: name.to_string(),
            from_repos: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn build_order_respects_dependencies() {
        let nodes = vec![
            node("python", &["buildpack-deps"]),
            node("buildpack-deps", &["debian"]),
            node("debian", &["scratch"]),
        ];
        let order = build_order(&nodes).unwrap();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn build_order_is_stable_for_ties() {
        let nodes = vec![
            node("a", &[]),
            node("b", &[]),
            node("c", &["a"]),
            node("d", &[]),
        ];
        let order = build_order(&nodes).unwrap();
        assert_eq!(order, vec![0, 1, 3, 2]);

        // identical input, identical output
        assert_eq!(build_order(&nodes).unwrap(), order);
    }

    #[test]
    fn build_order_ignores_external_and_self_edges() {
        let nodes = vec![
            node("hello", &["alpine", "hello"]),
            node("world", &["hello"]),
        ];
        let order = build_order(&nodes).unwrap();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn build_order_detects_cycles() {
        let nodes = vec![node("a", &["b"]), node("b", &["a"])];
        match build_order(&nodes).unwrap_err() {
            BrewError::Cycle { names } => {
                assert_eq!(names, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn entries_order_within_a_repo() {
        // python:3-onbuild is FROM python:3 -- must build after it
        let tags = vec![
            vec!["3-onbuild".to_string()],
            vec!["3".to_string(), "latest".to_string()],
        ];
        let froms = vec![
            vec!["python:3".to_string()],
            vec!["buildpack-deps:bookworm".to_string()],
        ];
        let order = sorted_entry_indexes("python", &tags, &froms).unwrap();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn self_from_is_not_a_cycle() {
        let tags = vec![vec!["latest".to_string()]];
        let froms = vec![vec!["python:latest".to_string()]];
        let order = sorted_entry_indexes("python", &tags, &froms).unwrap();
        assert_eq!(order, vec![0]);
    }

    #[test]
    fn intra_repo_cycles_are_errors() {
        let tags = vec![vec!["a".to_string()], vec!["b".to_string()]];
        let froms = vec![vec!["repo:b".to_string()], vec!["repo:a".to_string()]];
        match sorted_entry_indexes("repo", &tags, &froms).unwrap_err() {
            BrewError::Cycle { names } => {
                assert_eq!(names, vec!["repo:a", "repo:b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
