use anyhow::{Context, Result};
use brewer_core::graph;
use brewer_core::manifest::namespaced_repo;
use brewer_core::plan::gather_repos;

use super::App;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    app: &App,
    all: bool,
    uniq: bool,
    build_order: bool,
    apply_constraints: bool,
    arch_filter: bool,
    only_repos: bool,
    args: &[String],
) -> Result<()> {
    let mut repos = gather_repos(&app.library, all, args).context("failed gathering repo list")?;

    let resolver = app.resolver();
    if build_order {
        repos = graph::sort_repo_args(
            &app.library,
            &resolver,
            &app.config,
            repos,
            apply_constraints,
        )
        .await
        .context("failed sorting repo list")?;
    }

    for repo_arg in &repos {
        let repo = app
            .library
            .fetch(repo_arg)
            .await
            .with_context(|| format!("failed fetching repo {repo_arg:?}"))?;

        if only_repos {
            match &repo.tag_entries {
                None => println!("{}", namespaced_repo(&app.config.namespace, &repo.repo_name)),
                Some(_) => {
                    for entry in repo.entries() {
                        for tag in repo.tags(&app.config.namespace, uniq, entry) {
                            println!("{tag}");
                        }
                    }
                }
            }
            continue;
        }

        let entries = if build_order {
            graph::sorted_repo_entries(&resolver, &app.config, &repo, apply_constraints)
                .await
                .with_context(|| format!("failed sorting entries list for {repo_arg:?}"))?
        } else {
            repo.entries()
        };

        for entry in entries {
            if apply_constraints
                && repo.skip_constraints(
                    entry,
                    &app.config.arch,
                    &app.config.constraints,
                    app.config.exclusive_constraints,
                )
            {
                continue;
            }
            if arch_filter && !entry.has_architecture(&app.config.arch) {
                continue;
            }
            for tag in repo.tags(&app.config.namespace, uniq, entry) {
                println!("{tag}");
            }
        }
    }

    Ok(())
}
