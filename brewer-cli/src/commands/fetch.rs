use anyhow::{Context, Result};
use brewer_core::plan::gather_repos;

use super::App;

pub async fn run(
    app: &App,
    all: bool,
    apply_constraints: bool,
    arch_filter: bool,
    args: &[String],
) -> Result<()> {
    let repos = gather_repos(&app.library, all, args).context("failed gathering repo list")?;

    let resolver = app.resolver();

    for repo_arg in &repos {
        let repo = app
            .library
            .fetch(repo_arg)
            .await
            .with_context(|| format!("failed fetching repo {repo_arg:?}"))?;

        for entry in repo.entries() {
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

            let arches: Vec<String> = if apply_constraints || arch_filter {
                vec![app.config.arch.clone()]
            } else {
                entry.architectures().to_vec()
            };
            for entry_arch in arches {
                resolver
                    .fetch_commit(&repo, entry, &entry_arch)
                    .await
                    .with_context(|| {
                        format!(
                            "failed fetching git repo for {:?} (tags {:?} on arch {:?})",
                            repo.repo_name,
                            entry.tags_string(),
                            entry_arch
                        )
                    })?;
            }
        }
    }

    Ok(())
}
