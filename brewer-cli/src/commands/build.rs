use anyhow::{Context, Result};
use brewer_core::plan::{gather_repos, PullPolicy};

use super::App;

pub async fn run(
    app: &App,
    all: bool,
    uniq: bool,
    pull: &str,
    dry_run: bool,
    args: &[String],
) -> Result<()> {
    let pull: PullPolicy = pull.parse()?;

    let repos = gather_repos(&app.library, all, args).context("failed gathering repo list")?;

    let resolver = app.resolver();
    let store = app.open_store()?;
    let planner = app.planner(&resolver, &store);

    let repos = planner
        .sort_repos(repos, true)
        .await
        .context("failed sorting repo list")?;

    for repo_arg in &repos {
        let repo = app
            .library
            .fetch(repo_arg)
            .await
            .with_context(|| format!("failed fetching repo {repo_arg:?}"))?;
        planner
            .build_repo(&repo, uniq, pull, dry_run)
            .await
            .with_context(|| format!("failed building {repo_arg:?}"))?;
    }

    Ok(())
}
