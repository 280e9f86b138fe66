use anyhow::{Context, Result};
use brewer_core::plan::gather_repos;

use super::App;

pub async fn run(
    app: &App,
    all: bool,
    uniq: bool,
    target_namespace: Option<&str>,
    dry_run: bool,
    force: bool,
    args: &[String],
) -> Result<()> {
    let target_namespace = target_namespace
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .or_else(|| {
            Some(app.config.namespace.clone()).filter(|ns| !ns.is_empty())
        })
        .context(r#"either "--target-namespace" or "--namespace" is required for "push""#)?;

    let repos = gather_repos(&app.library, all, args).context("failed gathering repo list")?;

    let resolver = app.resolver();
    let store = app.open_store()?;
    let planner = app.planner(&resolver, &store);

    for repo_arg in &repos {
        let repo = app
            .library
            .fetch(repo_arg)
            .await
            .with_context(|| format!("failed fetching repo {repo_arg:?}"))?;
        planner
            .push_repo(&repo, uniq, &target_namespace, dry_run, force)
            .await
            .with_context(|| format!("failed pushing {repo_arg:?}"))?;
    }

    Ok(())
}
