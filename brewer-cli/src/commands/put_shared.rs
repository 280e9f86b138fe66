use anyhow::{Context, Result};
use brewer_core::plan::gather_repos;

use super::App;

pub async fn run(
    app: &App,
    all: bool,
    target_namespace: Option<&str>,
    single_arch: bool,
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
        .context(r#"either "--target-namespace" or "--namespace" is required for "put-shared""#)?;

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
            .put_shared(&repo, single_arch, &target_namespace, dry_run, force)
            .await
            .with_context(|| format!("failed putting shared tags for {repo_arg:?}"))?;
    }

    Ok(())
}
