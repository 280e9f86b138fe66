use std::path::PathBuf;

use anyhow::{Context, Result};
use brewer_core::graph;
use brewer_core::plan::gather_repos;
use brewer_core::template::{Renderer, DEFAULT_FORMAT};

use super::App;

pub async fn run(
    app: &App,
    all: bool,
    format: Option<String>,
    format_file: Option<PathBuf>,
    build_order: bool,
    args: &[String],
) -> Result<()> {
    let mut repos = gather_repos(&app.library, all, args).context("failed gathering repo list")?;

    if build_order {
        let resolver = app.resolver();
        repos = graph::sort_repo_args(&app.library, &resolver, &app.config, repos, false)
            .await
            .context("failed sorting repo list")?;
    }

    let format = match (format, format_file) {
        (_, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading --format-file {:?}", path))?,
        (Some(format), None) => format,
        (None, None) => DEFAULT_FORMAT.to_string(),
    };

    let mut renderer =
        Renderer::new(&format, &app.config).context("failed parsing --format")?;

    for (i, repo_arg) in repos.iter().enumerate() {
        let repo = app
            .library
            .fetch(repo_arg)
            .await
            .with_context(|| format!("failed fetching repo {repo_arg:?}"))?;
        let out = renderer
            .render(&repo, i)
            .with_context(|| format!("failed executing template for repo {repo_arg:?}"))?;
        print!("{out}");
        if !out.ends_with('\n') {
            println!();
        }
    }

    Ok(())
}
