use anyhow::{Context, Result};
use brewer_core::graph::{self, WalkOptions};

use super::App;

pub async fn run(
    app: &App,
    apply_constraints: bool,
    arch_filter: bool,
    uniq: bool,
    depth: i32,
    args: &[String],
) -> Result<()> {
    anyhow::ensure!(!args.is_empty(), "need at least one argument");

    let resolver = app.resolver();
    let lines = graph::children(
        &app.library,
        &resolver,
        &app.config,
        args,
        WalkOptions {
            apply_constraints,
            arch_filter,
            uniq,
            depth,
        },
    )
    .await
    .context("failed walking children")?;

    for line in lines {
        println!("{line}");
    }
    Ok(())
}
