use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::App;

#[derive(Parser)]
#[command(name = "brewer")]
#[command(about = "canonical build tool for a curated image catalog", long_about = None)]
struct Cli {
    /// Directory of per-repository manifest files
    #[arg(long, global = true, env = "BASHBREW_LIBRARY")]
    library: Option<PathBuf>,

    /// Cache root (git store, content store)
    #[arg(long, global = true, env = "BASHBREW_CACHE")]
    cache: Option<PathBuf>,

    /// Active build architecture
    #[arg(long, global = true, env = "BASHBREW_ARCH")]
    arch: Option<String>,

    /// Default namespace prefix for listed/built tags
    #[arg(long, global = true, env = "BASHBREW_NAMESPACE")]
    namespace: Option<String>,

    /// Per-architecture registry namespaces (arch=namespace,...)
    #[arg(long, global = true, env = "BASHBREW_ARCH_NAMESPACES")]
    arch_namespaces: Option<String>,

    /// Build constraints (repeatable)
    #[arg(long = "constraint", global = true)]
    constraints: Vec<String>,

    /// Skip entries which declare no constraints
    #[arg(long, global = true)]
    exclusive_constraints: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List repo:tag combinations for the given repos
    #[command(alias = "ls")]
    List {
        /// Act on every repo in the library
        #[arg(long)]
        all: bool,

        /// Only the first tag of each entry
        #[arg(long, alias = "unique")]
        uniq: bool,

        /// Sort repos into build order
        #[arg(long)]
        build_order: bool,

        /// Apply constraints as if building
        #[arg(long)]
        apply_constraints: bool,

        /// Only entries supporting the active architecture
        #[arg(long)]
        arch_filter: bool,

        /// Print repository names (or the selected tags) only
        #[arg(long)]
        repos: bool,

        #[arg(value_name = "repo")]
        args: Vec<String>,
    },

    /// Print manifest contents for the given repos
    Cat {
        #[arg(long)]
        all: bool,

        /// Output format (a template)
        #[arg(short, long)]
        format: Option<String>,

        /// Read the format from a file
        #[arg(short = 'F', long)]
        format_file: Option<PathBuf>,

        #[arg(long)]
        build_order: bool,

        #[arg(value_name = "repo")]
        args: Vec<String>,
    },

    /// Fetch the git commits the given repos reference
    Fetch {
        #[arg(long)]
        all: bool,

        #[arg(long)]
        apply_constraints: bool,

        #[arg(long)]
        arch_filter: bool,

        #[arg(value_name = "repo")]
        args: Vec<String>,
    },

    /// Build (and tag) repo:tag combinations for the given repos
    Build {
        #[arg(long)]
        all: bool,

        #[arg(long, alias = "unique")]
        uniq: bool,

        /// Pull policy for base images: always, missing or never
        #[arg(long, default_value = "missing")]
        pull: String,

        #[arg(long)]
        dry_run: bool,

        #[arg(value_name = "repo")]
        args: Vec<String>,
    },

    /// Push namespace/repo:tag (see also put-shared)
    Push {
        #[arg(long)]
        all: bool,

        #[arg(long, alias = "unique")]
        uniq: bool,

        /// Namespace to push to (defaults to --namespace)
        #[arg(long)]
        target_namespace: Option<String>,

        #[arg(long)]
        dry_run: bool,

        /// Push even when the remote is already up to date
        #[arg(long)]
        force: bool,

        #[arg(value_name = "repo")]
        args: Vec<String>,
    },

    /// Publish multi-arch manifest lists for shared tags
    PutShared {
        #[arg(long)]
        all: bool,

        #[arg(long)]
        target_namespace: Option<String>,

        /// Only publish the active architecture's entries
        #[arg(long)]
        single_arch: bool,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        force: bool,

        #[arg(value_name = "repo")]
        args: Vec<String>,
    },

    /// Print the repos built FROM the given repo or repo:tag
    Children {
        #[arg(long)]
        apply_constraints: bool,

        #[arg(long)]
        arch_filter: bool,

        #[arg(long, alias = "unique")]
        uniq: bool,

        /// Walk depth (0 = unbounded, -1 = print arguments only)
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        depth: i32,

        #[arg(value_name = "repo")]
        args: Vec<String>,
    },

    /// Print the repos the given repo or repo:tag is FROM
    Parents {
        #[arg(long)]
        apply_constraints: bool,

        #[arg(long)]
        arch_filter: bool,

        #[arg(long, alias = "unique")]
        uniq: bool,

        /// Walk depth (0 = unbounded)
        #[arg(long, default_value_t = 0)]
        depth: i32,

        #[arg(value_name = "repo")]
        args: Vec<String>,
    },

    /// Resolve registry references and print their per-arch digests
    RemoteArches {
        /// Emit JSON
        #[arg(long)]
        json: bool,

        #[arg(value_name = "ref")]
        args: Vec<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = brewer_core::Config::new(
        cli.library,
        cli.cache,
        cli.arch,
        cli.namespace,
        cli.arch_namespaces,
        cli.constraints,
        cli.exclusive_constraints,
    );
    let app = App::new(config);

    match cli.command {
        Commands::List {
            all,
            uniq,
            build_order,
            apply_constraints,
            arch_filter,
            repos,
            args,
        } => {
            commands::list::run(
                &app,
                all,
                uniq,
                build_order,
                apply_constraints,
                arch_filter,
                repos,
                &args,
            )
            .await
        }
        Commands::Cat {
            all,
            format,
            format_file,
            build_order,
            args,
        } => commands::cat::run(&app, all, format, format_file, build_order, &args).await,
        Commands::Fetch {
            all,
            apply_constraints,
            arch_filter,
            args,
        } => commands::fetch::run(&app, all, apply_constraints, arch_filter, &args).await,
        Commands::Build {
            all,
            uniq,
            pull,
            dry_run,
            args,
        } => commands::build::run(&app, all, uniq, &pull, dry_run, &args).await,
        Commands::Push {
            all,
            uniq,
            target_namespace,
            dry_run,
            force,
            args,
        } => {
            commands::push::run(
                &app,
                all,
                uniq,
                target_namespace.as_deref(),
                dry_run,
                force,
                &args,
            )
            .await
        }
        Commands::PutShared {
            all,
            target_namespace,
            single_arch,
            dry_run,
            force,
            args,
        } => {
            commands::put_shared::run(
                &app,
                all,
                target_namespace.as_deref(),
                single_arch,
                dry_run,
                force,
                &args,
            )
            .await
        }
        Commands::Children {
            apply_constraints,
            arch_filter,
            uniq,
            depth,
            args,
        } => {
            commands::children::run(&app, apply_constraints, arch_filter, uniq, depth, &args).await
        }
        Commands::Parents {
            apply_constraints,
            arch_filter,
            uniq,
            depth,
            args,
        } => commands::parents::run(&app, apply_constraints, arch_filter, uniq, depth, &args).await,
        Commands::RemoteArches { json, args } => {
            commands::remote_arches::run(&app, json, &args).await
        }
    }
}
