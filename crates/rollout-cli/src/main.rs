mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    plan::PlanSubcommand, run::RunArgs, store::StoreSubcommand, versions::VersionsSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rollout",
    about = "Staged, health-gated rollouts: check, act, verify, repeat",
    version,
    propagate_version = true
)]
struct Cli {
    /// Working root (default: nearest directory with rollout.yaml or .rollout/)
    #[arg(long, global = true, env = "ROLLOUT_ROOT")]
    root: Option<PathBuf>,

    /// State store path (default: .rollout/state.redb under the root)
    #[arg(long, global = true, env = "ROLLOUT_STORE")]
    store: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter plan and create the state directory
    Init,

    /// Run the reconciliation loop over a plan
    Run(RunArgs),

    /// Inspect a plan without running it
    Plan {
        #[command(subcommand)]
        subcommand: PlanSubcommand,
    },

    /// Read and write raw store entries
    Store {
        #[command(subcommand)]
        subcommand: StoreSubcommand,
    },

    /// Show recorded member versions
    Versions {
        #[command(subcommand)]
        subcommand: VersionsSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let store = cli.store.as_deref();

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Run(args) => cmd::run::run(&root, store, args, cli.json),
        Commands::Plan { subcommand } => cmd::plan::run(&root, subcommand, cli.json),
        Commands::Store { subcommand } => cmd::store::run(&root, store, subcommand, cli.json),
        Commands::Versions { subcommand } => {
            cmd::versions::run(&root, store, subcommand, cli.json)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
