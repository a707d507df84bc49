use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use ptyhub_core::SupervisorConfig;
use tracing_subscriber::EnvFilter;

mod inspect;
mod serve;

const DEFAULT_LOG_FILTER: &str = "ptyhub=info";

/// Supervises pseudo-terminal sessions for AI coding-agent CLIs.
#[derive(Debug, Parser)]
#[command(name = "ptyhub", version)]
struct Cli {
    /// Config file to load instead of the per-user default.
    #[arg(long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve JSON-lines requests on stdin and write responses and events to stdout.
    Serve,
    /// Print the spawn configuration a local session in DIR would use.
    Resolve(inspect::ResolveArgs),
    /// Print how a provider CLI would be invoked.
    Invocation(inspect::InvocationArgs),
    /// Print the ssh command for a saved or ad-hoc connection.
    SshRoute(inspect::SshRouteArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Serve => serve::run(config).await,
        Command::Resolve(args) => inspect::resolve(&config, args),
        Command::Invocation(args) => inspect::invocation(&config, args),
        Command::SshRoute(args) => inspect::ssh_route(&config, args),
    }
}

/// Logs go to stderr; stdout belongs to the protocol.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SupervisorConfig> {
    let config = match path {
        Some(path) => SupervisorConfig::load(path)?,
        None => SupervisorConfig::load_default()?,
    };
    Ok(config)
}
