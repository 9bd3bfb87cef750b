use anyhow::Result;
use clap::{Parser, Subcommand};
use greeter::config::{AppConfig, CliOverrides, DirectoryKind};
use greeter::directory::Directory;
use greeter::{gateway, logging, server, signals};
use naming::MemoryDirectory;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Greeter - self-registering service and directory-aware gateway
#[derive(Parser)]
#[command(name = "greeter")]
#[command(about = "Greeter - self-registering service and directory-aware gateway")]
#[command(version)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Service name to register under (overrides server.name)
    #[arg(long)]
    name: Option<String>,

    /// Address to advertise in the directory (overrides server.advertise)
    #[arg(long)]
    addr: Option<String>,

    /// Greeter listen address (overrides server.listen)
    #[arg(long)]
    listen: Option<String>,

    /// Directory backend (overrides directory.kind)
    #[arg(long, value_enum)]
    directory: Option<DirectoryKind>,

    /// Print effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Run a greeter instance registered in the directory
    Serve,
    /// Run the gateway in front of the registered instances
    Gateway,
    /// Run a greeter and the gateway over an in-process directory
    Standalone,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1) defaults -> 2) YAML (if provided) -> 3) env (GREETER__*) -> 4) CLI overrides
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(&CliOverrides {
        name: cli.name,
        addr: cli.addr,
        listen: cli.listen,
        directory: cli.directory,
    });

    if cli.print_config {
        println!("Effective configuration:\n{}", config.to_pretty_json()?);
        return Ok(());
    }

    logging::init(&config.logging, cli.verbose);

    let shutdown = CancellationToken::new();
    signals::cancel_on_shutdown(shutdown.clone());

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let directory = Directory::connect(&config.directory).await?;
            server::run(&config, directory.client, shutdown).await
        }
        Commands::Gateway => {
            let directory = Directory::connect(&config.directory).await?;
            gateway::run(&config.gateway, directory.lookup, shutdown).await
        }
        Commands::Standalone => run_standalone(&config, shutdown).await,
    }
}

async fn run_standalone(config: &AppConfig, shutdown: CancellationToken) -> Result<()> {
    tracing::info!("Standalone mode: greeter and gateway share an in-process directory");
    let directory = Directory::memory(MemoryDirectory::new());

    // Whichever half stops first takes the other one down with it.
    let gateway = async {
        let result =
            gateway::run(&config.gateway, Arc::clone(&directory.lookup), shutdown.clone()).await;
        shutdown.cancel();
        result
    };
    let greeter = async {
        let result = server::run(config, Arc::clone(&directory.client), shutdown.clone()).await;
        shutdown.cancel();
        result
    };

    let (gateway, greeter) = tokio::join!(gateway, greeter);
    greeter?;
    gateway
}
