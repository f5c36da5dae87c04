//! Klefki Daemon - key broker for unattended disk unlock
//!
//! Machines poll with a signed nonce; operators submit encrypted
//! passphrases; each passphrase is delivered exactly once.

use clap::{Parser, Subcommand};
use klefki_daemon::ServeArgs;
use tracing_subscriber::EnvFilter;

/// Klefki Daemon - key broker
#[derive(Parser)]
#[command(name = "klefki", version, about, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker (default if no command given)
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let args = match cli.command {
        Some(Commands::Serve(args)) => args,
        None => cli.serve,
    };

    let filter = match args.log_level.as_deref() {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    klefki_daemon::run(args).await
}
