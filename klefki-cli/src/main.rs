//! Klefki CLI - machine registry management and broker requests

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use klefki_daemon::config::{default_database_path, parse_duration};
use klefki_proto::klefki_service_client::KlefkiServiceClient;
use klefki_registry::MachineStore;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

mod commands;
mod utils;

use commands::{machines, requests};

/// Klefki - key broker for unattended disk unlock
#[derive(Parser)]
#[command(name = "klefkictl", version, about)]
struct Cli {
    /// Broker address
    #[arg(
        long,
        env = "KLEFKI_SERVER",
        default_value = "http://127.0.0.1:5300",
        global = true
    )]
    server: String,

    /// Machine registry database (default: <data dir>/klefki/klefki.db)
    #[arg(long, env = "KLEFKI_DATABASE", global = true)]
    database: Option<PathBuf>,

    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered machines
    Machines {
        #[command(subcommand)]
        action: MachinesAction,
    },

    /// Make requests to a klefki broker
    Requests {
        #[command(subcommand)]
        action: RequestsAction,
    },
}

#[derive(Subcommand)]
enum MachinesAction {
    /// Generate a key pair and register a new machine
    New {
        /// Human-readable machine name
        name: String,

        /// Write the private key here (mode 0600) instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// List registered machines
    List,

    /// Remove a machine by fingerprint
    Delete {
        /// Machine fingerprint (SHA256:...)
        fingerprint: String,
    },
}

#[derive(Subcommand)]
enum RequestsAction {
    /// Print the broker's current time
    Time,

    /// Get the passphrase for this machine
    Getkey {
        /// Path to the machine's PEM private key
        #[arg(long)]
        priv_key: PathBuf,

        /// Keep polling until a key is submitted
        #[arg(long)]
        wait: bool,

        /// Initial delay between polls with --wait (doubles up to 60s)
        #[arg(long, default_value = "5s", value_parser = parse_duration)]
        interval: Duration,

        /// Give up waiting after this long
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,
    },

    /// List machines waiting for a key
    Listsessions,

    /// Encrypt a passphrase to a machine and submit it
    Submitkey {
        /// Machine fingerprint (SHA256:...)
        machine_id: String,

        /// Read the passphrase from this file instead of stdin
        #[arg(long)]
        passphrase_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let result = run(cli).await;

    if let Err(e) = &result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let database = cli.database.clone().unwrap_or_else(default_database_path);

    match &cli.command {
        Commands::Machines { action } => {
            let store = MachineStore::open(&database)
                .await
                .with_context(|| format!("Failed to open registry at {}", database.display()))?;

            match action {
                MachinesAction::New { name, out } => {
                    machines::new_machine(&store, name, out.as_deref(), cli.json).await
                }
                MachinesAction::List => machines::list_machines(&store, cli.json).await,
                MachinesAction::Delete { fingerprint } => {
                    machines::delete_machine(&store, fingerprint).await
                }
            }
        }

        Commands::Requests { action } => {
            let mut client = connect(&cli.server).await?;

            match action {
                RequestsAction::Time => requests::get_time(&mut client, cli.json).await,
                RequestsAction::Getkey {
                    priv_key,
                    wait,
                    interval,
                    timeout,
                } => {
                    let options = requests::GetKeyOptions {
                        priv_key,
                        wait: *wait,
                        interval: *interval,
                        timeout: *timeout,
                    };
                    requests::get_key(&mut client, options).await
                }
                RequestsAction::Listsessions => {
                    requests::list_sessions(&mut client, cli.json).await
                }
                RequestsAction::Submitkey {
                    machine_id,
                    passphrase_file,
                } => {
                    requests::submit_key(
                        &mut client,
                        &database,
                        machine_id,
                        passphrase_file.as_deref(),
                    )
                    .await
                }
            }
        }
    }
}

async fn connect(addr: &str) -> Result<KlefkiServiceClient<Channel>> {
    KlefkiServiceClient::connect(addr.to_string())
        .await
        .with_context(|| format!("Failed to connect to broker at {addr}"))
}
