mod daemon;

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use dotbot_config::AppConfig;
use dotbot_credentials::{CredentialVault, DeviceRegistry, InviteOptions, InviteStore};

#[derive(Debug, Parser)]
#[command(name = "dotbot", version, about = "Two-process AI assistant core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon (default).
    Serve {
        /// Socket to listen on. Defaults to ~/.bot/dotbot.sock.
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Register a device and print its id and one-time secret.
    Register {
        /// Hardware fingerprint reported by the device.
        #[arg(long, default_value = "")]
        fingerprint: String,
        #[arg(long)]
        admin: bool,
    },
    /// Revoke a device.
    Revoke {
        device_id: String,
    },
    /// Create an invite token (printed exactly once).
    Invite {
        #[arg(long, default_value_t = 1)]
        max_uses: u32,
        #[arg(long, default_value = "")]
        label: String,
    },
    /// Inspect the credential vault (keys only — values never print).
    Vault {
        #[command(subcommand)]
        command: VaultCommands,
    },
}

#[derive(Debug, Subcommand)]
enum VaultCommands {
    /// List stored key names.
    List,
    /// Store a server-encrypted blob under a key.
    Set { key: String, value: String },
    /// Delete a key.
    Delete { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    init_tracing(&config);

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve { socket: None }) {
        Commands::Serve { socket } => {
            let socket = socket.unwrap_or_else(daemon::default_socket_path);
            daemon::run_daemon(config, &socket).await?;
        }
        Commands::Register { fingerprint, admin } => {
            let devices = DeviceRegistry::open(dotbot_config::bot_dir().join("devices.json"));
            let (id, secret) = devices.register(&fingerprint, admin, Utc::now())?;
            println!("device id:     {id}");
            println!("device secret: {secret}");
            println!("The secret is shown once — store it on the device now.");
        }
        Commands::Revoke { device_id } => {
            let devices = DeviceRegistry::open(dotbot_config::bot_dir().join("devices.json"));
            if devices.revoke(&device_id)? {
                println!("revoked {device_id}");
            } else {
                println!("no such device: {device_id}");
            }
        }
        Commands::Invite { max_uses, label } => {
            let invites = InviteStore::open(dotbot_config::bot_dir().join("invites.json"));
            let (token, record) = invites.create(
                InviteOptions {
                    max_uses,
                    ttl_days: config.auth.invite_days,
                    label,
                },
                Utc::now(),
            )?;
            println!("invite token: {token}");
            println!("expires:      {}", record.expires_at);
            println!("The token is shown once — only its hash is stored.");
        }
        Commands::Vault { command } => {
            let vault = CredentialVault::open(dotbot_config::vault_path());
            match command {
                VaultCommands::List => {
                    for key in vault.list()? {
                        println!("{key}");
                    }
                }
                VaultCommands::Set { key, value } => {
                    vault.set(&key, &value)?;
                    println!("stored {key}");
                }
                VaultCommands::Delete { key } => {
                    if vault.delete(&key)? {
                        println!("deleted {key}");
                    } else {
                        println!("no such key: {key}");
                    }
                }
            }
        }
    }

    Ok(())
}

/// Console logging via RUST_LOG, plus a daily-rotated file under
/// `~/.bot/logs/`.
fn init_tracing(config: &AppConfig) {
    let log_dir = dotbot_config::bot_dir().join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "dotbot.log");

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_appender),
        )
        .init();
}
