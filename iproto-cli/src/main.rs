//! iproto-cli - Command-line interface for IProto servers
//!
//! Runs one command against a server (or a configured pool) and prints the
//! result.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use iproto_client::{Client, ClientConfig, ClientError, ErrorHandler};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iproto-cli")]
#[command(about = "Command-line interface for IProto servers")]
#[command(version)]
struct Cli {
    /// Server host (overrides the configured groups)
    #[arg(long, env = "IPROTO_HOST")]
    host: Option<String>,

    /// Server port
    #[arg(short, long, env = "IPROTO_PORT")]
    port: Option<u16>,

    /// User name
    #[arg(short, long, env = "IPROTO_USER")]
    user: Option<String>,

    /// Password
    #[arg(long, env = "IPROTO_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// YAML configuration file
    #[arg(short, long, env = "IPROTO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Ping the server and print its schema version
    Ping,

    /// Evaluate an expression
    Eval {
        /// Expression to evaluate
        expr: String,

        /// Arguments as a JSON array (or @file.json)
        args: Option<String>,
    },

    /// Call a stored function
    Call {
        /// Function name
        function: String,

        /// Arguments as a JSON array (or @file.json)
        args: Option<String>,
    },

    /// Execute an SQL statement
    Sql {
        /// Statement text
        query: String,

        /// Bind parameters as a JSON array
        #[arg(short, long)]
        binds: Option<String>,
    },

    /// List spaces and their indexes
    Spaces,

    /// Watch a key and print its changes
    Watch {
        /// Key to watch
        key: String,
    },
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig, Box<dyn std::error::Error>> {
        let mut config = match self.config {
            Some(ref path) => {
                let mut config = ClientConfig::from_file(path)?;
                config.apply_env_overrides();
                config
            }
            None => ClientConfig::load()?,
        };

        if let Some(group) = config.groups.first_mut() {
            if let Some(ref host) = self.host {
                group.host = host.clone();
            }
            if let Some(port) = self.port {
                group.port = port;
            }
            if let Some(ref user) = self.user {
                group.user = user.clone();
            }
            if let Some(ref password) = self.password {
                group.password = password.clone();
            }
        }
        // the catalog is only needed for `spaces`
        config.fetch_schema = matches!(self.command, Commands::Spaces);
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.client_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Configuration error".red(), e);
            std::process::exit(1);
        }
    };

    for group in &config.groups {
        tracing::debug!("Connecting to {}:{} ({})", group.host, group.port, group.tag);
    }
    let client = Client::connect(config).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    match cli.command {
        Commands::Watch { key } => {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let errors = tx.clone();
            let on_error: ErrorHandler = Arc::new(move |e: ClientError| {
                let _ = errors.send(Err(e));
            });
            let handle = match client
                .watch_with(
                    &key,
                    move |event| {
                        let _ = tx.send(Ok(event));
                    },
                    Some(on_error),
                )
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            };

            eprintln!("{} key {}", "Watching".green(), key.cyan());
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(Ok(event)) => println!("{}", commands::format_event(&event)),
                            Some(Err(e)) => {
                                eprintln!("{}: {}", "Watch terminated".red(), e);
                                break;
                            }
                            None => break,
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{}", "Stopping watch...".dimmed());
                        if let Err(e) = handle.unwatch().await {
                            tracing::warn!("Failed to unwatch {}: {}", key, e);
                        }
                        break;
                    }
                }
            }
        }
        cmd => match commands::execute(&client, cmd).await {
            Ok(output) => println!("{}", output),
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                client.close().await;
                std::process::exit(1);
            }
        },
    }

    client.close().await;
    Ok(())
}
