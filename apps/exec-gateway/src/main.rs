use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use exec_gateway::{config::Config, serve};

#[derive(Parser)]
#[command(name = "exec-gateway", version, about = "Ticket-authorized exec socket gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve with configuration from the environment (default).
    Serve,
    /// Serve with a fixed development ticket secret when none is set.
    Dev,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => Config::from_env()?,
        Command::Dev => Config::development()?,
    };

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{},exec_gateway=debug,exec_relay=debug",
                config.log_filter
            ))
        }))
        .with_current_span(true)
        .init();

    if config.uses_development_secret {
        warn!("EXEC_TICKET_SECRET not set, using the development ticket secret");
    }

    serve(config).await
}
