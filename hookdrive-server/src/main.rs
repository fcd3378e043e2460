mod config;
mod diagnostics;
mod server;

use clap::{Parser, Subcommand};
use config::Config;
use server::run_server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "hookdrive")]
#[command(about = "Virtual drive on top of chat webhook attachments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hookdrive_core=info,hookdrive_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Hookdrive server with config: {}", config);

            let cfg = Config::from_file(&config)
                .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", config, e))?;

            tracing::info!(
                "Webhooks: {}, chunk size: {}, bind: {}",
                cfg.drive.webhooks.len(),
                cfg.drive.chunk_size,
                cfg.http.bind_addr
            );

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
