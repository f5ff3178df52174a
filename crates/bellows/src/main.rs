use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bellows::Bellows;
use bellows_core::config::{BellowsConfig, LogFormat};

#[derive(Parser)]
#[command(name = "bellows", about = "Self-hosted autoscaler for ephemeral CI runners")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller.
    Run {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "/etc/bellows/config.toml")]
        config: PathBuf,
    },
}

fn init_tracing(config: &BellowsConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.observability.log_level.clone()));
    match config.observability.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => {
            let config = BellowsConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            init_tracing(&config);

            // Provider plug-ins are registered here as they are built out;
            // an empty registry still runs the control plane.
            let bellows = Bellows::builder(config).build();
            bellows.run().await?;
        }
    }
    Ok(())
}
