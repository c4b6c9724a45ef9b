use std::{
    path::PathBuf,
    sync::Arc,
};

use clap::{
    Parser,
    Subcommand,
};
use color_eyre::eyre::Error;
use geolink_server::{
    Gateway,
    GatewayConfig,
    InMemoryDirectory,
    PositionPipeline,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "geolink", about = "Multi-protocol GPS/telematics ingestion gateway")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Path to a JSON config file. Defaults apply when omitted.
        #[arg(long, env = "GEOLINK_CONFIG")]
        config: Option<PathBuf>,

        /// Known device, as `unique-id` or `unique-id:model`. Repeatable.
        #[arg(long = "device")]
        devices: Vec<String>,

        /// Create directory records for unknown devices on the fly.
        #[arg(long)]
        auto_register: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Command::Serve {
            config,
            devices,
            auto_register,
        } => {
            let mut config: GatewayConfig = match config {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => GatewayConfig::default(),
            };
            config.auto_register |= auto_register;

            let directory = Arc::new(InMemoryDirectory::new());
            for entry in &devices {
                let (unique_id, model) = match entry.split_once(':') {
                    Some((unique_id, model)) => (unique_id, Some(model.to_owned())),
                    None => (entry.as_str(), None),
                };
                let info = directory.add(unique_id, model);
                tracing::info!(unique_id, device_id = info.id, "registered device");
            }

            let (pipeline, mut positions) = PositionPipeline::new(config.pipeline_queue);

            // stand-in consumer: print normalized positions as json lines
            tokio::spawn(async move {
                while let Some(position) = positions.recv().await {
                    match serde_json::to_string(&position) {
                        Ok(json) => println!("{json}"),
                        Err(error) => tracing::error!(?error, "failed to serialize position"),
                    }
                }
            });

            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("shutting down");
                    shutdown.cancel();
                }
            });

            let gateway = Gateway::new(config, directory, pipeline).with_shutdown(shutdown);
            gateway.serve().await?;
        }
    }

    Ok(())
}
