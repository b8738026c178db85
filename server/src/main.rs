use clap::Parser;
use directory_server::config::DirectoryConfig;
use directory_server::directory::GameDirectory;
use directory_server::feedback::LoadFeedbackAggregator;
use directory_server::fleet::{LoggingBalancer, ServerFleetRegistry};
use directory_server::network::{Components, Server};
use directory_server::presence::PresenceDirectory;
use env_logger::Env;
use log::{error, info};
use std::sync::Arc;

/// Parses the configuration, starts every directory component and serves the
/// UDP intake until it stops or Ctrl+C is received.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = DirectoryConfig::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(config.log_level.as_str()))
        .init();

    info!("Starting fleet directory on {}", config.bind_address());
    if config.prediction {
        info!(
            "Load prediction enabled (window {}, horizon {})",
            config.prediction_window, config.prediction_horizon
        );
    }

    let directory = GameDirectory::spawn(&config);
    let feedback = LoadFeedbackAggregator::spawn(&config);
    let registry = ServerFleetRegistry::spawn(
        &config,
        directory.clone(),
        feedback.clone(),
        Arc::new(LoggingBalancer),
    );
    let presence = PresenceDirectory::spawn(&config, directory, feedback.clone());

    let mut server = Server::new(
        &config,
        Components {
            registry,
            presence,
            feedback,
        },
    )
    .await?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Directory intake failed: {}", e);
        }
    });

    tokio::select! {
        result = server_handle => {
            if let Err(e) = result {
                error!("Intake task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
