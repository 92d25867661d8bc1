use clap::Parser;
use log::{error, info};
use server::config::Args;
use server::network::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    info!(
        "Phases: pre-game {}s, game {}s, break {}s",
        config.durations.pre_game.as_secs(),
        config.durations.game.as_secs(),
        config.durations.game_break.as_secs()
    );

    let server = Server::bind(config).await?;
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down gracefully...");
        })
        .await;

    Ok(())
}
