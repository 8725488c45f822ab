use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::network::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = ServerConfig::parse();

    info!("Starting server...");
    info!(
        "Max connections: {}, tick rate: {}Hz, snapshot every {} ticks, seed {}",
        config.max_connections, config.tick_rate, config.snapshot_interval, config.seed
    );

    let mut server = Server::new(&config).await?;
    server.run().await?;

    Ok(())
}
