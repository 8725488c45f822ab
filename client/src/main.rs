use clap::Parser;
use client::config::ClientConfig;
use client::input::{InputController, Key};
use client::network::{Client, ClientHost};
use glam::Vec3;
use log::info;
use shared::VoxelPosition;

/// Ticks between quarter turns of the scripted walk.
const TURN_EVERY: u32 = 60;

/// Ticks between scripted voxel placements.
const BUILD_EVERY: u32 = 150;

/// Walks in a square and now and then places a block above its head.
fn scripted_walk(host: &mut ClientHost, input: &mut InputController, tick: u32) {
    input.set_key(Key::Forward, true);

    if tick > 0 && tick % TURN_EVERY == 0 {
        let (pitch, yaw) = input.rotation();
        input.set_rotation(pitch, yaw + 90.0);
    }

    if tick > 0 && tick % BUILD_EVERY == 0 {
        let Some(position) = host.mirror().local_entity().map(|entity| entity.position) else {
            return;
        };
        let Some(voxel) = host.mirror().registry().id_of("glass") else {
            return;
        };
        let target = VoxelPosition::from_world(position + Vec3::Y * 2.0);
        info!("Placing glass at {:?}", target);
        host.request_edit(target, voxel);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = ClientConfig::parse();

    info!("Starting client...");
    info!("Connecting to: {}", config.server);

    let mut client = Client::new(&config).await?;
    let client_id = client.connect(config.connect_timeout()).await?;
    info!("Playing as client {}", client_id);

    let duration = config.run_duration();
    let shutdown = async move {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, disconnecting");
            }
        }
    };

    let result = client.run_until(shutdown, scripted_walk).await;
    client.disconnect().await;
    result?;

    Ok(())
}
