//! Server network layer: binds the transport and runs the fixed-rate tick loop

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::host::ServerHost;
use crate::world::ServerWorld;
use log::{debug, error, info};
use shared::{NetworkHost, UdpTransport};
use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

/// Longest step the simulation takes in one tick, however late it runs.
const MAX_DELTA_TIME: f32 = 1.0 / 20.0;

/// Main server coordinating networking and game simulation
pub struct Server {
    host: ServerHost,
    network: NetworkHost<UdpTransport>,
    tick_duration: Duration,
}

impl Server {
    /// Loads the registry, binds the socket and prepares an empty world.
    ///
    /// Fails if the configuration is invalid, the registry cannot be loaded
    /// or the address cannot be bound.
    pub async fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let registry = config.load_registry()?;
        info!("Loaded {} voxel types", registry.len());

        let transport = UdpTransport::bind(config.address())
            .await?
            .with_timeout(config.timeout());
        info!("Server listening on {}", transport.local_addr());

        let world = ServerWorld::new(registry, config.seed);
        let host = ServerHost::new(config.max_connections, world, config.snapshot_interval);

        Ok(Server {
            host,
            network: NetworkHost::new(transport, config.max_packets_per_tick),
            tick_duration: config.tick_duration(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.network.transport().local_addr()
    }

    pub fn host(&self) -> &ServerHost {
        &self.host
    }

    /// One simulation step: drain the network, simulate, send.
    pub fn tick(&mut self, dt: f32) {
        self.network.pump(&mut self.host);
        self.host.update(dt.min(MAX_DELTA_TIME));
        self.network.flush(&mut self.host);
    }

    /// Runs until Ctrl+C.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down");
        })
        .await
    }

    /// Runs the tick loop until `shutdown` completes.
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) -> Result<(), ServerError> {
        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();
        tokio::pin!(shutdown);

        info!("Server started successfully");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;

                    self.tick(dt);

                    // Periodic performance monitoring
                    let tick = self.host.game().tick;
                    if tick % 60 == 0 && !self.host.clients().is_empty() {
                        debug!(
                            "Tick {}: {} clients, {} alive, {} chunks loaded, {:.1}Hz",
                            tick,
                            self.host.clients().len(),
                            self.host.game().alive_count(),
                            self.host.world().loaded_chunks(),
                            1.0 / dt.max(f32::EPSILON)
                        );
                    }
                },
            }
        }

        info!("Server shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::{decode, encode, ConnectRequest, ConnectRequestResult};
    use shared::{Channel, Transport, TransportEvent};
    use tokio_test::assert_ok;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            max_connections: 2,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            port: taken.local_addr().unwrap().port(),
            ..test_config()
        };
        assert!(matches!(
            Server::new(&config).await,
            Err(ServerError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_reported() {
        let config = ServerConfig {
            tick_rate: 0,
            ..test_config()
        };
        assert!(matches!(Server::new(&config).await, Err(ServerError::Config(_))));

        let config = ServerConfig {
            timeout_secs: 0,
            ..test_config()
        };
        assert!(matches!(Server::new(&config).await, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_over_udp() {
        let mut server = Server::new(&test_config()).await.unwrap();
        let server_addr = server.local_addr();

        let mut client = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        client.send(server_addr, Channel::Reliable, &encode(&ConnectRequest).unwrap());

        let mut result = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            server.tick(0.01);
            for event in client.poll(64) {
                if let TransportEvent::Receive(_, packet) = event {
                    if let Ok(reply) = decode::<ConnectRequestResult>(&packet) {
                        result = Some(reply);
                    }
                }
            }
            if result.is_some() {
                break;
            }
        }

        assert_eq!(
            result,
            Some(ConnectRequestResult::Success {
                client_id: 0,
                max_connections: 2
            })
        );
        assert_eq!(server.host().clients().len(), 1);
    }

    #[tokio::test]
    async fn test_run_until_stops() {
        let mut server = Server::new(&test_config()).await.unwrap();
        let result = server
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await;
        assert_ok!(result);
        assert!(server.host().game().tick > 0);
    }
}
