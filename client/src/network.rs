//! Client connection to the server
//!
//! [`ClientHost`] reacts to server commands and keeps the mirror current. It
//! only ever talks to the one server address it was created for. [`Client`]
//! wraps it with a UDP transport and the fixed-rate tick loop.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::game::ClientMirror;
use crate::input::InputController;
use glam::Vec3;
use log::{debug, error, info, warn};
use shared::protocol::{
    peek_command, ChunkData, ChunkRequest, ConnectRequest, ConnectRequestResult,
    DisconnectRequest, GameRegistryData, PlayerInput, PlayerJoin, PlayerLeave, PlayerSkin,
    SkinUpload, Snapshot, SpawnPoint, VoxelEditRequest, MAX_CHUNKS_PER_REQUEST,
};
use shared::{
    Channel, ChunkPosition, ClientId, CommandDispatcher, NetworkHandler, NetworkHost, Outbox,
    ServerCommand, UdpTransport, VoxelId, VoxelPosition, VoxelUpdate,
};
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

/// Datagrams handled per client tick.
const CLIENT_PACKET_BUDGET: usize = 1024;

/// How long a clean disconnect waits for the server to acknowledge it.
const DISCONNECT_LINGER: Duration = Duration::from_millis(300);

type ClientDispatcher = CommandDispatcher<ClientHost, ServerCommand>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected(ClientId),
    Rejected,
    Disconnected,
}

pub struct ClientHost {
    server: SocketAddr,
    state: ConnectionState,
    mirror: ClientMirror,
    outbox: Outbox,
    dispatcher: Arc<ClientDispatcher>,
    render_distance: i32,
    // Chunks asked for this session; never asked for twice
    requested: HashSet<ChunkPosition>,
    tick: u32,
}

impl ClientHost {
    pub fn new(server: SocketAddr, render_distance: i32) -> Self {
        let dispatcher = ClientDispatcher::new()
            .register(Self::on_connect_result)
            .register(Self::on_player_join)
            .register(Self::on_player_leave)
            .register(Self::on_snapshot)
            .register(Self::on_chunk_data)
            .register(Self::on_spawn_point)
            .register(Self::on_voxel_update)
            .register(Self::on_registry)
            .register(Self::on_player_skin);

        Self {
            server,
            state: ConnectionState::Disconnected,
            mirror: ClientMirror::new(),
            outbox: Outbox::new(),
            dispatcher: Arc::new(dispatcher),
            render_distance: render_distance.max(0),
            requested: HashSet::new(),
            tick: 0,
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_id(&self) -> Option<ClientId> {
        match self.state {
            ConnectionState::Connected(client_id) => Some(client_id),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client_id().is_some()
    }

    pub fn mirror(&self) -> &ClientMirror {
        &self.mirror
    }

    pub fn mirror_mut(&mut self) -> &mut ClientMirror {
        &mut self.mirror
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// Starts a new session with the server.
    pub fn connect(&mut self) {
        info!("Connecting to {}", self.server);
        self.state = ConnectionState::Connecting;
        self.mirror.reset();
        self.requested.clear();
        self.outbox
            .send(self.server, Channel::Reliable, &ConnectRequest);
    }

    /// Tells the server we are leaving. Returns whether there was a session.
    pub fn disconnect(&mut self) -> bool {
        let Some(client_id) = self.client_id() else {
            return false;
        };
        info!("Disconnecting from {}", self.server);
        self.outbox
            .send(self.server, Channel::Reliable, &DisconnectRequest { client_id });
        self.state = ConnectionState::Disconnected;
        self.mirror.reset();
        true
    }

    /// Reports held keys and look direction. The local rotation is applied
    /// right away since the server takes it as reported.
    pub fn send_input(&mut self, input: &PlayerInput) -> bool {
        if self.client_id() != Some(input.client_id) {
            return false;
        }
        if let Some(entity) = self.mirror.local_entity_mut() {
            entity.rotation = Vec3::new(input.rotation_x, input.rotation_y, 0.0);
        }
        self.outbox.send(self.server, Channel::Unreliable, input);
        true
    }

    /// Shows the edit locally and asks the server to apply it.
    pub fn request_edit(&mut self, position: VoxelPosition, voxel: VoxelId) -> bool {
        if !self.is_connected() {
            return false;
        }
        if !self.mirror.predict_edit(position, voxel, self.tick) {
            debug!("Editing {:?} outside loaded chunks, no prediction", position);
        }
        self.outbox.send(
            self.server,
            Channel::Reliable,
            &VoxelEditRequest { position, voxel },
        );
        true
    }

    pub fn upload_skin(&mut self, skin: Vec<u8>) -> bool {
        let Some(client_id) = self.client_id() else {
            return false;
        };
        self.mirror.set_skin(client_id, skin.clone());
        self.outbox
            .send(self.server, Channel::Reliable, &SkinUpload { client_id, skin });
        true
    }

    /// Asks for the nearest chunks in render distance that are neither held
    /// nor already requested. Returns how many were requested.
    pub fn stream_chunks(&mut self) -> usize {
        let Some(center) = self
            .mirror
            .local_entity()
            .map(|entity| ChunkPosition::from_world(entity.position))
        else {
            return 0;
        };

        let r = self.render_distance;
        let mut missing = Vec::new();
        for x in -r..=r {
            for y in -r..=r {
                for z in -r..=r {
                    let position = ChunkPosition::new(center.x + x, center.y + y, center.z + z);
                    if !self.mirror.chunks().has_chunk(position)
                        && !self.requested.contains(&position)
                    {
                        missing.push(position);
                    }
                }
            }
        }
        if missing.is_empty() {
            return 0;
        }

        missing.sort_by_key(|position| position.distance_squared(center));
        missing.truncate(MAX_CHUNKS_PER_REQUEST);
        self.requested.extend(missing.iter().copied());

        let count = missing.len();
        self.outbox.send(
            self.server,
            Channel::Reliable,
            &ChunkRequest { positions: missing },
        );
        count
    }

    /// Per-tick housekeeping: expires predictions and streams chunks.
    pub fn update(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        if !self.is_connected() {
            return;
        }
        let reverted = self.mirror.expire_predictions(self.tick);
        if reverted > 0 {
            debug!("{} voxel edits were never confirmed", reverted);
        }
        self.stream_chunks();
    }

    fn on_connect_result(&mut self, _: (), result: ConnectRequestResult) {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring connect result outside of a connect attempt");
            return;
        }
        match result {
            ConnectRequestResult::Success {
                client_id,
                max_connections,
            } => {
                info!(
                    "Connected as client {} ({} slots)",
                    client_id, max_connections
                );
                self.mirror.connected(client_id, max_connections);
                self.state = ConnectionState::Connected(client_id);
            }
            ConnectRequestResult::GameFull => {
                warn!("Server {} is full", self.server);
                self.state = ConnectionState::Rejected;
            }
        }
    }

    fn on_player_join(&mut self, _: (), join: PlayerJoin) {
        if self.mirror.player_join(join.client_id) {
            info!("Player {} joined", join.client_id);
        }
    }

    fn on_player_leave(&mut self, _: (), leave: PlayerLeave) {
        if self.mirror.player_leave(leave.client_id) {
            info!("Player {} left", leave.client_id);
        }
    }

    fn on_snapshot(&mut self, _: (), snapshot: Snapshot) {
        self.mirror.apply_snapshot(&snapshot);
    }

    fn on_chunk_data(&mut self, _: (), data: ChunkData) {
        if let Err(e) = self.mirror.apply_chunk_data(&data) {
            warn!("Dropping chunk {:?}: {}", data.position, e);
        }
    }

    fn on_spawn_point(&mut self, _: (), spawn: SpawnPoint) {
        debug!("Spawn point at {}", spawn.position);
        self.mirror.set_spawn(spawn.position);
    }

    fn on_voxel_update(&mut self, _: (), update: VoxelUpdate) {
        self.mirror.apply_voxel_update(update);
    }

    fn on_registry(&mut self, _: (), data: GameRegistryData) {
        let count = data.voxels.len();
        match self.mirror.set_registry(data.voxels) {
            Ok(()) => debug!("Received {} voxel definitions", count),
            Err(e) => warn!("Rejected voxel registry: {}", e),
        }
    }

    fn on_player_skin(&mut self, _: (), skin: PlayerSkin) {
        self.mirror.set_skin(skin.client_id, skin.skin);
    }

    fn lose_connection(&mut self, reason: &str) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected(_)
        ) {
            warn!("Connection to {} {}", self.server, reason);
            self.state = ConnectionState::Disconnected;
            self.mirror.reset();
        }
    }
}

impl NetworkHandler for ClientHost {
    fn on_peer_connect(&mut self, peer: SocketAddr) {
        debug!("Transport connection with {}", peer);
    }

    fn on_peer_disconnect(&mut self, peer: SocketAddr) {
        if peer == self.server {
            self.lose_connection("was reset");
        }
    }

    fn on_peer_timeout(&mut self, peer: SocketAddr) {
        if peer == self.server {
            self.lose_connection("timed out");
        }
    }

    fn on_command_receive(&mut self, peer: SocketAddr, packet: &[u8]) {
        if peer != self.server {
            debug!("Ignoring packet from unknown peer {}", peer);
            return;
        }

        // Only the connect reply means anything outside a session.
        if !self.is_connected()
            && !matches!(
                peek_command::<ServerCommand>(packet),
                Ok(ServerCommand::ConnectRequestResult)
            )
        {
            debug!("Ignoring packet outside of a session");
            return;
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        if let Err(e) = dispatcher.dispatch(self, (), packet) {
            warn!("Dropping packet from server: {}", e);
        }
    }

    fn outbox(&mut self) -> &mut Outbox {
        &mut self.outbox
    }
}

/// Headless client: a [`ClientHost`] driven over UDP at a fixed tick rate
pub struct Client {
    host: ClientHost,
    network: NetworkHost<UdpTransport>,
    input: InputController,
    skin: Option<Vec<u8>>,
    tick_duration: Duration,
}

impl Client {
    /// Binds a local socket for talking to the configured server.
    pub async fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let server = config.server_addr()?;
        let skin = config.load_skin()?;
        let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let transport = UdpTransport::bind(bind_addr).await?;
        info!("Client bound to {}", transport.local_addr());

        Ok(Client {
            host: ClientHost::new(server, config.render_distance),
            network: NetworkHost::new(transport, CLIENT_PACKET_BUDGET),
            input: InputController::new(config.mouse_sensitivity),
            skin,
            tick_duration: config.tick_duration(),
        })
    }

    pub fn host(&self) -> &ClientHost {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut ClientHost {
        &mut self.host
    }

    pub fn input_mut(&mut self) -> &mut InputController {
        &mut self.input
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.network.transport().local_addr()
    }

    /// One client step: receive, update, report input, send.
    pub fn tick(&mut self) {
        self.network.pump(&mut self.host);
        self.host.update();
        if let Some(client_id) = self.host.client_id() {
            if let Some(input) = self.input.poll(client_id) {
                self.host.send_input(&input);
            }
        }
        self.network.flush(&mut self.host);
    }

    /// Connects and waits for the server's answer. The skin, if any, is
    /// uploaded once the session is up.
    pub async fn connect(&mut self, timeout: Duration) -> Result<ClientId, ClientError> {
        self.host.connect();
        self.network.flush(&mut self.host);

        let deadline = Instant::now() + timeout;
        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            match self.host.state() {
                ConnectionState::Connected(client_id) => {
                    if let Some(skin) = self.skin.clone() {
                        self.host.upload_skin(skin);
                        self.network.flush(&mut self.host);
                    }
                    return Ok(client_id);
                }
                ConnectionState::Rejected => return Err(ClientError::Rejected),
                ConnectionState::Disconnected => return Err(ClientError::Disconnected),
                ConnectionState::Connecting => {}
            }
            if Instant::now() >= deadline {
                self.host.lose_connection("attempt gave up");
                return Err(ClientError::ConnectTimeout(timeout));
            }
            tick_interval.tick().await;
            self.network.pump(&mut self.host);
            self.network.flush(&mut self.host);
        }
    }

    /// Ticks until `shutdown` completes, calling `script` before each tick.
    ///
    /// Fails if the server drops the session.
    pub async fn run_until<F, S>(&mut self, shutdown: F, mut script: S) -> Result<(), ClientError>
    where
        F: Future<Output = ()>,
        S: FnMut(&mut ClientHost, &mut InputController, u32),
    {
        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                _ = tick_interval.tick() => {
                    let tick = self.host.tick();
                    script(&mut self.host, &mut self.input, tick);
                    self.tick();

                    if !self.host.is_connected() {
                        error!("Lost connection to server");
                        return Err(ClientError::Disconnected);
                    }

                    if tick % 300 == 0 {
                        debug!(
                            "Tick {}: {} players, {} chunks, {} pending edits",
                            tick,
                            self.host.mirror().active_entities().count(),
                            self.host.mirror().chunks().len(),
                            self.host.mirror().pending_predictions()
                        );
                    }
                },
            }
        }
        Ok(())
    }

    /// Leaves the session and gives the server a moment to acknowledge.
    pub async fn disconnect(&mut self) {
        if !self.host.disconnect() {
            return;
        }
        self.network.flush(&mut self.host);

        let deadline = Instant::now() + DISCONNECT_LINGER;
        let server = self.host.server();
        while Instant::now() < deadline
            && self.network.transport().reliability().unacked(server) > 0
        {
            sleep(Duration::from_millis(10)).await;
            self.network.pump(&mut self.host);
        }
    }
}
