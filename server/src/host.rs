//! Server reaction to transport events and client commands
//!
//! [`ServerHost`] owns the slot table, the entity arena and the world. It is
//! driven by a [`shared::NetworkHost`] and never touches a socket; everything
//! it wants to send goes through its [`Outbox`].

use crate::client_manager::{ClientManager, MAX_PROTOCOL_VIOLATIONS};
use crate::game::GameState;
use crate::world::ServerWorld;
use glam::Vec3;
use log::{debug, info, warn};
use shared::protocol::{
    encode, ChunkData, ChunkRequest, ConnectRequest, ConnectRequestResult, DisconnectRequest,
    GameRegistryData, PlayerInput, PlayerJoin, PlayerLeave, PlayerSkin, SkinUpload, SpawnPoint,
    VoxelEditRequest, MAX_CHUNKS_PER_REQUEST, MAX_SKIN_BYTES,
};
use shared::transport::command_name;
use shared::{
    Channel, ClientCommand, ClientId, CommandDispatcher, NetworkHandler, Outbox, Payload,
    ProtocolError,
};
use std::net::SocketAddr;
use std::sync::Arc;

type ServerDispatcher = CommandDispatcher<ServerHost, ClientCommand, SocketAddr>;

pub struct ServerHost {
    clients: ClientManager,
    game: GameState,
    world: ServerWorld,
    outbox: Outbox,
    dispatcher: Arc<ServerDispatcher>,
    spawn: Vec3,
    snapshot_interval: u32,
}

impl ServerHost {
    pub fn new(max_connections: u8, world: ServerWorld, snapshot_interval: u32) -> Self {
        let dispatcher = ServerDispatcher::new()
            .register(Self::on_connect)
            .register(Self::on_disconnect)
            .register(Self::on_player_input)
            .register(Self::on_voxel_edit)
            .register(Self::on_player_skin)
            .register(Self::on_chunk_request);

        Self {
            clients: ClientManager::new(max_connections),
            game: GameState::new(max_connections as usize),
            spawn: world.spawn_point(),
            world,
            outbox: Outbox::new(),
            dispatcher: Arc::new(dispatcher),
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn game(&self) -> &GameState {
        &self.game
    }

    pub fn world(&self) -> &ServerWorld {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut ServerWorld {
        &mut self.world
    }

    pub fn spawn_point(&self) -> Vec3 {
        self.spawn
    }

    /// Sends to one session. Disconnected slots are skipped.
    fn send_to<P: Payload>(&mut self, client_id: ClientId, channel: Channel, payload: &P) {
        if let Some(addr) = self.clients.addr_of(client_id) {
            self.outbox.send(addr, channel, payload);
        }
    }

    /// Sends to every connected session except `except`.
    fn broadcast<P: Payload>(&mut self, channel: Channel, payload: &P, except: Option<ClientId>) {
        let recipients = self.clients.connected_addrs(except);
        if recipients.is_empty() {
            return;
        }
        let bytes = match encode(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {:?} broadcast: {}", P::COMMAND, e);
                return;
            }
        };
        for (_, addr) in recipients {
            self.outbox.send_bytes(addr, channel, bytes.clone());
        }
    }

    /// Admits a new connection from `addr`.
    ///
    /// A repeated connect from an endpoint that already owns a slot is
    /// ignored. When every slot is taken the requester gets `GameFull` and
    /// nothing else changes. Otherwise the slot, its entity and every reply
    /// are set up before this returns, so no tick ever observes a half
    /// connected slot.
    pub fn handle_incoming_connection(&mut self, addr: SocketAddr) -> Option<ClientId> {
        if let Some(existing) = self.clients.find_by_addr(addr) {
            debug!("Ignoring repeated connect from {} (client {})", addr, existing);
            return None;
        }

        let Some(client_id) = self.clients.find_empty_slot() else {
            info!("Rejecting connection from {}: server full", addr);
            self.outbox
                .send(addr, Channel::Reliable, &ConnectRequestResult::GameFull);
            return None;
        };

        let entity = self.clients.occupy(client_id, addr)?.entity;
        self.game.spawn(entity, self.spawn);

        let result = ConnectRequestResult::Success {
            client_id,
            max_connections: self.clients.capacity() as u8,
        };
        let registry = GameRegistryData {
            voxels: self.world.registry().definitions().to_vec(),
        };
        let spawn = SpawnPoint {
            position: self.spawn,
        };
        self.send_to(client_id, Channel::Reliable, &result);
        self.send_to(client_id, Channel::Reliable, &registry);
        self.send_to(client_id, Channel::Reliable, &spawn);

        // Bring the newcomer up to date on everyone already here.
        for (other, _) in self.clients.connected_addrs(Some(client_id)) {
            self.send_to(client_id, Channel::Reliable, &PlayerJoin { client_id: other });
            let skin = self
                .clients
                .get(other)
                .and_then(|session| self.game.entity(session.entity))
                .and_then(|entity| entity.skin.clone());
            if let Some(skin) = skin {
                self.send_to(
                    client_id,
                    Channel::Reliable,
                    &PlayerSkin {
                        client_id: other,
                        skin,
                    },
                );
            }
        }

        self.broadcast(Channel::Reliable, &PlayerJoin { client_id }, Some(client_id));
        Some(client_id)
    }

    /// Releases slot `client_id` and tells everyone else it left.
    /// Disconnecting a slot that is not connected does nothing.
    pub fn handle_disconnect(&mut self, client_id: ClientId) -> bool {
        let Some(entity) = self.clients.get(client_id).map(|session| session.entity) else {
            return false;
        };
        if self.clients.release(client_id).is_none() {
            return false;
        }
        self.game.despawn(entity);
        self.broadcast(Channel::Reliable, &PlayerLeave { client_id }, None);
        true
    }

    /// Counts a protocol error against the sender and drops it once it has
    /// misbehaved too often.
    fn protocol_violation(&mut self, addr: SocketAddr, command: &str, error: &ProtocolError) {
        warn!("Dropping {} packet from {}: {}", command, addr, error);
        if let Some((client_id, exceeded)) = self.clients.record_violation(addr) {
            if exceeded {
                warn!(
                    "Client {} exceeded {} protocol violations, disconnecting",
                    client_id, MAX_PROTOCOL_VIOLATIONS
                );
                self.handle_disconnect(client_id);
                self.outbox.disconnect(addr);
            }
        }
    }

    fn on_connect(&mut self, addr: SocketAddr, _: ConnectRequest) {
        self.handle_incoming_connection(addr);
    }

    fn on_disconnect(&mut self, addr: SocketAddr, request: DisconnectRequest) {
        if self.clients.owns(request.client_id, addr) {
            self.handle_disconnect(request.client_id);
        } else {
            debug!("Ignoring disconnect for client {} from {}", request.client_id, addr);
        }
    }

    fn on_player_input(&mut self, addr: SocketAddr, input: PlayerInput) {
        if !self.clients.owns(input.client_id, addr) {
            debug!("Ignoring input for client {} from {}", input.client_id, addr);
            return;
        }
        if !input.rotation_x.is_finite() || !input.rotation_y.is_finite() {
            self.protocol_violation(addr, "PlayerInput", &ProtocolError::InvalidField("rotation"));
            return;
        }

        self.clients.set_input(input.client_id, input.input);
        if let Some(entity) = self.clients.get(input.client_id).map(|s| s.entity) {
            self.game
                .set_rotation(entity, input.rotation_x, input.rotation_y);
        }
    }

    fn on_voxel_edit(&mut self, addr: SocketAddr, request: VoxelEditRequest) {
        let Some(client_id) = self.clients.find_by_addr(addr) else {
            return;
        };
        match self.world.apply_edit(&request) {
            Some(update) => debug!(
                "Client {} set {:?} to {}",
                client_id, update.position, update.voxel
            ),
            None => debug!(
                "Rejected edit from client {}: {:?} -> {}",
                client_id, request.position, request.voxel
            ),
        }
    }

    fn on_player_skin(&mut self, addr: SocketAddr, upload: SkinUpload) {
        if !self.clients.owns(upload.client_id, addr) {
            return;
        }
        if upload.skin.len() > MAX_SKIN_BYTES {
            self.protocol_violation(addr, "PlayerSkin", &ProtocolError::InvalidField("skin"));
            return;
        }

        let client_id = upload.client_id;
        if let Some(entity) = self
            .clients
            .get(client_id)
            .map(|session| session.entity)
            .and_then(|index| self.game.entity_mut(index))
        {
            entity.skin = Some(upload.skin.clone());
        }
        self.broadcast(
            Channel::Reliable,
            &PlayerSkin {
                client_id,
                skin: upload.skin,
            },
            Some(client_id),
        );
    }

    fn on_chunk_request(&mut self, addr: SocketAddr, request: ChunkRequest) {
        let Some(client_id) = self.clients.find_by_addr(addr) else {
            return;
        };

        for position in request.positions.into_iter().take(MAX_CHUNKS_PER_REQUEST) {
            let already_sent = self
                .clients
                .get(client_id)
                .map_or(true, |session| session.sent_chunks.contains(&position));
            if already_sent {
                continue;
            }
            let Some(data) = self.world.chunk_data(position) else {
                continue;
            };
            self.send_chunk(client_id, data);
        }
    }

    fn send_chunk(&mut self, client_id: ClientId, data: ChunkData) {
        if let Some(session) = self.clients.get_mut(client_id) {
            session.sent_chunks.insert(data.position);
        }
        self.send_to(client_id, Channel::Reliable, &data);
    }

    /// Advances the simulation by one tick.
    ///
    /// Inputs received so far are applied to their entities, then a snapshot
    /// goes out every `snapshot_interval` ticks and accepted voxel edits are
    /// broadcast in the order they were applied.
    pub fn update(&mut self, dt: f32) {
        for (_, session) in self.clients.connected() {
            self.game.apply_input(session.entity, session.input, dt);
        }
        self.game.advance();

        if self.game.tick % self.snapshot_interval == 0 && !self.clients.is_empty() {
            let snapshot = self.game.snapshot();
            self.broadcast(Channel::Unreliable, &snapshot, None);
        }

        for update in self.world.take_voxel_updates() {
            self.broadcast(Channel::Reliable, &update, None);
        }
    }
}

impl NetworkHandler for ServerHost {
    fn on_peer_connect(&mut self, peer: SocketAddr) {
        debug!("Transport connection from {}", peer);
    }

    fn on_peer_disconnect(&mut self, peer: SocketAddr) {
        if let Some(client_id) = self.clients.find_by_addr(peer) {
            info!("Client {} dropped its connection", client_id);
            self.handle_disconnect(client_id);
        }
    }

    fn on_peer_timeout(&mut self, peer: SocketAddr) {
        if let Some(client_id) = self.clients.find_by_addr(peer) {
            info!("Client {} timed out", client_id);
            self.handle_disconnect(client_id);
        }
    }

    fn on_command_receive(&mut self, peer: SocketAddr, packet: &[u8]) {
        let dispatcher = Arc::clone(&self.dispatcher);
        if let Err(e) = dispatcher.dispatch(self, peer, packet) {
            let command = command_name::<ClientCommand>(packet);
            self.protocol_violation(peer, &command, &e);
        }
    }

    fn outbox(&mut self) -> &mut Outbox {
        &mut self.outbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::{decode, peek_command, Snapshot, MAX_PACKET_SIZE};
    use shared::transport::Outgoing;
    use shared::{InputFlags, ServerCommand, VoxelPosition, VoxelRegistry, VoxelUpdate};

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn host(capacity: u8) -> ServerHost {
        ServerHost::new(
            capacity,
            ServerWorld::new(VoxelRegistry::with_default_voxels(), 7),
            1,
        )
    }

    fn receive<P: Payload>(host: &mut ServerHost, addr: SocketAddr, payload: &P) {
        host.on_command_receive(addr, &encode(payload).unwrap());
    }

    /// Commands queued for `addr`, draining the outbox.
    fn sent_to(host: &mut ServerHost, addr: SocketAddr) -> Vec<Vec<u8>> {
        let packets = host.outbox.packets_to(addr).map(<[u8]>::to_vec).collect();
        host.outbox.drain();
        packets
    }

    fn commands(packets: &[Vec<u8>]) -> Vec<ServerCommand> {
        packets
            .iter()
            .map(|packet| peek_command::<ServerCommand>(packet).unwrap())
            .collect()
    }

    #[test]
    fn test_connect_replies_in_order() {
        let mut host = host(2);
        receive(&mut host, test_addr(1), &ConnectRequest);

        let packets = sent_to(&mut host, test_addr(1));
        assert_eq!(
            commands(&packets),
            vec![
                ServerCommand::ConnectRequestResult,
                ServerCommand::GameRegistryData,
                ServerCommand::SpawnPoint
            ]
        );
        let result: ConnectRequestResult = decode(&packets[0]).unwrap();
        assert_eq!(
            result,
            ConnectRequestResult::Success {
                client_id: 0,
                max_connections: 2
            }
        );
        assert_eq!(host.game().alive_count(), 1);
        assert_eq!(
            host.game().entity(0).unwrap().position,
            host.spawn_point()
        );
    }

    #[test]
    fn test_duplicate_connect_is_noop() {
        let mut host = host(2);
        receive(&mut host, test_addr(1), &ConnectRequest);
        host.outbox.drain();

        receive(&mut host, test_addr(1), &ConnectRequest);
        assert!(host.outbox.is_empty());
        assert_eq!(host.clients().len(), 1);
        assert_eq!(host.game().alive_count(), 1);
    }

    #[test]
    fn test_game_full_changes_nothing() {
        let mut host = host(1);
        receive(&mut host, test_addr(1), &ConnectRequest);
        host.outbox.drain();

        receive(&mut host, test_addr(2), &ConnectRequest);
        let packets = sent_to(&mut host, test_addr(2));
        assert_eq!(packets.len(), 1);
        let result: ConnectRequestResult = decode(&packets[0]).unwrap();
        assert_eq!(result, ConnectRequestResult::GameFull);
        assert_eq!(host.clients().len(), 1);
        assert_eq!(host.clients().find_by_addr(test_addr(2)), None);
    }

    #[test]
    fn test_late_joiner_learns_existing_players_and_skins() {
        let mut host = host(3);
        receive(&mut host, test_addr(1), &ConnectRequest);
        receive(
            &mut host,
            test_addr(1),
            &SkinUpload {
                client_id: 0,
                skin: vec![7; 16],
            },
        );
        host.outbox.drain();

        receive(&mut host, test_addr(2), &ConnectRequest);
        let to_new = sent_to(&mut host, test_addr(2));
        let join: PlayerJoin = decode(&to_new[3]).unwrap();
        assert_eq!(join.client_id, 0);
        let skin: PlayerSkin = decode(&to_new[4]).unwrap();
        assert_eq!(skin.skin, vec![7; 16]);
    }

    #[test]
    fn test_join_and_leave_broadcast() {
        let mut host = host(2);
        receive(&mut host, test_addr(1), &ConnectRequest);
        host.outbox.drain();
        receive(&mut host, test_addr(2), &ConnectRequest);

        let to_first = host
            .outbox
            .packets_to(test_addr(1))
            .map(<[u8]>::to_vec)
            .collect::<Vec<_>>();
        let join: PlayerJoin = decode(&to_first[0]).unwrap();
        assert_eq!(join.client_id, 1);
        host.outbox.drain();

        receive(&mut host, test_addr(2), &DisconnectRequest { client_id: 1 });
        let to_first = sent_to(&mut host, test_addr(1));
        let leave: PlayerLeave = decode(&to_first[0]).unwrap();
        assert_eq!(leave.client_id, 1);
        assert_eq!(host.game().alive_count(), 1);
        assert_eq!(host.clients().find_empty_slot(), Some(1));
    }

    #[test]
    fn test_disconnect_for_foreign_id_is_ignored() {
        let mut host = host(2);
        receive(&mut host, test_addr(1), &ConnectRequest);
        receive(&mut host, test_addr(2), &ConnectRequest);

        receive(&mut host, test_addr(2), &DisconnectRequest { client_id: 0 });
        assert_eq!(host.clients().len(), 2);
    }

    #[test]
    fn test_reconnect_gets_fresh_entity() {
        let mut host = host(1);
        receive(&mut host, test_addr(1), &ConnectRequest);
        receive(
            &mut host,
            test_addr(1),
            &PlayerInput {
                client_id: 0,
                input: InputFlags::FORWARD,
                rotation_x: 30.0,
                rotation_y: 45.0,
            },
        );
        host.update(0.5);
        assert_ne!(host.game().entity(0).unwrap().position, host.spawn_point());

        host.on_peer_timeout(test_addr(1));
        receive(&mut host, test_addr(2), &ConnectRequest);

        let entity = host.game().entity(0).unwrap();
        assert_eq!(host.clients().addr_of(0), Some(test_addr(2)));
        assert_eq!(entity.position, host.spawn_point());
        assert_eq!(entity.rotation, Vec3::ZERO);
        assert_eq!(entity.velocity, Vec3::ZERO);
        assert!(entity.alive);
        assert!(host.clients().get(0).unwrap().input.is_empty());
    }

    #[test]
    fn test_unknown_tag_leaves_state_untouched() {
        let mut host = host(2);
        receive(&mut host, test_addr(1), &ConnectRequest);
        host.outbox.drain();

        host.on_command_receive(test_addr(1), &[0x34, 0x12, 0, 0]);
        host.on_command_receive(test_addr(1), &[9]);
        assert!(host.outbox.is_empty());
        assert_eq!(host.clients().len(), 1);
        assert_eq!(host.clients().get(0).unwrap().violations, 2);
    }

    #[test]
    fn test_repeated_violations_disconnect() {
        let mut host = host(1);
        receive(&mut host, test_addr(1), &ConnectRequest);
        host.outbox.drain();

        for _ in 0..=MAX_PROTOCOL_VIOLATIONS {
            host.on_command_receive(test_addr(1), &[0xff, 0xff]);
        }
        assert!(host.clients().is_empty());
        assert!(host
            .outbox
            .drain()
            .any(|outgoing| outgoing == Outgoing::Disconnect(test_addr(1))));
    }

    #[test]
    fn test_non_finite_rotation_rejected() {
        let mut host = host(1);
        receive(&mut host, test_addr(1), &ConnectRequest);
        receive(
            &mut host,
            test_addr(1),
            &PlayerInput {
                client_id: 0,
                input: InputFlags::FORWARD,
                rotation_x: f32::NAN,
                rotation_y: 0.0,
            },
        );
        assert!(host.clients().get(0).unwrap().input.is_empty());
        assert_eq!(host.clients().get(0).unwrap().violations, 1);
    }

    #[test]
    fn test_forward_and_back_match_forward() {
        let mut both = host(1);
        let mut forward = host(1);
        for (host, input) in [
            (&mut both, InputFlags::FORWARD | InputFlags::BACK),
            (&mut forward, InputFlags::FORWARD),
        ] {
            receive(host, test_addr(1), &ConnectRequest);
            receive(
                host,
                test_addr(1),
                &PlayerInput {
                    client_id: 0,
                    input,
                    rotation_x: 0.0,
                    rotation_y: 15.0,
                },
            );
            host.update(1.0 / 30.0);
        }
        assert_eq!(
            both.game().entity(0).unwrap().position,
            forward.game().entity(0).unwrap().position
        );
    }

    #[test]
    fn test_update_broadcasts_snapshot_and_edits() {
        let mut host = host(2);
        receive(&mut host, test_addr(1), &ConnectRequest);
        let edit = VoxelEditRequest {
            position: VoxelPosition::new(3, 50, 3),
            voxel: 1,
        };
        receive(&mut host, test_addr(1), &edit);
        host.outbox.drain();

        host.update(1.0 / 30.0);
        let packets = sent_to(&mut host, test_addr(1));
        assert_eq!(
            commands(&packets),
            vec![ServerCommand::Snapshot, ServerCommand::VoxelUpdate]
        );
        let snapshot: Snapshot = decode(&packets[0]).unwrap();
        assert_eq!(snapshot.tick, 1);
        assert_eq!(snapshot.entities.len(), 1);
        let update: VoxelUpdate = decode(&packets[1]).unwrap();
        assert_eq!(update.position, edit.position);
    }

    #[test]
    fn test_invalid_edit_not_broadcast() {
        let mut host = host(1);
        receive(&mut host, test_addr(1), &ConnectRequest);
        receive(
            &mut host,
            test_addr(1),
            &VoxelEditRequest {
                position: VoxelPosition::new(0, 10_000, 0),
                voxel: 1,
            },
        );
        host.outbox.drain();
        host.update(1.0 / 30.0);

        let packets = sent_to(&mut host, test_addr(1));
        assert_eq!(commands(&packets), vec![ServerCommand::Snapshot]);
    }

    #[test]
    fn test_chunks_sent_once_per_session() {
        let mut host = host(1);
        receive(&mut host, test_addr(1), &ConnectRequest);
        host.outbox.drain();

        let request = ChunkRequest {
            positions: vec![
                shared::ChunkPosition::new(0, 1, 0),
                shared::ChunkPosition::new(0, -5, 0),
            ],
        };
        receive(&mut host, test_addr(1), &request);
        let packets = sent_to(&mut host, test_addr(1));
        assert_eq!(packets.len(), 1);
        assert!(packets[0].len() < MAX_PACKET_SIZE);
        let data: ChunkData = decode(&packets[0]).unwrap();
        assert_eq!(data.position, shared::ChunkPosition::new(0, 1, 0));

        receive(&mut host, test_addr(1), &request);
        assert!(host.outbox.is_empty());
    }

    #[test]
    fn test_oversized_skin_rejected() {
        let mut host = host(2);
        receive(&mut host, test_addr(1), &ConnectRequest);
        receive(&mut host, test_addr(2), &ConnectRequest);
        host.outbox.drain();

        receive(
            &mut host,
            test_addr(1),
            &SkinUpload {
                client_id: 0,
                skin: vec![0; MAX_SKIN_BYTES + 1],
            },
        );
        assert!(host.outbox.is_empty());
        assert!(host.game().entity(0).unwrap().skin.is_none());
    }
}
