//! Fixed-capacity session slot table for the multiplayer server
//!
//! This module tracks which connection owns which slot:
//! - Slot allocation on connect and release on disconnect or timeout
//! - Duplicate endpoint detection so a repeated connect never takes a second slot
//! - Per-session input, protocol violation counts and chunk bookkeeping
//!
//! The table is sized once at startup. Slots are never created or destroyed
//! afterwards, only bound to and released from connections, and slot `i`
//! always drives entity `i` of the simulation arena.

use log::{debug, info};
use shared::{ChunkPosition, ClientId, InputFlags};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Protocol errors tolerated from one session before it is disconnected.
pub const MAX_PROTOCOL_VIOLATIONS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connected,
}

/// Connection state held in one slot
///
/// A released session keeps its entity index but loses everything that
/// belonged to the previous occupant.
#[derive(Debug, Clone)]
pub struct Session {
    /// Endpoint the session was opened from; `None` while disconnected
    pub addr: Option<SocketAddr>,
    pub status: SessionStatus,
    /// Movement keys from the most recent `PlayerInput`
    pub input: InputFlags,
    /// Index of the session's entity in the simulation arena
    pub entity: usize,
    /// Protocol errors seen from this session so far
    pub violations: u32,
    /// Chunks already sent in full to this session
    pub sent_chunks: HashSet<ChunkPosition>,
}

impl Session {
    fn new(entity: usize) -> Self {
        Self {
            addr: None,
            status: SessionStatus::Disconnected,
            input: InputFlags::empty(),
            entity,
            violations: 0,
            sent_chunks: HashSet::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    fn reset(&mut self) {
        *self = Session::new(self.entity);
    }
}

/// Owns every session slot of the server
pub struct ClientManager {
    sessions: Vec<Session>,
    connected: usize,
}

impl ClientManager {
    /// Creates a table with `capacity` empty slots
    pub fn new(capacity: u8) -> Self {
        Self {
            sessions: (0..capacity as usize).map(Session::new).collect(),
            connected: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.sessions.len()
    }

    /// Returns the number of connected sessions
    pub fn len(&self) -> usize {
        self.connected
    }

    pub fn is_empty(&self) -> bool {
        self.connected == 0
    }

    pub fn is_full(&self) -> bool {
        self.connected >= self.sessions.len()
    }

    /// First disconnected slot in index order
    ///
    /// Linear in the capacity, which is bounded by the width of `ClientId`.
    pub fn find_empty_slot(&self) -> Option<ClientId> {
        self.sessions
            .iter()
            .position(|session| !session.is_connected())
            .map(|index| index as ClientId)
    }

    /// Finds the connected session opened from `addr`
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<ClientId> {
        self.sessions
            .iter()
            .position(|session| session.is_connected() && session.addr == Some(addr))
            .map(|index| index as ClientId)
    }

    /// Binds slot `client_id` to `addr`
    ///
    /// Returns `None` without changing anything if the slot does not exist
    /// or is already connected.
    pub fn occupy(&mut self, client_id: ClientId, addr: SocketAddr) -> Option<&mut Session> {
        let session = self.sessions.get_mut(client_id as usize)?;
        if session.is_connected() {
            return None;
        }

        session.reset();
        session.addr = Some(addr);
        session.status = SessionStatus::Connected;
        self.connected += 1;

        info!("Client {} connected from {}", client_id, addr);
        Some(session)
    }

    /// Releases slot `client_id`
    ///
    /// Returns the endpoint it was bound to, or `None` if the slot was not
    /// connected. Releasing twice is harmless.
    pub fn release(&mut self, client_id: ClientId) -> Option<SocketAddr> {
        let session = self.sessions.get_mut(client_id as usize)?;
        if !session.is_connected() {
            return None;
        }

        let addr = session.addr;
        session.reset();
        self.connected -= 1;

        info!("Client {} disconnected", client_id);
        addr
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Session> {
        self.sessions.get(client_id as usize)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut Session> {
        self.sessions.get_mut(client_id as usize)
    }

    /// Endpoint of a connected session; disconnected slots have none, so
    /// nothing is ever sent to the previous occupant of a reused slot.
    pub fn addr_of(&self, client_id: ClientId) -> Option<SocketAddr> {
        self.get(client_id)
            .filter(|session| session.is_connected())
            .and_then(|session| session.addr)
    }

    /// Whether `client_id` is connected from exactly `addr`
    pub fn owns(&self, client_id: ClientId, addr: SocketAddr) -> bool {
        self.addr_of(client_id) == Some(addr)
    }

    /// Connected sessions in slot order
    pub fn connected(&self) -> impl Iterator<Item = (ClientId, &Session)> {
        self.sessions
            .iter()
            .enumerate()
            .filter(|(_, session)| session.is_connected())
            .map(|(index, session)| (index as ClientId, session))
    }

    /// Ids and endpoints of connected sessions, optionally skipping one
    pub fn connected_addrs(&self, except: Option<ClientId>) -> Vec<(ClientId, SocketAddr)> {
        self.connected()
            .filter(|(id, _)| Some(*id) != except)
            .filter_map(|(id, session)| session.addr.map(|addr| (id, addr)))
            .collect()
    }

    pub fn set_input(&mut self, client_id: ClientId, input: InputFlags) -> bool {
        match self.sessions.get_mut(client_id as usize) {
            Some(session) if session.is_connected() => {
                session.input = input;
                true
            }
            _ => false,
        }
    }

    /// Counts a protocol error against the session at `addr`
    ///
    /// Returns the session id and whether it has now exceeded
    /// [`MAX_PROTOCOL_VIOLATIONS`]. Errors from endpoints without a session
    /// are not tracked.
    pub fn record_violation(&mut self, addr: SocketAddr) -> Option<(ClientId, bool)> {
        let client_id = self.find_by_addr(addr)?;
        let session = &mut self.sessions[client_id as usize];
        session.violations += 1;
        debug!(
            "Client {} protocol violation {}/{}",
            client_id, session.violations, MAX_PROTOCOL_VIOLATIONS
        );
        Some((client_id, session.violations > MAX_PROTOCOL_VIOLATIONS))
    }
}
