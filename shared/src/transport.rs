//! Datagram transport with per-channel reliability
//!
//! Commands travel inside frames sent over UDP. Every frame starts with a
//! fixed header:
//!
//! ```text
//! +------+---------+-------------+---------------+-----------+
//! | kind | channel | salt (u32)  | sequence (u32)| payload   |
//! +------+---------+-------------+---------------+-----------+
//! ```
//!
//! Unreliable frames are handed up as they arrive. Reliable frames carry a
//! per-peer sequence number, are acknowledged by the receiver, resent until
//! acknowledged and delivered strictly in order. The salt is picked randomly
//! by each endpoint at startup; a new salt from a known address means the
//! remote process restarted, and the old peer is dropped.
//!
//! Dropping a peer on purpose sends it a reset frame. Until the peer starts
//! over from sequence 0 (or restarts), anything else it sends is answered
//! with another reset instead of being acknowledged.
//!
//! Socket I/O runs in two background tasks that only move raw datagrams
//! through channels. Everything else happens inside [`Transport::poll`], which
//! never waits, so the owner's tick stays the only place state changes.

use crate::error::TransportError;
use crate::protocol::{encode, Command, Payload, MAX_PACKET_SIZE};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Peers silent for this long are timed out.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before an unacknowledged reliable frame is sent again.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(100);

pub const FRAME_HEADER_SIZE: usize = 10;

/// How far ahead of the next expected sequence a reliable frame may arrive and
/// still be buffered.
const REORDER_WINDOW: u32 = 256;

const RECV_BUFFER_SIZE: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Fire and forget; later traffic supersedes anything lost.
    Unreliable = 0,
    /// Acknowledged, resent and delivered in order.
    Reliable = 1,
}

impl TryFrom<u8> for Channel {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Channel::Unreliable),
            1 => Ok(Channel::Reliable),
            other => Err(TransportError::UnknownChannel(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0,
    Ack = 1,
    /// The sender no longer has a connection with the receiver.
    Reset = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Ack),
            2 => Ok(FrameKind::Reset),
            other => Err(TransportError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub channel: Channel,
    pub salt: u32,
    pub sequence: u32,
}

impl FrameHeader {
    pub fn write(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.kind as u8);
        buffer.push(self.channel as u8);
        buffer.extend_from_slice(&self.salt.to_le_bytes());
        buffer.extend_from_slice(&self.sequence.to_le_bytes());
    }

    pub fn parse(datagram: &[u8]) -> Result<(FrameHeader, &[u8]), TransportError> {
        if datagram.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::Truncated(datagram.len()));
        }
        let (header, payload) = datagram.split_at(FRAME_HEADER_SIZE);
        let header = FrameHeader {
            kind: FrameKind::try_from(header[0])?,
            channel: Channel::try_from(header[1])?,
            salt: u32::from_le_bytes([header[2], header[3], header[4], header[5]]),
            sequence: u32::from_le_bytes([header[6], header[7], header[8], header[9]]),
        };
        Ok((header, payload))
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        self.write(&mut frame);
        frame.extend_from_slice(payload);
        frame
    }
}

fn ack_frame(salt: u32, sequence: u32) -> Vec<u8> {
    FrameHeader {
        kind: FrameKind::Ack,
        channel: Channel::Reliable,
        salt,
        sequence,
    }
    .frame(&[])
}

fn reset_frame(salt: u32) -> Vec<u8> {
    FrameHeader {
        kind: FrameKind::Reset,
        channel: Channel::Unreliable,
        salt,
        sequence: 0,
    }
    .frame(&[])
}

/// Connection lifecycle and data events surfaced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect(SocketAddr),
    Disconnect(SocketAddr),
    Timeout(SocketAddr),
    Receive(SocketAddr, Vec<u8>),
}

struct PendingFrame {
    frame: Vec<u8>,
    last_sent: Instant,
}

struct Peer {
    remote_salt: Option<u32>,
    last_seen: Instant,
    next_send: u32,
    unacked: BTreeMap<u32, PendingFrame>,
    next_expected: u32,
    out_of_order: BTreeMap<u32, Vec<u8>>,
}

impl Peer {
    fn new(remote_salt: Option<u32>, now: Instant) -> Self {
        Self {
            remote_salt,
            last_seen: now,
            next_send: 0,
            unacked: BTreeMap::new(),
            next_expected: 0,
            out_of_order: BTreeMap::new(),
        }
    }
}

/// Sequencing, acknowledgement and timeout bookkeeping for every peer.
///
/// Holds no socket; callers feed it datagrams and a clock and send whatever
/// frames it hands back.
pub struct Reliability {
    salt: u32,
    timeout: Duration,
    peers: HashMap<SocketAddr, Peer>,
    // Peers dropped on purpose: their salt and when they were last heard
    forgotten: HashMap<SocketAddr, (u32, Instant)>,
}

impl Reliability {
    pub fn new(salt: u32, timeout: Duration) -> Self {
        Self {
            salt,
            timeout,
            peers: HashMap::new(),
            forgotten: HashMap::new(),
        }
    }

    pub fn salt(&self) -> u32 {
        self.salt
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn knows(&self, peer: SocketAddr) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Whether `peer` was dropped and has not started over yet.
    pub fn is_forgotten(&self, peer: SocketAddr) -> bool {
        self.forgotten.contains_key(&peer)
    }

    /// Number of reliable frames to `peer` still waiting for an ack.
    pub fn unacked(&self, peer: SocketAddr) -> usize {
        self.peers.get(&peer).map_or(0, |p| p.unacked.len())
    }

    /// Wraps `payload` into a frame for `peer`. Reliable frames are retained
    /// until acknowledged.
    pub fn frame(
        &mut self,
        peer: SocketAddr,
        channel: Channel,
        payload: &[u8],
        now: Instant,
    ) -> Vec<u8> {
        let state = self
            .peers
            .entry(peer)
            .or_insert_with(|| Peer::new(None, now));

        let sequence = match channel {
            Channel::Unreliable => 0,
            Channel::Reliable => {
                let sequence = state.next_send;
                state.next_send = state.next_send.wrapping_add(1);
                sequence
            }
        };

        let frame = FrameHeader {
            kind: FrameKind::Data,
            channel,
            salt: self.salt,
            sequence,
        }
        .frame(payload);

        if channel == Channel::Reliable {
            state.unacked.insert(
                sequence,
                PendingFrame {
                    frame: frame.clone(),
                    last_sent: now,
                },
            );
        }
        frame
    }

    /// Processes one datagram from `peer`.
    ///
    /// Lifecycle and data events are appended to `events`; acknowledgements
    /// that must go back to the peer are appended to `replies`.
    pub fn receive(
        &mut self,
        peer: SocketAddr,
        datagram: &[u8],
        now: Instant,
        events: &mut Vec<TransportEvent>,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), TransportError> {
        let (header, payload) = FrameHeader::parse(datagram)?;
        let salt = self.salt;

        if header.kind == FrameKind::Reset {
            let current = self
                .peers
                .get(&peer)
                .is_some_and(|state| state.remote_salt == Some(header.salt));
            if current {
                info!("Peer {} dropped the connection", peer);
                self.peers.remove(&peer);
                events.push(TransportEvent::Disconnect(peer));
            }
            return Ok(());
        }

        if let Some((forgotten_salt, last_seen)) = self.forgotten.get_mut(&peer) {
            let restarted = header.salt != *forgotten_salt;
            let starting_over = header.kind == FrameKind::Data
                && header.channel == Channel::Reliable
                && header.sequence == 0;
            if restarted || starting_over {
                self.forgotten.remove(&peer);
            } else {
                *last_seen = now;
                replies.push(reset_frame(salt));
                return Ok(());
            }
        }

        let state = self
            .peers
            .entry(peer)
            .or_insert_with(|| Peer::new(None, now));
        match state.remote_salt {
            None => {
                state.remote_salt = Some(header.salt);
                events.push(TransportEvent::Connect(peer));
            }
            Some(salt) if salt != header.salt => {
                info!("Peer {} restarted, resetting its connection", peer);
                *state = Peer::new(Some(header.salt), now);
                events.push(TransportEvent::Disconnect(peer));
                events.push(TransportEvent::Connect(peer));
            }
            Some(_) => {}
        }
        state.last_seen = now;

        match (header.kind, header.channel) {
            (FrameKind::Ack, _) => {
                state.unacked.remove(&header.sequence);
            }
            // Handled before the peer lookup.
            (FrameKind::Reset, _) => {}
            (FrameKind::Data, Channel::Unreliable) => {
                events.push(TransportEvent::Receive(peer, payload.to_vec()));
            }
            (FrameKind::Data, Channel::Reliable) => {
                let sequence = header.sequence;
                let ahead = sequence.wrapping_sub(state.next_expected);
                if ahead > u32::MAX / 2 {
                    // Already delivered; the ack must have been lost.
                    replies.push(ack_frame(salt, sequence));
                } else if ahead == 0 {
                    events.push(TransportEvent::Receive(peer, payload.to_vec()));
                    state.next_expected = state.next_expected.wrapping_add(1);
                    while let Some(buffered) = state.out_of_order.remove(&state.next_expected) {
                        events.push(TransportEvent::Receive(peer, buffered));
                        state.next_expected = state.next_expected.wrapping_add(1);
                    }
                    replies.push(ack_frame(salt, sequence));
                } else if ahead < REORDER_WINDOW {
                    state.out_of_order.insert(sequence, payload.to_vec());
                    replies.push(ack_frame(salt, sequence));
                } else {
                    debug!("Dropping reliable frame {} from {}: outside window", sequence, peer);
                }
            }
        }
        Ok(())
    }

    /// Times out silent peers and collects reliable frames due for resending.
    pub fn service(
        &mut self,
        now: Instant,
        events: &mut Vec<TransportEvent>,
    ) -> Vec<(SocketAddr, Vec<u8>)> {
        let timeout = self.timeout;
        let timed_out: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, state)| now.saturating_duration_since(state.last_seen) > timeout)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in timed_out {
            self.peers.remove(&addr);
            events.push(TransportEvent::Timeout(addr));
        }
        self.forgotten
            .retain(|_, (_, last_seen)| now.saturating_duration_since(*last_seen) <= timeout);

        let mut resends = Vec::new();
        for (addr, state) in &mut self.peers {
            for pending in state.unacked.values_mut() {
                if now.saturating_duration_since(pending.last_sent) >= RESEND_INTERVAL {
                    pending.last_sent = now;
                    resends.push((*addr, pending.frame.clone()));
                }
            }
        }
        resends
    }

    /// Drops all state for `peer`.
    ///
    /// Returns the reset frame to send so the peer learns about it, or
    /// `None` if the peer was never heard from.
    pub fn forget(&mut self, peer: SocketAddr, now: Instant) -> Option<Vec<u8>> {
        let remote_salt = self.peers.remove(&peer)?.remote_salt?;
        self.forgotten.insert(peer, (remote_salt, now));
        Some(reset_frame(self.salt))
    }
}

/// A packet transport as seen by a host.
pub trait Transport {
    fn send(&mut self, peer: SocketAddr, channel: Channel, payload: &[u8]);

    /// Returns the events that have arrived since the last poll, handling at
    /// most `budget` inbound datagrams. Never waits.
    fn poll(&mut self, budget: usize) -> Vec<TransportEvent>;

    fn disconnect(&mut self, peer: SocketAddr);
}

/// UDP transport backed by tokio socket tasks.
pub struct UdpTransport {
    local_addr: SocketAddr,
    inbound: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    outbound: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    reliability: Reliability,
    receiver: JoinHandle<()>,
}

impl UdpTransport {
    /// Binds the socket and starts the I/O tasks. Must be called from within
    /// a tokio runtime.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let receiver = Self::spawn_receiver(Arc::clone(&socket), inbound_tx);
        Self::spawn_sender(socket, outbound_rx);

        Ok(Self {
            local_addr,
            inbound,
            outbound,
            reliability: Reliability::new(rand::random(), DEFAULT_TIMEOUT),
            receiver,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.reliability.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn reliability(&self) -> &Reliability {
        &self.reliability
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_receiver(
        socket: Arc<UdpSocket>,
        inbound: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if inbound.send((buffer[..len].to_vec(), addr)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    /// Spawns task that writes queued datagrams to the socket
    fn spawn_sender(
        socket: Arc<UdpSocket>,
        mut outbound: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    ) {
        tokio::spawn(async move {
            while let Some((datagram, addr)) = outbound.recv().await {
                if let Err(e) = socket.send_to(&datagram, addr).await {
                    error!("Failed to send datagram to {}: {}", addr, e);
                }
            }
        });
    }

    fn queue(&self, datagram: Vec<u8>, addr: SocketAddr) {
        if self.outbound.send((datagram, addr)).is_err() {
            error!("Socket sender task has stopped");
        }
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, peer: SocketAddr, channel: Channel, payload: &[u8]) {
        if payload.len() > MAX_PACKET_SIZE {
            warn!(
                "Refusing to send {} byte packet to {} (limit {})",
                payload.len(),
                peer,
                MAX_PACKET_SIZE
            );
            return;
        }
        let frame = self
            .reliability
            .frame(peer, channel, payload, Instant::now());
        self.queue(frame, peer);
    }

    fn poll(&mut self, budget: usize) -> Vec<TransportEvent> {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut replies = Vec::new();

        for _ in 0..budget {
            let Ok((datagram, addr)) = self.inbound.try_recv() else {
                break;
            };
            if let Err(e) = self
                .reliability
                .receive(addr, &datagram, now, &mut events, &mut replies)
            {
                warn!("Dropping datagram from {}: {}", addr, e);
            }
            for reply in replies.drain(..) {
                self.queue(reply, addr);
            }
        }

        for (addr, frame) in self.reliability.service(now, &mut events) {
            self.queue(frame, addr);
        }
        events
    }

    fn disconnect(&mut self, peer: SocketAddr) {
        if let Some(frame) = self.reliability.forget(peer, Instant::now()) {
            self.queue(frame, peer);
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// In-process transport: events are injected by hand and sent packets are
/// recorded instead of hitting a socket.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    pub inbound: VecDeque<TransportEvent>,
    pub sent: Vec<(SocketAddr, Channel, Vec<u8>)>,
    pub disconnected: Vec<SocketAddr>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, event: TransportEvent) {
        self.inbound.push_back(event);
    }

    pub fn take_sent(&mut self) -> Vec<(SocketAddr, Channel, Vec<u8>)> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, peer: SocketAddr, channel: Channel, payload: &[u8]) {
        self.sent.push((peer, channel, payload.to_vec()));
    }

    fn poll(&mut self, budget: usize) -> Vec<TransportEvent> {
        let count = budget.min(self.inbound.len());
        self.inbound.drain(..count).collect()
    }

    fn disconnect(&mut self, peer: SocketAddr) {
        self.disconnected.push(peer);
    }
}

/// A packet or connection drop requested by a host during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Packet {
        peer: SocketAddr,
        channel: Channel,
        bytes: Vec<u8>,
    },
    Disconnect(SocketAddr),
}

/// Packets a host produced during the current tick, flushed to the transport
/// by [`NetworkHost::flush`].
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Vec<Outgoing>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send<P: Payload>(&mut self, peer: SocketAddr, channel: Channel, payload: &P) {
        match encode(payload) {
            Ok(bytes) => self.send_bytes(peer, channel, bytes),
            Err(e) => error!("Failed to encode {:?}: {}", P::COMMAND, e),
        }
    }

    pub fn send_bytes(&mut self, peer: SocketAddr, channel: Channel, bytes: Vec<u8>) {
        self.queue.push(Outgoing::Packet {
            peer,
            channel,
            bytes,
        });
    }

    pub fn disconnect(&mut self, peer: SocketAddr) {
        self.queue.push(Outgoing::Disconnect(peer));
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Outgoing> {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Packets queued for `peer`, oldest first.
    pub fn packets_to(&self, peer: SocketAddr) -> impl Iterator<Item = &[u8]> {
        self.queue.iter().filter_map(move |outgoing| match outgoing {
            Outgoing::Packet {
                peer: to, bytes, ..
            } if *to == peer => Some(bytes.as_slice()),
            _ => None,
        })
    }
}

/// Role-specific reaction to transport events.
///
/// The client and the server each implement this once; the [`NetworkHost`]
/// drives it without knowing which role it is talking to.
pub trait NetworkHandler {
    fn on_peer_connect(&mut self, peer: SocketAddr);

    fn on_peer_disconnect(&mut self, peer: SocketAddr);

    fn on_peer_timeout(&mut self, peer: SocketAddr);

    fn on_command_receive(&mut self, peer: SocketAddr, packet: &[u8]);

    fn outbox(&mut self) -> &mut Outbox;
}

/// Moves events from a transport into a handler and the handler's outbox back
/// into the transport.
pub struct NetworkHost<T> {
    transport: T,
    packet_budget: usize,
}

impl<T: Transport> NetworkHost<T> {
    pub fn new(transport: T, packet_budget: usize) -> Self {
        Self {
            transport,
            packet_budget,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Delivers at most `packet_budget` queued events to `handler`, then
    /// flushes what the handler queued in response. Returns the number of
    /// events handled.
    pub fn pump<H: NetworkHandler>(&mut self, handler: &mut H) -> usize {
        let events = self.transport.poll(self.packet_budget);
        let handled = events.len();

        for event in events {
            match event {
                TransportEvent::Connect(peer) => handler.on_peer_connect(peer),
                TransportEvent::Disconnect(peer) => handler.on_peer_disconnect(peer),
                TransportEvent::Timeout(peer) => handler.on_peer_timeout(peer),
                TransportEvent::Receive(peer, packet) => handler.on_command_receive(peer, &packet),
            }
        }

        self.flush(handler);
        handled
    }

    /// Hands everything in the handler's outbox to the transport.
    pub fn flush<H: NetworkHandler>(&mut self, handler: &mut H) -> usize {
        let mut count = 0;
        for outgoing in handler.outbox().drain() {
            match outgoing {
                Outgoing::Packet {
                    peer,
                    channel,
                    bytes,
                } => self.transport.send(peer, channel, &bytes),
                Outgoing::Disconnect(peer) => self.transport.disconnect(peer),
            }
            count += 1;
        }
        count
    }
}

/// Name of a command for log lines.
pub fn command_name<C: Command>(packet: &[u8]) -> String {
    match crate::protocol::peek_command::<C>(packet) {
        Ok(command) => format!("{:?}", command),
        Err(_) => "<unknown>".to_string(),
    }
}
