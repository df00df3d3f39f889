//! # Swarm
//!
//! The central dispatcher: one [`Swarm`] is one peer. It owns every
//! connection, the GossipSub engine, the timer registry and the two FIFO
//! queues the host drains — [`Action`]s describing effects to carry out
//! and [`Event`]s describing what the core observed.
//!
//! ```text
//! host inputs                     host outputs
//! ───────────►  ┌─────────────┐  ────────────►
//! on_data_…     │    Swarm    │  poll() → Actions
//! on_timer      │ connections │  drain_events() → Events
//! on_conn_…     │  gossipsub  │
//! dial/publish  └─────────────┘
//! ```
//!
//! ## Connection Pipeline
//!
//! Inbound bytes flow `raw → noise → records → substreams → multistream →
//! protocol handler`; outbound is the inverse. A connection passes through
//! the phases `RawNegotiating` (security protocol selection), `Handshaking`
//! (Noise XX), `Secured` (application substreams live) and `Closed`. No
//! application bytes are emitted before `Secured`.
//!
//! ## Substreams
//!
//! After securing, each record's plaintext is `u32-be substream id ||
//! payload`. The connection initiator allocates odd ids, the responder
//! even ids, and each side opens its own ping, identify and gossipsub
//! substreams (running the multistream dialer on those and the listener on
//! the peer's).
//!
//! ## Determinism
//!
//! All randomness flows from the seed given at construction and the maps
//! are ordered, so a seeded swarm driven with the same inputs produces the
//! same actions, byte for byte. The host never re-enters the core from a
//! callback; every method returns synchronously and queues its effects.

use std::collections::{BTreeMap, HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace, warn};
use x25519_dalek::StaticSecret;

use crate::framed::{FrameError, RecordChannel, DEFAULT_MAX_BUFFER};
use crate::gossipsub::{GossipError, GossipEvent, GossipSub, GossipSubConfig};
use crate::identify::{self, IdentifyInfo};
use crate::identity::{Keypair, PeerId};
use crate::messages::{decode_frame, encode_frame, IdentifyRecord, MessageId, Rpc, MAX_WIRE_FRAME};
use crate::multiaddr::{AddrError, Multiaddr};
use crate::multistream::{Dialer, Listener, NegotiationError, Poll};
use crate::noise::{self, NoiseError};
use crate::ping::{self, Ping, PingConfig, PingOutput, PingTimer, PING_SIZE};

/// Opaque connection identifier, monotonically allocated, never reused.
pub type ConnectionId = u64;

/// Opaque timer identifier, monotonically allocated.
pub type TimerId = u64;

/// Security protocol id negotiated on the raw connection.
const SECURITY_PROTOCOL: &str = "/noise";

/// Default wait for a connection to reach `Secured`.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default agent string advertised over identify.
pub const DEFAULT_AGENT_VERSION: &str = concat!("filament/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Configuration
// ============================================================================

/// Aggregate configuration for one swarm.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub gossipsub: GossipSubConfig,
    pub ping: PingConfig,
    /// Agent string advertised over identify.
    pub agent_version: String,
    /// Cap on buffered inbound bytes per connection.
    pub max_inbound_buffer: usize,
    /// Wait for a connection to reach `Secured` before giving up.
    pub handshake_timeout_ms: u64,
    /// Noise prologue binding connections to this network.
    pub prologue: Vec<u8>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            gossipsub: GossipSubConfig::default(),
            ping: PingConfig::default(),
            agent_version: DEFAULT_AGENT_VERSION.to_string(),
            max_inbound_buffer: DEFAULT_MAX_BUFFER,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            prologue: Vec::new(),
        }
    }
}

/// Builder for [`Swarm`], for hosts that want to tweak parts of the
/// configuration without spelling out the whole struct.
pub struct SwarmBuilder {
    config: SwarmConfig,
    keypair: Option<Keypair>,
    rng_seed: u64,
}

impl SwarmBuilder {
    pub fn new() -> Self {
        Self {
            config: SwarmConfig::default(),
            keypair: None,
            rng_seed: 0,
        }
    }

    /// Identity keypair; generated from the seeded RNG when omitted.
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Seed for all in-core randomness.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }

    pub fn gossipsub(mut self, config: GossipSubConfig) -> Self {
        self.config.gossipsub = config;
        self
    }

    pub fn ping(mut self, config: PingConfig) -> Self {
        self.config.ping = config;
        self
    }

    pub fn agent_version(mut self, agent: impl Into<String>) -> Self {
        self.config.agent_version = agent.into();
        self
    }

    pub fn prologue(mut self, prologue: Vec<u8>) -> Self {
        self.config.prologue = prologue;
        self
    }

    pub fn handshake_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.handshake_timeout_ms = timeout_ms;
        self
    }

    pub fn build(self) -> Swarm {
        let mut rng = StdRng::seed_from_u64(self.rng_seed);
        let keypair = self
            .keypair
            .unwrap_or_else(|| Keypair::generate(&mut rng));
        Swarm::with_rng(self.config, keypair, rng)
    }
}

impl Default for SwarmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Actions and events
// ============================================================================

/// Effects the host driver must carry out, drained in FIFO order by
/// [`Swarm::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open an outbound transport connection.
    Dial { pending_id: u64, addr: String },
    /// Start listening on an address.
    Listen { listener_id: u64, addr: String },
    /// Accept the next inbound connection on a listener.
    Accept { listener_id: u64 },
    /// Close a transport connection.
    CloseConnection { conn_id: ConnectionId },
    /// Write bytes to a connection, in order.
    Send { conn_id: ConnectionId, bytes: Vec<u8> },
    /// Arm a one-shot timer.
    SetTimer { timer_id: TimerId, duration_ms: u64 },
    /// Disarm a timer; firing it afterwards is a no-op.
    CancelTimer { timer_id: TimerId },
}

/// Observations the core surfaces, drained in FIFO order by
/// [`Swarm::drain_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection reached `Secured`; the remote identity is now known.
    ConnectionEstablished { conn_id: ConnectionId, peer: PeerId },
    /// A connection left the swarm. No later action references its id.
    ConnectionClosed { conn_id: ConnectionId, reason: DisconnectReason },
    /// A gossip message on a subscribed topic, exactly once per
    /// duplicate-suppression window.
    Message {
        topic: String,
        source: PeerId,
        data: Vec<u8>,
        msg_id: MessageId,
    },
    /// The peer answered a liveness probe.
    PongReceived {
        conn_id: ConnectionId,
        peer: PeerId,
        latency_ms: u64,
    },
    /// The peer missed a liveness probe; its connection is closing.
    PingTimeout { conn_id: ConnectionId },
    /// The peer's identify record arrived.
    Identified { conn_id: ConnectionId, info: IdentifyInfo },
}

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called locally.
    Local,
    /// The host reported the transport closed.
    Remote,
    /// AEAD authentication failed.
    NoiseAuthFail,
    /// The peer drove the handshake out of turn.
    NoiseOutOfTurn,
    /// Protocol or security negotiation failed.
    BadNegotiation,
    /// A record or frame violated its framing rules.
    MalformedFrame,
    /// A session cipher exhausted its nonce space.
    NonceOverflow,
    /// The per-connection inbound buffer cap was exceeded.
    BufferOverflow,
    /// No pong within the ping timeout.
    PingTimeout,
    /// The connection never reached `Secured` in time.
    HandshakeTimeout,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DisconnectReason::Local => "closed locally",
            DisconnectReason::Remote => "closed by transport",
            DisconnectReason::NoiseAuthFail => "noise authentication failed",
            DisconnectReason::NoiseOutOfTurn => "noise message out of turn",
            DisconnectReason::BadNegotiation => "protocol negotiation failed",
            DisconnectReason::MalformedFrame => "malformed frame",
            DisconnectReason::NonceOverflow => "cipher nonce exhausted",
            DisconnectReason::BufferOverflow => "inbound buffer overflow",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::HandshakeTimeout => "handshake timeout",
        };
        write!(f, "{text}")
    }
}

impl From<NoiseError> for DisconnectReason {
    fn from(e: NoiseError) -> Self {
        match e {
            NoiseError::AuthFail => DisconnectReason::NoiseAuthFail,
            NoiseError::OutOfTurn => DisconnectReason::NoiseOutOfTurn,
            NoiseError::Malformed => DisconnectReason::MalformedFrame,
            NoiseError::NonceOverflow => DisconnectReason::NonceOverflow,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Synchronous input errors: caller bugs, reported without state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmError {
    /// The connection id is not (or no longer) known.
    UnknownConnection(ConnectionId),
    /// The address failed to parse or validate.
    Addr(AddrError),
    /// A gossip operation failed.
    Gossip(GossipError),
}

impl std::fmt::Display for SwarmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwarmError::UnknownConnection(id) => write!(f, "unknown connection {id}"),
            SwarmError::Addr(e) => write!(f, "bad address: {e}"),
            SwarmError::Gossip(e) => write!(f, "gossip: {e}"),
        }
    }
}

impl std::error::Error for SwarmError {}

impl From<AddrError> for SwarmError {
    fn from(e: AddrError) -> Self {
        SwarmError::Addr(e)
    }
}

impl From<GossipError> for SwarmError {
    fn from(e: GossipError) -> Self {
        SwarmError::Gossip(e)
    }
}

// ============================================================================
// Connection state
// ============================================================================

/// Whether we dialed or accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Negotiating the security protocol on raw bytes.
    RawNegotiating,
    /// Running the Noise XX handshake.
    Handshaking,
    /// Application substreams live; remote identity known.
    Secured,
    /// Torn down; the id never reappears.
    Closed,
}

enum RawNegotiation {
    Dialer(Dialer),
    Listener(Listener),
}

/// What a substream is doing.
enum SubstreamState {
    /// Locally opened, proposing its protocol.
    NegotiatingOut(Dialer),
    /// Peer-opened, answering proposals.
    NegotiatingIn(Listener),
    /// Protocol agreed; handler attached.
    Active(ProtocolKind),
}

/// The handler attached to an active substream. `*Out` substreams were
/// opened locally, `*In` by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtocolKind {
    PingOut,
    PingIn,
    IdentifyOut,
    IdentifyIn,
    GossipOut,
    GossipIn,
}

struct Substream {
    state: SubstreamState,
    /// Reassembly buffer for the protocol layer.
    buf: Vec<u8>,
    /// Writes queued while negotiation is still in flight.
    pending_out: Vec<Vec<u8>>,
}

impl Substream {
    fn negotiating_out(dialer: Dialer) -> Self {
        Self {
            state: SubstreamState::NegotiatingOut(dialer),
            buf: Vec::new(),
            pending_out: Vec::new(),
        }
    }

    fn negotiating_in(listener: Listener) -> Self {
        Self {
            state: SubstreamState::NegotiatingIn(listener),
            buf: Vec::new(),
            pending_out: Vec::new(),
        }
    }
}

struct Connection {
    id: ConnectionId,
    remote_addr: Multiaddr,
    direction: Direction,
    phase: Phase,
    remote_peer: Option<PeerId>,
    raw: Option<RawNegotiation>,
    noise: Option<noise::Session>,
    records: RecordChannel,
    substreams: BTreeMap<u32, Substream>,
    next_substream_id: u32,
    /// Local protocol substream ids, known once opened.
    ping_out: Option<u32>,
    identify_out: Option<u32>,
    gossip_out: Option<u32>,
    ping: Ping,
    identify_received: bool,
    handshake_timer: Option<TimerId>,
    ping_timeout_timer: Option<TimerId>,
    ping_interval_timer: Option<TimerId>,
}

impl Connection {
    fn alloc_substream_id(&mut self) -> u32 {
        let id = self.next_substream_id;
        self.next_substream_id += 2;
        id
    }

}

enum TimerKind {
    Heartbeat,
    Handshake(ConnectionId),
    Ping(ConnectionId, PingTimer),
}

// ============================================================================
// Swarm
// ============================================================================

/// One peer: connection registry, gossip engine, action and event queues.
pub struct Swarm {
    config: SwarmConfig,
    keypair: Keypair,
    local_peer: PeerId,
    noise_static: StaticSecret,
    rng: StdRng,
    gossip: GossipSub,
    connections: BTreeMap<ConnectionId, Connection>,
    /// Secured-peer lookup used by gossip routing.
    peer_index: BTreeMap<PeerId, ConnectionId>,
    pending_dials: BTreeMap<u64, Multiaddr>,
    listeners: BTreeMap<u64, Multiaddr>,
    listen_addrs: Vec<Multiaddr>,
    timers: HashMap<TimerId, TimerKind>,
    /// Shared monotonic counter behind every id the swarm hands out.
    next_id: u64,
    /// Gossip RPCs staged while a connection is being driven.
    staged_rpcs: VecDeque<(PeerId, Rpc)>,
    actions: VecDeque<Action>,
    events: VecDeque<Event>,
}

impl Swarm {
    /// Create a swarm from explicit parts; see also [`Swarm::builder`].
    pub fn new(config: SwarmConfig, keypair: Keypair, rng_seed: u64) -> Self {
        Self::with_rng(config, keypair, StdRng::seed_from_u64(rng_seed))
    }

    pub fn builder() -> SwarmBuilder {
        SwarmBuilder::new()
    }

    fn with_rng(config: SwarmConfig, keypair: Keypair, mut rng: StdRng) -> Self {
        let local_peer = keypair.peer_id();
        let noise_static = StaticSecret::random_from_rng(&mut rng);
        let gossip = GossipSub::new(config.gossipsub.clone(), local_peer);
        let mut swarm = Self {
            config,
            keypair,
            local_peer,
            noise_static,
            rng,
            gossip,
            connections: BTreeMap::new(),
            peer_index: BTreeMap::new(),
            pending_dials: BTreeMap::new(),
            listeners: BTreeMap::new(),
            listen_addrs: Vec::new(),
            timers: HashMap::new(),
            next_id: 1,
            staged_rpcs: VecDeque::new(),
            actions: VecDeque::new(),
            events: VecDeque::new(),
        };
        swarm.arm_heartbeat();
        swarm
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Topics the local peer subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        self.gossip.subscriptions().map(str::to_string).collect()
    }

    /// Mesh members for a topic.
    pub fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.gossip.mesh_peers(topic)
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    /// Drain queued actions, FIFO in emission order.
    pub fn poll(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }

    /// Drain queued events, FIFO in emission order.
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------

    /// Ask the host to dial `addr`. Returns the pending connection id the
    /// host echoes back in `on_connection_opened`.
    pub fn dial(&mut self, addr: &str) -> Result<u64, SwarmError> {
        let addr = Multiaddr::parse(addr)?;
        let pending_id = self.alloc_id();
        self.actions.push_back(Action::Dial {
            pending_id,
            addr: addr.to_string(),
        });
        self.pending_dials.insert(pending_id, addr);
        Ok(pending_id)
    }

    /// Ask the host to listen on `addr` and accept its first connection.
    pub fn listen(&mut self, addr: &str) -> Result<u64, SwarmError> {
        let addr = Multiaddr::parse(addr)?;
        let listener_id = self.alloc_id();
        self.actions.push_back(Action::Listen {
            listener_id,
            addr: addr.to_string(),
        });
        self.actions.push_back(Action::Accept { listener_id });
        self.listen_addrs.push(addr.clone());
        self.listeners.insert(listener_id, addr);
        Ok(listener_id)
    }

    /// Close a connection immediately: pending outbound state is dropped,
    /// its timers are cancelled and `CloseConnection` is queued.
    pub fn close(&mut self, conn_id: ConnectionId) -> Result<(), SwarmError> {
        let conn = self
            .connections
            .remove(&conn_id)
            .ok_or(SwarmError::UnknownConnection(conn_id))?;
        self.finish_close(conn, DisconnectReason::Local, true);
        Ok(())
    }

    /// Subscribe to a topic.
    pub fn subscribe(&mut self, topic: &str) -> Result<(), SwarmError> {
        let sends = self.gossip.subscribe(topic, &mut self.rng)?;
        self.route_rpcs(sends);
        Ok(())
    }

    /// Unsubscribe from a topic.
    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), SwarmError> {
        let sends = self.gossip.unsubscribe(topic)?;
        self.route_rpcs(sends);
        Ok(())
    }

    /// Publish on a topic. Fails with `InsufficientPeers` when there is
    /// neither a mesh nor a fanout route.
    pub fn publish(&mut self, topic: &str, data: Vec<u8>) -> Result<MessageId, SwarmError> {
        let (id, sends) = self.gossip.publish(topic, data, &mut self.rng)?;
        self.route_rpcs(sends);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Host inputs
    // ------------------------------------------------------------------

    /// The host opened a transport connection.
    ///
    /// For `Outbound` the first argument is the pending id returned by
    /// [`Swarm::dial`]; for `Inbound` it is the listener id (another
    /// `Accept` is queued to re-arm it). Allocates and returns the real
    /// connection id and starts security negotiation.
    pub fn on_connection_opened(
        &mut self,
        pending_id: u64,
        remote_addr: &str,
        direction: Direction,
    ) -> Result<ConnectionId, SwarmError> {
        let remote_addr = Multiaddr::parse(remote_addr)?;
        match direction {
            Direction::Outbound => {
                self.pending_dials
                    .remove(&pending_id)
                    .ok_or(SwarmError::UnknownConnection(pending_id))?;
            }
            Direction::Inbound => {
                if !self.listeners.contains_key(&pending_id) {
                    return Err(SwarmError::UnknownConnection(pending_id));
                }
                self.actions.push_back(Action::Accept { listener_id: pending_id });
            }
        }

        let conn_id = self.alloc_id();
        let (raw, opening) = match direction {
            Direction::Outbound => {
                let (dialer, opening) = Dialer::new(vec![SECURITY_PROTOCOL.to_string()]);
                (RawNegotiation::Dialer(dialer), opening)
            }
            Direction::Inbound => {
                let (listener, opening) = Listener::new(vec![SECURITY_PROTOCOL.to_string()]);
                (RawNegotiation::Listener(listener), opening)
            }
        };

        let handshake_timer = self.arm_timer(
            TimerKind::Handshake(conn_id),
            self.config.handshake_timeout_ms,
        );
        let conn = Connection {
            id: conn_id,
            remote_addr,
            direction,
            phase: Phase::RawNegotiating,
            remote_peer: None,
            raw: Some(raw),
            noise: None,
            records: RecordChannel::new(self.config.max_inbound_buffer),
            substreams: BTreeMap::new(),
            next_substream_id: match direction {
                Direction::Outbound => 1,
                Direction::Inbound => 2,
            },
            ping_out: None,
            identify_out: None,
            gossip_out: None,
            ping: Ping::new(self.config.ping.clone()),
            identify_received: false,
            handshake_timer: Some(handshake_timer),
            ping_timeout_timer: None,
            ping_interval_timer: None,
        };
        debug!(conn_id, ?direction, "connection opened");
        self.actions.push_back(Action::Send { conn_id, bytes: opening });
        self.connections.insert(conn_id, conn);
        Ok(conn_id)
    }

    /// The host read bytes from a connection. `now_ms` is the host clock
    /// in milliseconds, used for latency measurement.
    pub fn on_data_received(
        &mut self,
        conn_id: ConnectionId,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<(), SwarmError> {
        let mut conn = self
            .connections
            .remove(&conn_id)
            .ok_or(SwarmError::UnknownConnection(conn_id))?;
        match self.drive(&mut conn, bytes, now_ms) {
            Ok(()) => {
                self.connections.insert(conn_id, conn);
            }
            Err(reason) => self.finish_close(conn, reason, true),
        }
        self.flush_staged_rpcs();
        Ok(())
    }

    /// The host observed the transport close underneath us.
    pub fn on_connection_closed(
        &mut self,
        conn_id: ConnectionId,
        reason: DisconnectReason,
    ) -> Result<(), SwarmError> {
        let conn = self
            .connections
            .remove(&conn_id)
            .ok_or(SwarmError::UnknownConnection(conn_id))?;
        self.finish_close(conn, reason, false);
        Ok(())
    }

    /// A previously armed timer fired. Firing a cancelled or unknown timer
    /// is a harmless no-op.
    pub fn on_timer(&mut self, timer_id: TimerId, now_ms: u64) -> Result<(), SwarmError> {
        let Some(kind) = self.timers.remove(&timer_id) else {
            trace!(timer_id, "stale timer ignored");
            return Ok(());
        };
        match kind {
            TimerKind::Heartbeat => {
                let sends = self.gossip.heartbeat(&mut self.rng);
                self.route_rpcs(sends);
                self.arm_heartbeat();
            }
            TimerKind::Handshake(conn_id) => {
                let stalled = self
                    .connections
                    .get(&conn_id)
                    .map(|conn| conn.phase != Phase::Secured)
                    .unwrap_or(false);
                if stalled {
                    let conn = self.connections.remove(&conn_id).expect("checked above");
                    self.finish_close(conn, DisconnectReason::HandshakeTimeout, true);
                }
            }
            TimerKind::Ping(conn_id, ping_timer) => {
                let Some(mut conn) = self.connections.remove(&conn_id) else {
                    return Ok(());
                };
                match ping_timer {
                    PingTimer::Timeout => conn.ping_timeout_timer = None,
                    PingTimer::Interval => conn.ping_interval_timer = None,
                }
                let outputs = conn.ping.on_timer(ping_timer, &mut self.rng, now_ms);
                match self.apply_ping_outputs(&mut conn, outputs) {
                    Ok(()) => {
                        self.connections.insert(conn_id, conn);
                    }
                    Err(reason) => self.finish_close(conn, reason, true),
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connection driving
    // ------------------------------------------------------------------

    /// Feed bytes through the connection's current pipeline stage. A
    /// returned error closes the connection with that reason.
    fn drive(
        &mut self,
        conn: &mut Connection,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<(), DisconnectReason> {
        match conn.phase {
            Phase::RawNegotiating => self.drive_raw(conn, bytes, now_ms),
            Phase::Handshaking | Phase::Secured => self.drive_records(conn, bytes, now_ms),
            Phase::Closed => Ok(()),
        }
    }

    /// Security-protocol negotiation over raw bytes.
    fn drive_raw(
        &mut self,
        conn: &mut Connection,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<(), DisconnectReason> {
        let mut raw = conn.raw.take().expect("raw negotiation present in this phase");
        let (poll, send) = match &mut raw {
            RawNegotiation::Dialer(dialer) => dialer.on_bytes(bytes),
            RawNegotiation::Listener(listener) => listener.on_bytes(bytes),
        }
        .map_err(|e: NegotiationError| {
            debug!(conn_id = conn.id, error = %e, "security negotiation failed");
            DisconnectReason::BadNegotiation
        })?;
        if !send.is_empty() {
            self.actions.push_back(Action::Send { conn_id: conn.id, bytes: send });
        }
        match poll {
            Poll::Pending => {
                conn.raw = Some(raw);
                Ok(())
            }
            Poll::Unsupported => Err(DisconnectReason::BadNegotiation),
            Poll::Negotiated { protocol, leftover } => {
                debug_assert_eq!(protocol, SECURITY_PROTOCOL);
                conn.phase = Phase::Handshaking;
                let session = match conn.direction {
                    Direction::Outbound => noise::Session::initiate(
                        &mut self.rng,
                        &self.config.prologue,
                        self.noise_static.clone(),
                    ),
                    Direction::Inbound => noise::Session::respond(
                        &mut self.rng,
                        &self.config.prologue,
                        self.noise_static.clone(),
                    ),
                };
                conn.noise = Some(session);
                if conn.direction == Direction::Outbound {
                    // -> e opens the handshake; its payload stays empty.
                    let noise = conn.noise.as_mut().expect("just installed");
                    let msg = noise.write_message(&[])?;
                    let wire = conn.records.seal(&msg)?;
                    self.actions.push_back(Action::Send { conn_id: conn.id, bytes: wire });
                }
                if leftover.is_empty() {
                    Ok(())
                } else {
                    self.drive_records(conn, &leftover, now_ms)
                }
            }
        }
    }

    /// Record-layer processing for the handshake and secured phases.
    fn drive_records(
        &mut self,
        conn: &mut Connection,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<(), DisconnectReason> {
        conn.records.push(bytes).map_err(|_: FrameError| {
            warn!(conn_id = conn.id, "inbound buffer overflow");
            DisconnectReason::BufferOverflow
        })?;
        loop {
            let record = match conn.records.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            match conn.phase {
                Phase::Handshaking => self.advance_handshake(conn, &record)?,
                Phase::Secured => self.dispatch_substream_frame(conn, &record, now_ms)?,
                _ => return Ok(()),
            }
        }
    }

    /// Feed one record into the Noise state machine and react to the new
    /// stage.
    fn advance_handshake(
        &mut self,
        conn: &mut Connection,
        record: &[u8],
    ) -> Result<(), DisconnectReason> {
        let noise = conn.noise.as_mut().expect("session present while handshaking");
        let payload = noise.read_message(record)?;
        match noise.stage() {
            // Responder: -> e consumed; answer with <- e, ee, s, es
            // carrying our identity key.
            noise::Stage::EphRecv => {
                let public = self.keypair.public_bytes();
                let msg = noise.write_message(&public)?;
                let wire = conn.records.seal(&msg)?;
                self.actions.push_back(Action::Send { conn_id: conn.id, bytes: wire });
                Ok(())
            }
            // Initiator: <- e, ee, s, es consumed; the payload is the
            // responder's identity. Answer -> s, se with ours.
            noise::Stage::StaticRecv => {
                let peer = PeerId::from_public_key(&payload)
                    .map_err(|_| DisconnectReason::NoiseAuthFail)?;
                conn.remote_peer = Some(peer);
                let public = self.keypair.public_bytes();
                let msg = noise.write_message(&public)?;
                let wire = conn.records.seal(&msg)?;
                self.actions.push_back(Action::Send { conn_id: conn.id, bytes: wire });
                self.secure_connection(conn)
            }
            // Responder: -> s, se consumed; the payload is the initiator's
            // identity.
            noise::Stage::Established => {
                let peer = PeerId::from_public_key(&payload)
                    .map_err(|_| DisconnectReason::NoiseAuthFail)?;
                conn.remote_peer = Some(peer);
                self.secure_connection(conn)
            }
            stage => {
                warn!(conn_id = conn.id, ?stage, "unexpected handshake stage");
                Err(DisconnectReason::NoiseOutOfTurn)
            }
        }
    }

    /// The handshake finished: install the session ciphers, surface the
    /// identity and open the application substreams.
    fn secure_connection(&mut self, conn: &mut Connection) -> Result<(), DisconnectReason> {
        let session = conn.noise.take().expect("session present");
        let (cipher_out, cipher_in, _remote_static) = session.finish()?;
        conn.records.secure(cipher_out, cipher_in);
        conn.phase = Phase::Secured;
        let peer = conn.remote_peer.expect("identity set before securing");

        if let Some(timer) = conn.handshake_timer.take() {
            self.cancel_timer(timer);
        }
        self.peer_index.insert(peer, conn.id);
        self.events.push_back(Event::ConnectionEstablished { conn_id: conn.id, peer });
        debug!(conn_id = conn.id, %peer, "connection secured");

        // Open our three protocol substreams.
        let ping_id = self.open_substream(conn, ping::PROTOCOL_NAME)?;
        conn.ping_out = Some(ping_id);
        let identify_id = self.open_substream(conn, identify::PROTOCOL_NAME)?;
        conn.identify_out = Some(identify_id);
        let gossip_id = self.open_substream(conn, crate::gossipsub::PROTOCOL_NAME)?;
        conn.gossip_out = Some(gossip_id);

        // Push our identify record; it flushes once the substream opens.
        let record = self.local_identify_record(&conn.remote_addr);
        self.write_substream(conn, identify_id, &encode_frame(&record.to_bytes()))?;

        // Tell gossip about the peer; subscription deltas flow through the
        // staging queue like any other RPC.
        let sends = self.gossip.add_peer(peer);
        self.staged_rpcs.extend(sends);
        Ok(())
    }

    /// Open a locally initiated substream proposing `protocol`.
    fn open_substream(
        &mut self,
        conn: &mut Connection,
        protocol: &str,
    ) -> Result<u32, DisconnectReason> {
        let sub_id = conn.alloc_substream_id();
        let (dialer, opening) = Dialer::new(vec![protocol.to_string()]);
        conn.substreams.insert(sub_id, Substream::negotiating_out(dialer));
        self.send_mux_frame(conn, sub_id, &opening)?;
        trace!(conn_id = conn.id, sub_id, protocol, "substream opened");
        Ok(sub_id)
    }

    /// One decrypted record: `u32-be substream id || payload`.
    fn dispatch_substream_frame(
        &mut self,
        conn: &mut Connection,
        record: &[u8],
        now_ms: u64,
    ) -> Result<(), DisconnectReason> {
        if record.len() < 4 {
            return Err(DisconnectReason::MalformedFrame);
        }
        let sub_id = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let payload = &record[4..];

        if !conn.substreams.contains_key(&sub_id) {
            // Peer-opened substream; we answer its negotiation.
            let (listener, header) = Listener::new(vec![
                ping::PROTOCOL_NAME.to_string(),
                identify::PROTOCOL_NAME.to_string(),
                crate::gossipsub::PROTOCOL_NAME.to_string(),
            ]);
            conn.substreams.insert(sub_id, Substream::negotiating_in(listener));
            self.send_mux_frame(conn, sub_id, &header)?;
        }

        let mut sub = conn.substreams.remove(&sub_id).expect("inserted above");
        let result = self.drive_substream(conn, sub_id, &mut sub, payload, now_ms);
        conn.substreams.insert(sub_id, sub);
        result
    }

    fn drive_substream(
        &mut self,
        conn: &mut Connection,
        sub_id: u32,
        sub: &mut Substream,
        payload: &[u8],
        now_ms: u64,
    ) -> Result<(), DisconnectReason> {
        match &mut sub.state {
            SubstreamState::NegotiatingOut(dialer) => {
                let (poll, send) = dialer
                    .on_bytes(payload)
                    .map_err(|_| DisconnectReason::BadNegotiation)?;
                if !send.is_empty() {
                    self.send_mux_frame(conn, sub_id, &send)?;
                }
                match poll {
                    Poll::Pending => Ok(()),
                    Poll::Unsupported => {
                        // The peer lacks this protocol; the substream goes
                        // inert but the connection survives.
                        warn!(conn_id = conn.id, sub_id, "protocol unsupported by peer");
                        Ok(())
                    }
                    Poll::Negotiated { protocol, leftover } => {
                        let kind = match protocol.as_str() {
                            ping::PROTOCOL_NAME => ProtocolKind::PingOut,
                            identify::PROTOCOL_NAME => ProtocolKind::IdentifyOut,
                            crate::gossipsub::PROTOCOL_NAME => ProtocolKind::GossipOut,
                            _ => return Err(DisconnectReason::BadNegotiation),
                        };
                        sub.state = SubstreamState::Active(kind);
                        for queued in std::mem::take(&mut sub.pending_out) {
                            self.send_mux_frame(conn, sub_id, &queued)?;
                        }
                        if kind == ProtocolKind::PingOut {
                            let outputs = self.start_ping(conn, now_ms);
                            self.apply_ping_outputs(conn, outputs)?;
                        }
                        if leftover.is_empty() {
                            Ok(())
                        } else {
                            self.handle_protocol_bytes(conn, sub_id, sub, kind, &leftover, now_ms)
                        }
                    }
                }
            }
            SubstreamState::NegotiatingIn(listener) => {
                let (poll, send) = listener
                    .on_bytes(payload)
                    .map_err(|_| DisconnectReason::BadNegotiation)?;
                if !send.is_empty() {
                    self.send_mux_frame(conn, sub_id, &send)?;
                }
                match poll {
                    Poll::Pending | Poll::Unsupported => Ok(()),
                    Poll::Negotiated { protocol, leftover } => {
                        let kind = match protocol.as_str() {
                            ping::PROTOCOL_NAME => ProtocolKind::PingIn,
                            identify::PROTOCOL_NAME => ProtocolKind::IdentifyIn,
                            crate::gossipsub::PROTOCOL_NAME => ProtocolKind::GossipIn,
                            _ => return Err(DisconnectReason::BadNegotiation),
                        };
                        sub.state = SubstreamState::Active(kind);
                        if leftover.is_empty() {
                            Ok(())
                        } else {
                            self.handle_protocol_bytes(conn, sub_id, sub, kind, &leftover, now_ms)
                        }
                    }
                }
            }
            SubstreamState::Active(kind) => {
                let kind = *kind;
                self.handle_protocol_bytes(conn, sub_id, sub, kind, payload, now_ms)
            }
        }
    }

    /// Protocol-level byte handling for an active substream.
    fn handle_protocol_bytes(
        &mut self,
        conn: &mut Connection,
        sub_id: u32,
        sub: &mut Substream,
        kind: ProtocolKind,
        payload: &[u8],
        now_ms: u64,
    ) -> Result<(), DisconnectReason> {
        sub.buf.extend_from_slice(payload);
        if sub.buf.len() > MAX_WIRE_FRAME + 16 {
            return Err(DisconnectReason::BufferOverflow);
        }
        match kind {
            ProtocolKind::PingIn => {
                // Echo whole probes back unchanged.
                while sub.buf.len() >= PING_SIZE {
                    let probe: Vec<u8> = sub.buf.drain(..PING_SIZE).collect();
                    let echo = ping::echo(&probe);
                    self.send_mux_frame(conn, sub_id, &echo)?;
                }
                Ok(())
            }
            ProtocolKind::PingOut => {
                while sub.buf.len() >= PING_SIZE {
                    let pong: Vec<u8> = sub.buf.drain(..PING_SIZE).collect();
                    let outputs = conn.ping.on_pong(&pong, now_ms);
                    self.apply_ping_outputs(conn, outputs)?;
                }
                Ok(())
            }
            ProtocolKind::IdentifyIn => {
                while let Some(frame) = Self::take_frame(&mut sub.buf)? {
                    if conn.identify_received {
                        trace!(conn_id = conn.id, "extra identify record ignored");
                        continue;
                    }
                    conn.identify_received = true;
                    match IdentifyRecord::from_bytes(&frame)
                        .ok()
                        .and_then(|record| identify::decode_info(record).ok())
                    {
                        Some(info) => {
                            self.events.push_back(Event::Identified { conn_id: conn.id, info });
                        }
                        // Identify failure is non-fatal; it surfaces once
                        // as a missing event.
                        None => warn!(conn_id = conn.id, "undecodable identify record"),
                    }
                }
                Ok(())
            }
            ProtocolKind::GossipIn => {
                let peer = conn.remote_peer.expect("secured connections have a peer");
                while let Some(frame) = Self::take_frame(&mut sub.buf)? {
                    let rpc = Rpc::from_bytes(&frame)
                        .map_err(|_| DisconnectReason::MalformedFrame)?;
                    let output = self.gossip.handle_rpc(peer, rpc);
                    for event in output.events {
                        let GossipEvent::Message { topic, source, data, msg_id } = event;
                        self.events.push_back(Event::Message { topic, source, data, msg_id });
                    }
                    self.staged_rpcs.extend(output.sends);
                }
                Ok(())
            }
            // Nothing arrives on our own outbound identify/gossip streams.
            ProtocolKind::IdentifyOut | ProtocolKind::GossipOut => {
                trace!(conn_id = conn.id, sub_id, "ignoring data on outbound-only substream");
                sub.buf.clear();
                Ok(())
            }
        }
    }

    /// Split one varint frame off a substream buffer.
    fn take_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, DisconnectReason> {
        match decode_frame(buf) {
            Ok(Some((frame, consumed))) => {
                let frame = frame.to_vec();
                buf.drain(..consumed);
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(_) => Err(DisconnectReason::MalformedFrame),
        }
    }

    // ------------------------------------------------------------------
    // Ping plumbing
    // ------------------------------------------------------------------

    fn start_ping(&mut self, conn: &mut Connection, now_ms: u64) -> Vec<PingOutput> {
        conn.ping.start(&mut self.rng, now_ms)
    }

    fn apply_ping_outputs(
        &mut self,
        conn: &mut Connection,
        outputs: Vec<PingOutput>,
    ) -> Result<(), DisconnectReason> {
        for output in outputs {
            match output {
                PingOutput::Send(bytes) => {
                    let sub_id = conn.ping_out.expect("ping machine runs on its substream");
                    self.write_substream(conn, sub_id, &bytes)?;
                }
                PingOutput::SetTimer { kind, duration_ms } => {
                    let timer = self.arm_timer(TimerKind::Ping(conn.id, kind), duration_ms);
                    match kind {
                        PingTimer::Timeout => conn.ping_timeout_timer = Some(timer),
                        PingTimer::Interval => conn.ping_interval_timer = Some(timer),
                    }
                }
                PingOutput::CancelTimer(kind) => {
                    let slot = match kind {
                        PingTimer::Timeout => conn.ping_timeout_timer.take(),
                        PingTimer::Interval => conn.ping_interval_timer.take(),
                    };
                    if let Some(timer) = slot {
                        self.cancel_timer(timer);
                    }
                }
                PingOutput::PongReceived { latency_ms } => {
                    let peer = conn.remote_peer.expect("secured connections have a peer");
                    self.events.push_back(Event::PongReceived {
                        conn_id: conn.id,
                        peer,
                        latency_ms,
                    });
                }
                PingOutput::Timeout => {
                    self.events.push_back(Event::PingTimeout { conn_id: conn.id });
                    return Err(DisconnectReason::PingTimeout);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound plumbing
    // ------------------------------------------------------------------

    /// Write protocol bytes onto a substream, queueing while it is still
    /// negotiating.
    fn write_substream(
        &mut self,
        conn: &mut Connection,
        sub_id: u32,
        bytes: &[u8],
    ) -> Result<(), DisconnectReason> {
        let active = match conn.substreams.get(&sub_id) {
            Some(sub) => matches!(sub.state, SubstreamState::Active(_)),
            None => {
                trace!(conn_id = conn.id, sub_id, "write to vanished substream dropped");
                return Ok(());
            }
        };
        if active {
            self.send_mux_frame(conn, sub_id, bytes)
        } else {
            let sub = conn.substreams.get_mut(&sub_id).expect("checked above");
            sub.pending_out.push(bytes.to_vec());
            Ok(())
        }
    }

    /// Seal and queue one mux frame (`u32-be substream id || bytes`).
    fn send_mux_frame(
        &mut self,
        conn: &mut Connection,
        sub_id: u32,
        bytes: &[u8],
    ) -> Result<(), DisconnectReason> {
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&sub_id.to_be_bytes());
        frame.extend_from_slice(bytes);
        let wire = conn.records.seal(&frame)?;
        self.actions.push_back(Action::Send { conn_id: conn.id, bytes: wire });
        Ok(())
    }

    /// Deliver gossip RPC batches to their peers' connections.
    fn route_rpcs(&mut self, sends: Vec<(PeerId, Rpc)>) {
        self.staged_rpcs.extend(sends);
        self.flush_staged_rpcs();
    }

    fn flush_staged_rpcs(&mut self) {
        while let Some((peer, rpc)) = self.staged_rpcs.pop_front() {
            let Some(&conn_id) = self.peer_index.get(&peer) else {
                trace!(%peer, "no connection for gossip rpc, dropped");
                continue;
            };
            let Some(mut conn) = self.connections.remove(&conn_id) else {
                continue;
            };
            let Some(sub_id) = conn.gossip_out else {
                self.connections.insert(conn_id, conn);
                continue;
            };
            let frame = encode_frame(&rpc.to_bytes());
            match self.write_substream(&mut conn, sub_id, &frame) {
                Ok(()) => {
                    self.connections.insert(conn_id, conn);
                }
                Err(reason) => self.finish_close(conn, reason, true),
            }
        }
    }

    fn local_identify_record(&self, remote_addr: &Multiaddr) -> IdentifyRecord {
        identify::local_record(
            self.keypair.public_bytes(),
            &self.listen_addrs,
            remote_addr,
            &[
                ping::PROTOCOL_NAME.to_string(),
                identify::PROTOCOL_NAME.to_string(),
                crate::gossipsub::PROTOCOL_NAME.to_string(),
            ],
            &self.config.agent_version,
        )
    }

    // ------------------------------------------------------------------
    // Teardown and timers
    // ------------------------------------------------------------------

    /// Common teardown: cancel timers, scrub gossip, surface the event.
    /// `emit_close` queues `CloseConnection` for closes the core decided.
    fn finish_close(&mut self, mut conn: Connection, reason: DisconnectReason, emit_close: bool) {
        conn.phase = Phase::Closed;
        for timer in [
            conn.handshake_timer.take(),
            conn.ping_timeout_timer.take(),
            conn.ping_interval_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.cancel_timer(timer);
        }
        if let Some(peer) = conn.remote_peer {
            // Another connection may have taken over this peer already.
            if self.peer_index.get(&peer) == Some(&conn.id) {
                self.peer_index.remove(&peer);
                self.gossip.remove_peer(&peer);
            }
        }
        if emit_close {
            self.actions.push_back(Action::CloseConnection { conn_id: conn.id });
        }
        self.events.push_back(Event::ConnectionClosed { conn_id: conn.id, reason });
        debug!(conn_id = conn.id, %reason, "connection closed");
    }

    fn arm_heartbeat(&mut self) {
        let interval = self.config.gossipsub.heartbeat_interval_ms;
        self.arm_timer(TimerKind::Heartbeat, interval);
    }

    fn arm_timer(&mut self, kind: TimerKind, duration_ms: u64) -> TimerId {
        let timer_id = self.alloc_id();
        self.timers.insert(timer_id, kind);
        self.actions.push_back(Action::SetTimer { timer_id, duration_ms });
        timer_id
    }

    fn cancel_timer(&mut self, timer_id: TimerId) {
        if self.timers.remove(&timer_id).is_some() {
            self.actions.push_back(Action::CancelTimer { timer_id });
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
