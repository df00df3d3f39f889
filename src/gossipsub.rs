//! # GossipSub Engine
//!
//! Topic-based publish/subscribe over a partial mesh, implemented as a
//! pure state machine: RPC envelopes in, `(peer, RPC)` batches and
//! [`GossipEvent`]s out. The swarm maps peers to connections and puts the
//! bytes on the wire.
//!
//! ## Peer Sets
//!
//! Per topic the engine tracks two sets:
//!
//! | Set | Purpose | Traffic |
//! |-----|---------|---------|
//! | Mesh | Full-message forwarding | `publish` frames |
//! | Subscribers | Graft candidates, gossip targets | `IHAVE` announcements |
//!
//! Fanout peers serve topics the local peer publishes to without
//! subscribing; entries expire after [`GossipSubConfig::fanout_ttl_ms`] of
//! publish silence.
//!
//! ## Heartbeat
//!
//! Every heartbeat tick the engine rebalances each mesh toward the target
//! degree (graft below `mesh_n_low`, prune above `mesh_n_high`), expires
//! stale fanout, shifts the message cache window ring and announces recent
//! message ids (`IHAVE`) to a few non-mesh subscribers.
//!
//! ## Deduplication
//!
//! Message identity is `blake3(source || seqno)`. A bounded LRU seen-cache
//! spanning the duplicate-suppression window drops repeats before they
//! touch the mesh; full payloads stay available for `IWANT` replies for
//! [`GossipSubConfig::heartbeat_history`] windows.
//!
//! ## Determinism
//!
//! Peer sets are ordered (`BTreeSet`) and every random choice draws from
//! the injected RNG, so a seeded engine replays identical traces.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;
use rand::seq::SliceRandom;
use rand::{CryptoRng, RngCore};
use tracing::{debug, trace, warn};

use crate::identity::PeerId;
use crate::messages::{payload_message_id, ControlBlock, MessageId, PubMessage, Rpc, SubOpt};

/// Protocol id negotiated for gossipsub substreams.
pub const PROTOCOL_NAME: &str = "/meshsub/1.1.0";

// ============================================================================
// Configuration Constants
// ============================================================================

/// D - target mesh degree per topic.
pub const DEFAULT_MESH_N: usize = 6;

/// D_lo - mesh size below which the heartbeat grafts.
pub const DEFAULT_MESH_N_LOW: usize = 5;

/// D_hi - mesh size above which the heartbeat prunes.
pub const DEFAULT_MESH_N_HIGH: usize = 12;

/// D_lazy - peers receiving IHAVE announcements per topic per heartbeat.
pub const DEFAULT_GOSSIP_LAZY: usize = 6;

/// Interval between heartbeat rounds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Message-cache windows retained for IWANT serving.
pub const DEFAULT_HEARTBEAT_HISTORY: usize = 5;

/// Windows whose ids are eligible for IHAVE announcements.
pub const DEFAULT_GOSSIP_HISTORY: usize = 3;

/// How long fanout peers are kept without a publish.
pub const DEFAULT_FANOUT_TTL_MS: u64 = 60_000;

/// Duplicate-suppression window.
pub const DEFAULT_SEEN_TTL_MS: u64 = 120_000;

/// Maximum message payload size (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum IHAVE message ids per announcement.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 100;

/// Maximum messages retained per mcache window.
pub const DEFAULT_MAX_MESSAGES_PER_WINDOW: usize = 1_024;

/// Maximum peers tracked per topic.
pub const MAX_PEERS_PER_TOPIC: usize = 1_000;

/// Maximum bytes in one IWANT batch reply.
pub const MAX_IWANT_RESPONSE_BYTES: usize = 256 * 1024;

/// Entries in the bounded duplicate-suppression cache.
const SEEN_CACHE_CAPACITY: usize = 8_192;

/// Maximum topic name length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// A topic is printable ASCII, non-empty and bounded.
#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

// ============================================================================
// Configuration
// ============================================================================

/// How message identities are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageIdMode {
    /// `blake3(source || seqno)`: every publish is a distinct message.
    SourceSeqno,
    /// `blake3(topic || payload)`: identical publishes deduplicate.
    TopicPayload,
}

/// GossipSub tunables.
#[derive(Debug, Clone)]
pub struct GossipSubConfig {
    /// D - target mesh degree.
    pub mesh_n: usize,
    /// D_lo - minimum mesh degree before grafting.
    pub mesh_n_low: usize,
    /// D_hi - maximum mesh degree before pruning.
    pub mesh_n_high: usize,
    /// D_lazy - IHAVE fanout degree.
    pub gossip_lazy: usize,
    /// Maintenance tick period.
    pub heartbeat_interval_ms: u64,
    /// Mcache windows retained (>= `gossip_history`).
    pub heartbeat_history: usize,
    /// Windows eligible for IHAVE announcements.
    pub gossip_history: usize,
    /// Fanout retention for non-subscribed topics.
    pub fanout_ttl_ms: u64,
    /// Duplicate-suppression window.
    pub seen_ttl_ms: u64,
    /// Maximum message payload size.
    pub max_message_size: usize,
    /// Maximum IHAVE ids per announcement.
    pub max_ihave_length: usize,
    /// Mcache per-window bound; overflow drops the message.
    pub max_messages_per_window: usize,
    /// Publish to every known subscriber instead of only the mesh.
    pub flood_publish: bool,
    /// Message identity derivation.
    pub message_id_mode: MessageIdMode,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_history: DEFAULT_HEARTBEAT_HISTORY,
            gossip_history: DEFAULT_GOSSIP_HISTORY,
            fanout_ttl_ms: DEFAULT_FANOUT_TTL_MS,
            seen_ttl_ms: DEFAULT_SEEN_TTL_MS,
            max_message_size: MAX_MESSAGE_SIZE,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            max_messages_per_window: DEFAULT_MAX_MESSAGES_PER_WINDOW,
            flood_publish: true,
            message_id_mode: MessageIdMode::SourceSeqno,
        }
    }
}

impl GossipSubConfig {
    fn fanout_ttl_ticks(&self) -> u64 {
        (self.fanout_ttl_ms / self.heartbeat_interval_ms.max(1)).max(1)
    }

    fn seen_ttl_ticks(&self) -> u64 {
        (self.seen_ttl_ms / self.heartbeat_interval_ms.max(1)).max(1)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Synchronous gossip failures surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipError {
    /// Empty, overlong or non-printable topic name.
    InvalidTopic,
    /// Unsubscribe from a topic the local peer never joined.
    NotSubscribed,
    /// Payload exceeds the configured maximum.
    TooLarge,
    /// No mesh member, subscriber or fanout candidate to deliver to.
    InsufficientPeers,
}

impl std::fmt::Display for GossipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GossipError::InvalidTopic => write!(f, "invalid topic name"),
            GossipError::NotSubscribed => write!(f, "not subscribed to topic"),
            GossipError::TooLarge => write!(f, "message exceeds size limit"),
            GossipError::InsufficientPeers => write!(f, "no peers to deliver to"),
        }
    }
}

impl std::error::Error for GossipError {}

// ============================================================================
// Message cache
// ============================================================================

/// Time-sliced ring of message windows.
///
/// Window zero is the current heartbeat; [`MessageCache::shift`] rotates a
/// fresh window in and drops payloads older than the retained history.
struct MessageCache {
    messages: HashMap<MessageId, PubMessage>,
    /// `windows[0]` is the current window.
    windows: VecDeque<Vec<MessageId>>,
    max_per_window: usize,
}

impl MessageCache {
    fn new(history: usize, max_per_window: usize) -> Self {
        let mut windows = VecDeque::with_capacity(history);
        windows.push_front(Vec::new());
        Self {
            messages: HashMap::new(),
            windows,
            max_per_window,
        }
    }

    /// Insert into the current window. `false` means the window is full
    /// and the message was not retained.
    fn put(&mut self, id: MessageId, msg: PubMessage) -> bool {
        let current = self.windows.front_mut().expect("ring is never empty");
        if current.len() >= self.max_per_window {
            return false;
        }
        current.push(id);
        self.messages.insert(id, msg);
        true
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    fn get(&self, id: &MessageId) -> Option<&PubMessage> {
        self.messages.get(id)
    }

    /// Ids from the most recent `depth` windows for one topic.
    fn gossip_ids(&self, topic: &str, depth: usize) -> Vec<MessageId> {
        self.windows
            .iter()
            .take(depth)
            .flatten()
            .filter(|id| self.messages.get(*id).is_some_and(|m| m.topic == topic))
            .copied()
            .collect()
    }

    /// Rotate: drop the oldest window (and its payloads), open a new one.
    fn shift(&mut self, history: usize) {
        while self.windows.len() >= history.max(1) {
            if let Some(expired) = self.windows.pop_back() {
                for id in expired {
                    self.messages.remove(&id);
                }
            }
        }
        self.windows.push_front(Vec::new());
    }
}

// ============================================================================
// Per-topic state
// ============================================================================

/// Peer bookkeeping for one topic.
#[derive(Default)]
struct TopicState {
    /// Full-message forwarding set (only populated while subscribed).
    mesh: BTreeSet<PeerId>,
    /// Every peer known to subscribe to this topic.
    subscribers: BTreeSet<PeerId>,
}

impl TopicState {
    fn is_empty(&self) -> bool {
        self.mesh.is_empty() && self.subscribers.is_empty()
    }
}

/// Fanout bookkeeping for a topic the local peer publishes to without
/// subscribing.
struct FanoutState {
    peers: BTreeSet<PeerId>,
    last_publish_tick: u64,
}

// ============================================================================
// Events and output
// ============================================================================

/// Observations the engine surfaces to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipEvent {
    /// A new message on a subscribed topic, surfaced exactly once per
    /// duplicate-suppression window.
    Message {
        topic: String,
        source: PeerId,
        data: Vec<u8>,
        msg_id: MessageId,
    },
}

/// RPC batches and events produced by one engine call.
#[derive(Default)]
pub struct GossipOutput {
    pub sends: Vec<(PeerId, Rpc)>,
    pub events: Vec<GossipEvent>,
}

/// Accumulates per-peer RPCs so one engine call emits at most one envelope
/// per peer, in deterministic peer order.
#[derive(Default)]
struct Outbox {
    rpcs: BTreeMap<PeerId, Rpc>,
}

impl Outbox {
    fn rpc(&mut self, peer: PeerId) -> &mut Rpc {
        self.rpcs.entry(peer).or_default()
    }

    fn subscription(&mut self, peer: PeerId, topic: &str, subscribe: bool) {
        self.rpc(peer).subscriptions.push(SubOpt {
            subscribe,
            topic: topic.to_string(),
        });
    }

    fn message(&mut self, peer: PeerId, msg: PubMessage) {
        self.rpc(peer).publish.push(msg);
    }

    fn graft(&mut self, peer: PeerId, topic: &str) {
        self.rpc(peer).control.graft.push(topic.to_string());
    }

    fn prune(&mut self, peer: PeerId, topic: &str) {
        self.rpc(peer).control.prune.push(topic.to_string());
    }

    fn into_sends(self) -> Vec<(PeerId, Rpc)> {
        self.rpcs.into_iter().filter(|(_, rpc)| !rpc.is_empty()).collect()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The swarm-wide gossip state machine.
pub struct GossipSub {
    config: GossipSubConfig,
    local_peer: PeerId,
    /// Per-source monotonic sequence number for local publishes.
    seqno: u64,
    /// Heartbeat counter; the engine's notion of time.
    tick: u64,
    /// Topics the local peer subscribes to.
    subscriptions: BTreeSet<String>,
    /// Peer bookkeeping per known topic.
    topics: BTreeMap<String, TopicState>,
    /// Fanout sets for published-but-not-subscribed topics.
    fanout: BTreeMap<String, FanoutState>,
    /// All connected gossip-capable peers.
    peers: BTreeSet<PeerId>,
    /// Duplicate suppression: message id -> tick last accepted.
    seen: LruCache<MessageId, u64>,
    mcache: MessageCache,
}

impl GossipSub {
    pub fn new(config: GossipSubConfig, local_peer: PeerId) -> Self {
        let mcache = MessageCache::new(config.heartbeat_history, config.max_messages_per_window);
        Self {
            config,
            local_peer,
            seqno: 0,
            tick: 0,
            subscriptions: BTreeSet::new(),
            topics: BTreeMap::new(),
            fanout: BTreeMap::new(),
            peers: BTreeSet::new(),
            seen: LruCache::new(
                NonZeroUsize::new(SEEN_CACHE_CAPACITY).expect("capacity is non-zero"),
            ),
            mcache,
        }
    }

    /// Topics the local peer currently subscribes to.
    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    /// Current mesh members for a topic.
    pub fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.topics
            .get(topic)
            .map(|state| state.mesh.iter().copied().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    /// A gossip substream to `peer` became available. Announces the local
    /// subscription set so the peer can consider us for its meshes.
    pub fn add_peer(&mut self, peer: PeerId) -> Vec<(PeerId, Rpc)> {
        if !self.peers.insert(peer) {
            return Vec::new();
        }
        debug!(%peer, "gossip peer added");
        let mut outbox = Outbox::default();
        for topic in &self.subscriptions {
            outbox.subscription(peer, topic, true);
        }
        outbox.into_sends()
    }

    /// Connection to `peer` closed: scrub it from every set.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        for state in self.topics.values_mut() {
            state.mesh.remove(peer);
            state.subscribers.remove(peer);
        }
        self.topics.retain(|_, state| !state.is_empty());
        for state in self.fanout.values_mut() {
            state.peers.remove(peer);
        }
        debug!(%peer, "gossip peer removed");
    }

    // ------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------

    /// Join a topic: broadcast the subscription delta and graft up to
    /// `mesh_n` already-known subscribers. An under-provisioned mesh is
    /// corrected by later heartbeats.
    pub fn subscribe<R: RngCore + CryptoRng>(
        &mut self,
        topic: &str,
        rng: &mut R,
    ) -> Result<Vec<(PeerId, Rpc)>, GossipError> {
        if !is_valid_topic(topic) {
            return Err(GossipError::InvalidTopic);
        }
        if !self.subscriptions.insert(topic.to_string()) {
            return Ok(Vec::new());
        }
        let mut outbox = Outbox::default();
        for peer in &self.peers {
            outbox.subscription(*peer, topic, true);
        }

        let state = self.topics.entry(topic.to_string()).or_default();
        // Adopt fanout peers first: they are known-good routes.
        if let Some(fanout) = self.fanout.remove(topic) {
            for peer in fanout.peers {
                if state.mesh.len() >= self.config.mesh_n {
                    break;
                }
                state.mesh.insert(peer);
                outbox.graft(peer, topic);
            }
        }
        let candidates: Vec<PeerId> = state
            .subscribers
            .iter()
            .filter(|p| !state.mesh.contains(*p))
            .copied()
            .collect();
        let wanted = self.config.mesh_n.saturating_sub(state.mesh.len());
        for peer in sample(rng, candidates, wanted) {
            state.mesh.insert(peer);
            outbox.graft(peer, topic);
        }
        debug!(topic, mesh = state.mesh.len(), "subscribed");
        Ok(outbox.into_sends())
    }

    /// Leave a topic: broadcast the delta and prune the mesh.
    pub fn unsubscribe(&mut self, topic: &str) -> Result<Vec<(PeerId, Rpc)>, GossipError> {
        if !self.subscriptions.remove(topic) {
            return Err(GossipError::NotSubscribed);
        }
        let mut outbox = Outbox::default();
        for peer in &self.peers {
            outbox.subscription(*peer, topic, false);
        }
        if let Some(state) = self.topics.get_mut(topic) {
            for peer in std::mem::take(&mut state.mesh) {
                outbox.prune(peer, topic);
            }
        }
        debug!(topic, "unsubscribed");
        Ok(outbox.into_sends())
    }

    /// Publish `data` on `topic`.
    ///
    /// Delivery set: the mesh when subscribed (all known subscribers under
    /// flood-publish), otherwise the fanout, replenished to `mesh_n` and
    /// its TTL reset. With nobody to deliver to the message is dropped and
    /// [`GossipError::InsufficientPeers`] returned.
    pub fn publish<R: RngCore + CryptoRng>(
        &mut self,
        topic: &str,
        data: Vec<u8>,
        rng: &mut R,
    ) -> Result<(MessageId, Vec<(PeerId, Rpc)>), GossipError> {
        if !is_valid_topic(topic) {
            return Err(GossipError::InvalidTopic);
        }
        if data.len() > self.config.max_message_size {
            return Err(GossipError::TooLarge);
        }

        let recipients = self.delivery_set(topic, rng)?;

        self.seqno += 1;
        let msg = PubMessage {
            source: self.local_peer,
            data,
            seqno: self.seqno,
            topic: topic.to_string(),
        };
        let id = self.compute_id(&msg);
        self.seen.put(id, self.tick);
        if !self.mcache.put(id, msg.clone()) {
            // Delivery still proceeds; the message just cannot serve IWANTs.
            warn!(topic, "mcache window full, local publish not cached");
        }

        let mut outbox = Outbox::default();
        for peer in &recipients {
            outbox.message(*peer, msg.clone());
        }
        trace!(topic, seqno = msg.seqno, recipients = recipients.len(), "published");
        Ok((id, outbox.into_sends()))
    }

    /// Choose who receives a local publish, replenishing fanout if needed.
    fn delivery_set<R: RngCore + CryptoRng>(
        &mut self,
        topic: &str,
        rng: &mut R,
    ) -> Result<BTreeSet<PeerId>, GossipError> {
        if self.subscriptions.contains(topic) {
            let state = self.topics.get(topic).ok_or(GossipError::InsufficientPeers)?;
            let recipients: BTreeSet<PeerId> = if self.config.flood_publish {
                state.subscribers.union(&state.mesh).copied().collect()
            } else {
                state.mesh.clone()
            };
            if recipients.is_empty() {
                return Err(GossipError::InsufficientPeers);
            }
            return Ok(recipients);
        }

        // Not subscribed: route through fanout.
        let subscribers: Vec<PeerId> = self
            .topics
            .get(topic)
            .map(|state| state.subscribers.iter().copied().collect())
            .unwrap_or_default();
        let state = self.fanout.entry(topic.to_string()).or_insert(FanoutState {
            peers: BTreeSet::new(),
            last_publish_tick: self.tick,
        });
        state.last_publish_tick = self.tick;
        state.peers.retain(|p| subscribers.contains(p));
        let wanted = self.config.mesh_n.saturating_sub(state.peers.len());
        if wanted > 0 {
            let candidates: Vec<PeerId> = subscribers
                .iter()
                .filter(|p| !state.peers.contains(*p))
                .copied()
                .collect();
            for peer in sample(rng, candidates, wanted) {
                state.peers.insert(peer);
            }
        }
        if state.peers.is_empty() {
            self.fanout.remove(topic);
            return Err(GossipError::InsufficientPeers);
        }
        Ok(state.peers.clone())
    }

    // ------------------------------------------------------------------
    // Inbound RPC
    // ------------------------------------------------------------------

    /// Process one RPC envelope from `from`.
    pub fn handle_rpc(&mut self, from: PeerId, rpc: Rpc) -> GossipOutput {
        let mut outbox = Outbox::default();
        let mut events = Vec::new();

        for sub in rpc.subscriptions {
            self.handle_subscription(from, &sub);
        }
        for msg in rpc.publish {
            self.handle_message(from, msg, &mut outbox, &mut events);
        }
        self.handle_control(from, rpc.control, &mut outbox);

        GossipOutput {
            sends: outbox.into_sends(),
            events,
        }
    }

    fn handle_subscription(&mut self, from: PeerId, sub: &SubOpt) {
        if !is_valid_topic(&sub.topic) {
            trace!(%from, "ignoring subscription with invalid topic");
            return;
        }
        let state = self.topics.entry(sub.topic.clone()).or_default();
        if sub.subscribe {
            if state.subscribers.len() >= MAX_PEERS_PER_TOPIC && !state.subscribers.contains(&from)
            {
                warn!(topic = %sub.topic, "subscriber set full, dropping peer subscription");
                return;
            }
            state.subscribers.insert(from);
            trace!(%from, topic = %sub.topic, "peer subscribed");
        } else {
            state.subscribers.remove(&from);
            state.mesh.remove(&from);
            if state.is_empty() {
                self.topics.remove(&sub.topic);
            }
            trace!(%from, topic = %sub.topic, "peer unsubscribed");
        }
    }

    fn handle_message(
        &mut self,
        from: PeerId,
        msg: PubMessage,
        outbox: &mut Outbox,
        events: &mut Vec<GossipEvent>,
    ) {
        if msg.data.len() > self.config.max_message_size {
            debug!(%from, "dropping oversized message");
            return;
        }
        if !is_valid_topic(&msg.topic) {
            debug!(%from, "dropping message with invalid topic");
            return;
        }
        let id = self.compute_id(&msg);
        if self.is_seen(&id) {
            trace!(%from, "duplicate message dropped");
            return;
        }
        self.seen.put(id, self.tick);
        if !self.mcache.put(id, msg.clone()) {
            warn!(topic = %msg.topic, "mcache window full, dropping message");
            return;
        }

        if self.subscriptions.contains(&msg.topic) {
            events.push(GossipEvent::Message {
                topic: msg.topic.clone(),
                source: msg.source,
                data: msg.data.clone(),
                msg_id: id,
            });
        }

        // Forward along the mesh, never back toward where it came from.
        if let Some(state) = self.topics.get(&msg.topic) {
            for peer in &state.mesh {
                if *peer != from && *peer != msg.source {
                    outbox.message(*peer, msg.clone());
                }
            }
        }
    }

    fn handle_control(&mut self, from: PeerId, control: ControlBlock, outbox: &mut Outbox) {
        for topic in control.graft {
            self.handle_graft(from, &topic, outbox);
        }
        for topic in control.prune {
            if let Some(state) = self.topics.get_mut(&topic) {
                state.mesh.remove(&from);
                trace!(%from, topic = %topic, "pruned by peer");
            }
        }
        for (topic, ids) in control.ihave {
            self.handle_ihave(from, &topic, ids, outbox);
        }
        if !control.iwant.is_empty() {
            self.handle_iwant(from, control.iwant, outbox);
        }
    }

    fn handle_graft(&mut self, from: PeerId, topic: &str, outbox: &mut Outbox) {
        if !self.subscriptions.contains(topic) {
            outbox.prune(from, topic);
            return;
        }
        let state = self.topics.entry(topic.to_string()).or_default();
        if state.mesh.len() >= self.config.mesh_n_high {
            outbox.prune(from, topic);
            return;
        }
        // A graft implies the sender subscribes.
        state.subscribers.insert(from);
        state.mesh.insert(from);
        trace!(%from, topic, "grafted by peer");
    }

    fn handle_ihave(
        &mut self,
        from: PeerId,
        topic: &str,
        ids: Vec<MessageId>,
        outbox: &mut Outbox,
    ) {
        if !self.subscriptions.contains(topic) {
            return;
        }
        let mut wanted: Vec<MessageId> = Vec::new();
        for id in ids {
            if wanted.len() >= self.config.max_ihave_length {
                break;
            }
            if !self.is_seen(&id) && !self.mcache.contains(&id) {
                wanted.push(id);
            }
        }
        if !wanted.is_empty() {
            trace!(%from, topic, count = wanted.len(), "requesting advertised messages");
            outbox.rpc(from).control.iwant.extend(wanted);
        }
    }

    fn handle_iwant(&mut self, from: PeerId, ids: Vec<MessageId>, outbox: &mut Outbox) {
        let mut budget = MAX_IWANT_RESPONSE_BYTES;
        for id in ids {
            let Some(msg) = self.mcache.get(&id) else {
                continue;
            };
            if msg.data.len() > budget {
                debug!(%from, "iwant reply budget exhausted");
                break;
            }
            budget -= msg.data.len();
            outbox.message(from, msg.clone());
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    /// One maintenance tick: rebalance meshes, expire fanout, rotate the
    /// message cache and emit gossip.
    pub fn heartbeat<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Vec<(PeerId, Rpc)> {
        self.tick += 1;
        let mut outbox = Outbox::default();

        let subscribed: Vec<String> = self.subscriptions.iter().cloned().collect();
        for topic in &subscribed {
            self.maintain_mesh(topic, rng, &mut outbox);
        }

        // Expire fanout for topics with no recent publish.
        let ttl = self.config.fanout_ttl_ticks();
        let tick = self.tick;
        self.fanout.retain(|topic, state| {
            let keep = tick.saturating_sub(state.last_publish_tick) < ttl;
            if !keep {
                trace!(topic = %topic, "fanout expired");
            }
            keep
        });

        // Gossip about the recent windows, then rotate.
        for topic in &subscribed {
            self.emit_gossip(topic, rng, &mut outbox);
        }
        self.mcache.shift(self.config.heartbeat_history);

        outbox.into_sends()
    }

    /// Graft toward `mesh_n` when the mesh is thin, prune down to `mesh_n`
    /// when it is fat. Victims are chosen uniformly from the injected RNG.
    fn maintain_mesh<R: RngCore + CryptoRng>(
        &mut self,
        topic: &str,
        rng: &mut R,
        outbox: &mut Outbox,
    ) {
        let Some(state) = self.topics.get_mut(topic) else {
            return;
        };
        if state.mesh.len() < self.config.mesh_n_low {
            let candidates: Vec<PeerId> = state
                .subscribers
                .iter()
                .filter(|p| !state.mesh.contains(*p))
                .copied()
                .collect();
            let wanted = self.config.mesh_n.saturating_sub(state.mesh.len());
            let grafted = sample(rng, candidates, wanted);
            for peer in &grafted {
                state.mesh.insert(*peer);
                outbox.graft(*peer, topic);
            }
            if !grafted.is_empty() {
                debug!(topic, grafted = grafted.len(), mesh = state.mesh.len(), "mesh grafted");
            }
        } else if state.mesh.len() > self.config.mesh_n_high {
            let excess = state.mesh.len() - self.config.mesh_n;
            let members: Vec<PeerId> = state.mesh.iter().copied().collect();
            let pruned = sample(rng, members, excess);
            for peer in &pruned {
                state.mesh.remove(peer);
                outbox.prune(*peer, topic);
            }
            debug!(topic, pruned = pruned.len(), mesh = state.mesh.len(), "mesh pruned");
        }
    }

    /// Announce recent message ids to a few non-mesh subscribers.
    fn emit_gossip<R: RngCore + CryptoRng>(
        &mut self,
        topic: &str,
        rng: &mut R,
        outbox: &mut Outbox,
    ) {
        let mut ids = self.mcache.gossip_ids(topic, self.config.gossip_history);
        if ids.is_empty() {
            return;
        }
        ids.truncate(self.config.max_ihave_length);
        let Some(state) = self.topics.get(topic) else {
            return;
        };
        let candidates: Vec<PeerId> = state
            .subscribers
            .iter()
            .filter(|p| !state.mesh.contains(*p))
            .copied()
            .collect();
        for peer in sample(rng, candidates, self.config.gossip_lazy) {
            outbox
                .rpc(peer)
                .control
                .ihave
                .push((topic.to_string(), ids.clone()));
        }
    }

    /// Message identity under the configured derivation mode.
    fn compute_id(&self, msg: &PubMessage) -> MessageId {
        match self.config.message_id_mode {
            MessageIdMode::SourceSeqno => msg.id(),
            MessageIdMode::TopicPayload => payload_message_id(&msg.topic, &msg.data),
        }
    }

    /// Whether `id` is within the duplicate-suppression window.
    fn is_seen(&mut self, id: &MessageId) -> bool {
        let ttl = self.config.seen_ttl_ticks();
        match self.seen.get(id) {
            Some(seen_tick) => self.tick.saturating_sub(*seen_tick) <= ttl,
            None => false,
        }
    }
}

/// Uniform sample of up to `n` items, deterministic for a seeded RNG and
/// sorted input.
fn sample<R: RngCore + CryptoRng, T: Copy + Ord>(rng: &mut R, mut pool: Vec<T>, n: usize) -> Vec<T> {
    if pool.len() <= n {
        return pool;
    }
    pool.shuffle(rng);
    pool.truncate(n);
    pool.sort_unstable();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn peer(seed: u64) -> PeerId {
        Keypair::generate(&mut StdRng::seed_from_u64(seed)).peer_id()
    }

    fn engine(config: GossipSubConfig) -> (GossipSub, StdRng) {
        (
            GossipSub::new(config, peer(999)),
            StdRng::seed_from_u64(4242),
        )
    }

    fn sub_rpc(topic: &str) -> Rpc {
        Rpc {
            subscriptions: vec![SubOpt { subscribe: true, topic: topic.into() }],
            ..Default::default()
        }
    }

    fn msg_rpc(source: PeerId, seqno: u64, topic: &str, data: &[u8]) -> Rpc {
        Rpc {
            publish: vec![PubMessage {
                source,
                data: data.to_vec(),
                seqno,
                topic: topic.into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = GossipSubConfig::default();
        assert!(config.mesh_n_low <= config.mesh_n);
        assert!(config.mesh_n <= config.mesh_n_high);
        assert!(config.gossip_history <= config.heartbeat_history);
        assert!(config.heartbeat_interval_ms > 0);
        assert!(config.max_message_size > 0);
        assert!(config.max_ihave_length > 0);
    }

    #[test]
    fn subscribe_broadcasts_and_grafts_known_subscribers() {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        let a = peer(1);
        let b = peer(2);
        gs.add_peer(a);
        gs.add_peer(b);
        // Only `a` is known to subscribe to the topic.
        gs.handle_rpc(a, sub_rpc("news"));

        let sends = gs.subscribe("news", &mut rng).unwrap();
        // Both peers get the delta; `a` additionally gets a GRAFT.
        let to_a = sends.iter().find(|(p, _)| *p == a).map(|(_, r)| r).unwrap();
        let to_b = sends.iter().find(|(p, _)| *p == b).map(|(_, r)| r).unwrap();
        assert_eq!(to_a.subscriptions, vec![SubOpt { subscribe: true, topic: "news".into() }]);
        assert_eq!(to_a.control.graft, vec!["news".to_string()]);
        assert!(to_b.control.graft.is_empty());
        assert_eq!(gs.mesh_peers("news"), vec![a]);
    }

    #[test]
    fn subscribe_is_idempotent() {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        gs.subscribe("x", &mut rng).unwrap();
        assert!(gs.subscribe("x", &mut rng).unwrap().is_empty());
    }

    #[test]
    fn invalid_topics_rejected() {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        assert_eq!(gs.subscribe("", &mut rng), Err(GossipError::InvalidTopic));
        assert_eq!(
            gs.publish("\u{7}bell", vec![1], &mut rng).unwrap_err(),
            GossipError::InvalidTopic
        );
        assert_eq!(gs.unsubscribe("never"), Err(GossipError::NotSubscribed));
    }

    #[test]
    fn publish_without_any_route_is_insufficient() {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        gs.subscribe("lonely", &mut rng).unwrap();
        assert_eq!(
            gs.publish("lonely", b"hi".to_vec(), &mut rng).unwrap_err(),
            GossipError::InsufficientPeers
        );
    }

    #[test]
    fn publish_oversize_is_rejected() {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        let data = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert_eq!(
            gs.publish("t", data, &mut rng).unwrap_err(),
            GossipError::TooLarge
        );
    }

    #[test]
    fn publish_reaches_mesh_members() {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        let a = peer(1);
        gs.add_peer(a);
        gs.handle_rpc(a, sub_rpc("news"));
        gs.subscribe("news", &mut rng).unwrap();

        let (id, sends) = gs.publish("news", b"hello".to_vec(), &mut rng).unwrap();
        assert_eq!(sends.len(), 1);
        let (to, rpc) = &sends[0];
        assert_eq!(*to, a);
        assert_eq!(rpc.publish.len(), 1);
        assert_eq!(rpc.publish[0].id(), id);
        assert_eq!(rpc.publish[0].data, b"hello");
        // Seqnos increase monotonically.
        let (id2, _) = gs.publish("news", b"again".to_vec(), &mut rng).unwrap();
        assert_ne!(id, id2);
    }

    #[test]
    fn publish_unsubscribed_topic_uses_fanout_with_ttl() {
        let mut config = GossipSubConfig::default();
        config.fanout_ttl_ms = 2_000;
        config.heartbeat_interval_ms = 1_000;
        let (mut gs, mut rng) = engine(config);
        let a = peer(1);
        gs.add_peer(a);
        gs.handle_rpc(a, sub_rpc("remote"));

        let (_, sends) = gs.publish("remote", b"data".to_vec(), &mut rng).unwrap();
        assert_eq!(sends[0].0, a);
        assert!(gs.fanout.contains_key("remote"));

        // TTL elapses after two silent heartbeats.
        gs.heartbeat(&mut rng);
        gs.heartbeat(&mut rng);
        assert!(!gs.fanout.contains_key("remote"));
    }

    #[test]
    fn incoming_message_surfaces_once_and_forwards_along_mesh() {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        let sender = peer(1);
        let other = peer(2);
        let source = peer(3);
        for p in [sender, other] {
            gs.add_peer(p);
            gs.handle_rpc(p, sub_rpc("x"));
        }
        gs.subscribe("x", &mut rng).unwrap();
        assert_eq!(gs.mesh_peers("x").len(), 2);

        let output = gs.handle_rpc(sender, msg_rpc(source, 1, "x", b"payload"));
        assert_eq!(output.events.len(), 1);
        assert!(matches!(
            &output.events[0],
            GossipEvent::Message { topic, data, .. } if topic == "x" && data == b"payload"
        ));
        // Forwarded to the other mesh member, not back to the sender.
        assert_eq!(output.sends.len(), 1);
        assert_eq!(output.sends[0].0, other);

        // The same message arriving again (other connection) is silent.
        let output = gs.handle_rpc(other, msg_rpc(source, 1, "x", b"payload"));
        assert!(output.events.is_empty());
        assert!(output.sends.is_empty());
    }

    #[test]
    fn message_for_unsubscribed_topic_is_cached_but_not_surfaced() {
        let (mut gs, _rng) = engine(GossipSubConfig::default());
        let sender = peer(1);
        gs.add_peer(sender);
        let output = gs.handle_rpc(sender, msg_rpc(peer(3), 1, "other", b"data"));
        assert!(output.events.is_empty());
        // Still deduplicates on a second arrival.
        let output = gs.handle_rpc(sender, msg_rpc(peer(3), 1, "other", b"data"));
        assert!(output.events.is_empty());
    }

    #[test]
    fn graft_respects_mesh_ceiling() {
        let mut config = GossipSubConfig::default();
        config.mesh_n = 2;
        config.mesh_n_low = 1;
        config.mesh_n_high = 2;
        let (mut gs, mut rng) = engine(config);
        gs.subscribe("x", &mut rng).unwrap();

        let grafters: Vec<PeerId> = (1..=3).map(peer).collect();
        let mut pruned = 0;
        for p in &grafters {
            gs.add_peer(*p);
            let rpc = Rpc {
                control: ControlBlock { graft: vec!["x".into()], ..Default::default() },
                ..Default::default()
            };
            let output = gs.handle_rpc(*p, rpc);
            for (to, rpc) in output.sends {
                if rpc.control.prune.contains(&"x".to_string()) {
                    assert_eq!(to, *p);
                    pruned += 1;
                }
            }
        }
        assert_eq!(gs.mesh_peers("x").len(), 2);
        assert_eq!(pruned, 1, "third graft bounces off the full mesh");
    }

    #[test]
    fn graft_for_unsubscribed_topic_is_pruned() {
        let (mut gs, _rng) = engine(GossipSubConfig::default());
        let a = peer(1);
        gs.add_peer(a);
        let rpc = Rpc {
            control: ControlBlock { graft: vec!["nope".into()], ..Default::default() },
            ..Default::default()
        };
        let output = gs.handle_rpc(a, rpc);
        assert_eq!(output.sends.len(), 1);
        assert_eq!(output.sends[0].1.control.prune, vec!["nope".to_string()]);
    }

    #[test]
    fn prune_removes_sender_from_mesh() {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        let a = peer(1);
        gs.add_peer(a);
        gs.handle_rpc(a, sub_rpc("x"));
        gs.subscribe("x", &mut rng).unwrap();
        assert_eq!(gs.mesh_peers("x"), vec![a]);

        let rpc = Rpc {
            control: ControlBlock { prune: vec!["x".into()], ..Default::default() },
            ..Default::default()
        };
        gs.handle_rpc(a, rpc);
        assert!(gs.mesh_peers("x").is_empty());
    }

    #[test]
    fn ihave_triggers_iwant_only_for_unseen() {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        let a = peer(1);
        gs.add_peer(a);
        gs.subscribe("x", &mut rng).unwrap();

        // Seed one known message.
        let known = PubMessage { source: peer(3), data: b"k".to_vec(), seqno: 1, topic: "x".into() };
        let known_id = known.id();
        gs.handle_rpc(a, Rpc { publish: vec![known], ..Default::default() });

        let unknown_id = [0xEE; 32];
        let rpc = Rpc {
            control: ControlBlock {
                ihave: vec![("x".into(), vec![known_id, unknown_id])],
                ..Default::default()
            },
            ..Default::default()
        };
        let output = gs.handle_rpc(a, rpc);
        assert_eq!(output.sends.len(), 1);
        assert_eq!(output.sends[0].1.control.iwant, vec![unknown_id]);
    }

    #[test]
    fn iwant_served_from_mcache() {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        let a = peer(1);
        let b = peer(2);
        gs.add_peer(a);
        gs.add_peer(b);
        gs.handle_rpc(a, sub_rpc("x"));
        gs.subscribe("x", &mut rng).unwrap();
        let (id, _) = gs.publish("x", b"cached".to_vec(), &mut rng).unwrap();

        let rpc = Rpc {
            control: ControlBlock { iwant: vec![id, [0xAB; 32]], ..Default::default() },
            ..Default::default()
        };
        let output = gs.handle_rpc(b, rpc);
        assert_eq!(output.sends.len(), 1);
        let (to, reply) = &output.sends[0];
        assert_eq!(*to, b);
        assert_eq!(reply.publish.len(), 1, "unknown ids are skipped");
        assert_eq!(reply.publish[0].data, b"cached");
    }

    #[test]
    fn heartbeat_grafts_thin_mesh_up_to_target() {
        let mut config = GossipSubConfig::default();
        config.mesh_n = 3;
        config.mesh_n_low = 2;
        config.mesh_n_high = 4;
        let (mut gs, mut rng) = engine(config);
        gs.subscribe("x", &mut rng).unwrap();
        for seed in 1..=6 {
            let p = peer(seed);
            gs.add_peer(p);
            gs.handle_rpc(p, sub_rpc("x"));
        }
        assert!(gs.mesh_peers("x").is_empty());

        let sends = gs.heartbeat(&mut rng);
        assert_eq!(gs.mesh_peers("x").len(), 3);
        let grafts: usize = sends
            .iter()
            .filter(|(_, rpc)| rpc.control.graft.contains(&"x".to_string()))
            .count();
        assert_eq!(grafts, 3);
    }

    #[test]
    fn heartbeat_prunes_fat_mesh_down_to_target() {
        let mut config = GossipSubConfig::default();
        config.mesh_n = 2;
        config.mesh_n_low = 1;
        config.mesh_n_high = 3;
        let (mut gs, mut rng) = engine(config);
        gs.subscribe("x", &mut rng).unwrap();
        // Force an oversized mesh via grafts under a temporarily high ceiling.
        for seed in 1..=5 {
            let p = peer(seed);
            gs.add_peer(p);
            gs.handle_rpc(p, sub_rpc("x"));
            let state = gs.topics.get_mut("x").unwrap();
            state.mesh.insert(p);
        }
        assert_eq!(gs.mesh_peers("x").len(), 5);

        let sends = gs.heartbeat(&mut rng);
        assert_eq!(gs.mesh_peers("x").len(), 2);
        let prunes: usize = sends
            .iter()
            .filter(|(_, rpc)| rpc.control.prune.contains(&"x".to_string()))
            .count();
        assert_eq!(prunes, 3);
    }

    #[test]
    fn heartbeat_emits_ihave_to_non_mesh_subscribers() {
        let mut config = GossipSubConfig::default();
        config.mesh_n = 1;
        config.mesh_n_low = 1;
        config.mesh_n_high = 1;
        config.gossip_lazy = 2;
        config.flood_publish = false;
        let (mut gs, mut rng) = engine(config);
        let meshed = peer(1);
        gs.add_peer(meshed);
        gs.handle_rpc(meshed, sub_rpc("x"));
        gs.subscribe("x", &mut rng).unwrap();
        assert_eq!(gs.mesh_peers("x"), vec![meshed]);
        // Two more subscribers outside the mesh.
        for seed in [2, 3] {
            let p = peer(seed);
            gs.add_peer(p);
            gs.handle_rpc(p, sub_rpc("x"));
        }

        let (id, _) = gs.publish("x", b"fresh".to_vec(), &mut rng).unwrap();
        let sends = gs.heartbeat(&mut rng);
        let ihave_targets: Vec<PeerId> = sends
            .iter()
            .filter(|(_, rpc)| rpc.control.ihave.iter().any(|(t, ids)| t == "x" && ids.contains(&id)))
            .map(|(p, _)| *p)
            .collect();
        assert_eq!(ihave_targets.len(), 2);
        assert!(!ihave_targets.contains(&meshed), "mesh peers got the full message");
    }

    #[test]
    fn mcache_rotation_expires_old_ids_from_gossip() {
        let mut config = GossipSubConfig::default();
        config.gossip_history = 2;
        config.heartbeat_history = 3;
        let (mut gs, mut rng) = engine(config);
        let a = peer(1);
        gs.add_peer(a);
        gs.handle_rpc(a, sub_rpc("x"));
        gs.subscribe("x", &mut rng).unwrap();
        let (id, _) = gs.publish("x", b"old".to_vec(), &mut rng).unwrap();

        assert_eq!(gs.mcache.gossip_ids("x", 2), vec![id]);
        gs.heartbeat(&mut rng);
        assert_eq!(gs.mcache.gossip_ids("x", 2), vec![id]);
        gs.heartbeat(&mut rng);
        assert!(gs.mcache.gossip_ids("x", 2).is_empty(), "beyond gossip history");
        // Still retrievable for IWANT until heartbeat_history elapses.
        assert!(gs.mcache.contains(&id));
        gs.heartbeat(&mut rng);
        assert!(!gs.mcache.contains(&id));
    }

    #[test]
    fn remove_peer_scrubs_every_set()  {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        let a = peer(1);
        gs.add_peer(a);
        gs.handle_rpc(a, sub_rpc("x"));
        gs.subscribe("x", &mut rng).unwrap();
        gs.handle_rpc(a, sub_rpc("fan"));
        gs.publish("fan", b"d".to_vec(), &mut rng).unwrap();
        assert!(!gs.mesh_peers("x").is_empty());

        gs.remove_peer(&a);
        assert!(gs.mesh_peers("x").is_empty());
        assert!(gs.fanout.get("fan").map_or(true, |f| f.peers.is_empty()));
    }

    #[test]
    fn unsubscribe_broadcasts_and_prunes() {
        let (mut gs, mut rng) = engine(GossipSubConfig::default());
        let a = peer(1);
        gs.add_peer(a);
        gs.handle_rpc(a, sub_rpc("x"));
        gs.subscribe("x", &mut rng).unwrap();
        assert_eq!(gs.mesh_peers("x"), vec![a]);

        let sends = gs.unsubscribe("x").unwrap();
        let to_a = sends.iter().find(|(p, _)| *p == a).map(|(_, r)| r).unwrap();
        assert_eq!(
            to_a.subscriptions,
            vec![SubOpt { subscribe: false, topic: "x".into() }]
        );
        assert_eq!(to_a.control.prune, vec!["x".to_string()]);
        assert!(gs.mesh_peers("x").is_empty());
    }

    #[test]
    fn payload_id_mode_deduplicates_republished_content() {
        let mut config = GossipSubConfig::default();
        config.message_id_mode = MessageIdMode::TopicPayload;
        let (mut gs, _rng) = engine(config);
        let sender = peer(1);
        gs.add_peer(sender);
        gs.handle_rpc(sender, sub_rpc("x"));
        let mut rng = StdRng::seed_from_u64(1);
        gs.subscribe("x", &mut rng).unwrap();

        // The same payload republished under a fresh seqno keeps its id.
        let source = peer(3);
        let first = gs.handle_rpc(sender, msg_rpc(source, 1, "x", b"hello"));
        assert_eq!(first.events.len(), 1);
        let second = gs.handle_rpc(sender, msg_rpc(source, 2, "x", b"hello"));
        assert!(second.events.is_empty(), "replayed content is suppressed");
    }

    #[test]
    fn flood_publish_reaches_all_subscribers() {
        let mut config = GossipSubConfig::default();
        config.mesh_n = 1;
        config.mesh_n_low = 1;
        config.mesh_n_high = 1;
        config.flood_publish = true;
        let (mut gs, mut rng) = engine(config);
        for seed in 1..=4 {
            let p = peer(seed);
            gs.add_peer(p);
            gs.handle_rpc(p, sub_rpc("x"));
        }
        gs.subscribe("x", &mut rng).unwrap();
        assert_eq!(gs.mesh_peers("x").len(), 1);
        let (_, sends) = gs.publish("x", b"wide".to_vec(), &mut rng).unwrap();
        assert_eq!(sends.len(), 4, "flood publish covers every subscriber");
    }
}
