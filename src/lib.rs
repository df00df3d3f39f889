//! # Filament - Sans-I/O Peer-to-Peer Networking Core
//!
//! Filament implements a minimal libp2p-family stack as pure state
//! machines:
//!
//! - **Identity**: Ed25519-based peer identities (32-byte public keys)
//! - **Transport security**: Noise XX handshake producing per-direction
//!   AEAD session ciphers
//! - **Negotiation**: multistream-select over framed substreams
//! - **Liveness & metadata**: ping and identify handlers
//! - **PubSub**: GossipSub mesh broadcast with message caching and
//!   heartbeat maintenance
//!
//! ## Architecture
//!
//! The core performs **no I/O**: no sockets, no timers, no clocks. Every
//! effect is returned as an [`Action`] for the host driver to execute and
//! every stimulus enters through an explicit input method:
//!
//! ```text
//! driver ──on_connection_opened──►┌───────┐──poll()──────────► Actions
//! driver ──on_data_received──────►│ Swarm │──drain_events()──► Events
//! driver ──on_timer──────────────►└───────┘
//! ```
//!
//! This keeps the core deterministic (all randomness flows from an
//! injected seed), synchronously testable, and portable to embedded and
//! browser hosts. The host must execute actions in poll order and never
//! re-enter the core from inside its own callbacks.
//!
//! ## Quick Start
//!
//! ```ignore
//! let mut swarm = Swarm::builder().rng_seed(seed).build();
//! swarm.listen("/ip4/0.0.0.0/tcp/4001")?;
//! swarm.subscribe("my-topic")?;
//!
//! loop {
//!     for action in swarm.poll() { /* dial, send, arm timers… */ }
//!     for event in swarm.drain_events() { /* messages, pongs… */ }
//!     // feed on_data_received / on_timer / on_connection_* as they occur
//! }
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `swarm` | Connection registry, dispatch, action/event queues |
//! | `identity` | Keypairs and PeerIds, base58 codec |
//! | `multiaddr` | Composite `/proto/value/…` addresses |
//! | `noise` | Noise XX handshake and session ciphers |
//! | `framed` | Length-prefixed record layer with AEAD upgrade |
//! | `multistream` | Protocol negotiation state machines |
//! | `ping` | Liveness probing with latency measurement |
//! | `identify` | One-shot peer metadata exchange |
//! | `gossipsub` | Mesh, message cache, heartbeat engine |
//! | `messages` | Wire message types and codecs |

mod framed;
mod gossipsub;
mod identify;
mod identity;
mod messages;
mod multiaddr;
mod multistream;
mod noise;
mod ping;
mod swarm;

pub use gossipsub::{GossipError, GossipSubConfig, MessageIdMode};
pub use identify::IdentifyInfo;
pub use identity::{KeyError, Keypair, PeerId};
pub use messages::MessageId;
pub use multiaddr::{AddrError, Multiaddr, Protocol};
pub use ping::PingConfig;
pub use swarm::{
    Action, ConnectionId, Direction, DisconnectReason, Event, Swarm, SwarmBuilder, SwarmConfig,
    SwarmError, TimerId,
};
