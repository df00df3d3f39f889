//! # Identify
//!
//! One-shot metadata exchange on every new secured connection. Each side
//! opens its own identify substream and pushes a single
//! [`IdentifyRecord`]; receiving the peer's record surfaces an
//! `Identified` event. There are no retries: a malformed record surfaces
//! once and the connection is otherwise unaffected.

use tracing::trace;

use crate::identity::{KeyError, PeerId};
use crate::messages::IdentifyRecord;
use crate::multiaddr::Multiaddr;

/// Protocol id negotiated for identify substreams.
pub const PROTOCOL_NAME: &str = "/ipfs/id/1.0.0";

/// Decoded, validated identify metadata as surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyInfo {
    /// Peer identity, validated from the record's public key.
    pub peer: PeerId,
    /// Addresses the peer claims to listen on. Unparseable entries are
    /// dropped rather than failing the exchange.
    pub listen_addrs: Vec<Multiaddr>,
    /// Protocols the peer speaks.
    pub protocols: Vec<String>,
    /// The peer's view of our address on this connection.
    pub observed_addr: Option<Multiaddr>,
    /// Free-form agent string.
    pub agent_version: String,
}

/// Build the record describing the local peer.
pub fn local_record(
    public_key: [u8; 32],
    listen_addrs: &[Multiaddr],
    observed_addr: &Multiaddr,
    protocols: &[String],
    agent_version: &str,
) -> IdentifyRecord {
    IdentifyRecord {
        public_key: public_key.to_vec(),
        listen_addrs: listen_addrs.iter().map(|a| a.to_string()).collect(),
        protocols: protocols.to_vec(),
        observed_addr: observed_addr.to_string(),
        agent_version: agent_version.to_string(),
    }
}

/// Validate a received record into typed info.
///
/// The public key must be a valid identity; claimed addresses are parsed
/// best-effort since a peer advertising one bad address should not void
/// the rest of its metadata.
pub fn decode_info(record: IdentifyRecord) -> Result<IdentifyInfo, KeyError> {
    let peer = PeerId::from_public_key(&record.public_key)?;
    let listen_addrs = record
        .listen_addrs
        .iter()
        .filter_map(|s| match Multiaddr::parse(s) {
            Ok(addr) => Some(addr),
            Err(e) => {
                trace!(addr = %s, error = %e, "dropping unparseable listen addr");
                None
            }
        })
        .collect();
    let observed_addr = Multiaddr::parse(&record.observed_addr).ok();
    Ok(IdentifyInfo {
        peer,
        listen_addrs,
        protocols: record.protocols,
        observed_addr,
        agent_version: record.agent_version,
    })
}
