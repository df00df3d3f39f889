//! # Wire Protocol Messages
//!
//! This module defines every wire message type Filament exchanges, plus the
//! codec primitives they share. All multi-byte protocol frames are
//! unsigned-varint length-prefixed, protobuf-shaped records; field numbers
//! follow the public libp2p schemas for the narrow overlap used.
//!
//! ## Protocol Types
//!
//! | Protocol | Type | Framing |
//! |----------|------|---------|
//! | GossipSub | [`Rpc`] | varint length prefix, protobuf body |
//! | Identify | [`IdentifyRecord`] | varint length prefix, protobuf body |
//! | Multistream | raw lines | varint length prefix, utf8, `0x0a` |
//!
//! ## Security Limits
//!
//! - [`MAX_WIRE_FRAME`]: maximum body size accepted by the frame decoder
//! - Decoders tolerate unknown fields (skipped) but reject truncated or
//!   overlong varints and mis-shaped required fields
//!
//! ## Message IDs
//!
//! PubSub messages are identified by a 32-byte [`MessageId`] computed as
//! `blake3(source || seqno-be)`, providing content-addressed deduplication.

use crate::identity::{PeerId, PEER_ID_LEN};

/// 32-byte content-derived message identifier.
pub type MessageId = [u8; 32];

/// Maximum accepted body size for a varint-framed record (1 MiB plus
/// framing slack). Larger frames are rejected before buffering.
pub const MAX_WIRE_FRAME: usize = 1024 * 1024 + 4096;

/// Compute a message id from its source and sequence number.
pub fn message_id(source: &PeerId, seqno: u64) -> MessageId {
    let mut input = [0u8; PEER_ID_LEN + 8];
    input[..PEER_ID_LEN].copy_from_slice(source.as_bytes());
    input[PEER_ID_LEN..].copy_from_slice(&seqno.to_be_bytes());
    *blake3::hash(&input).as_bytes()
}

/// Content-addressed message id over topic and payload, for deployments
/// that deduplicate identical publishes.
pub fn payload_message_id(topic: &str, data: &[u8]) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(topic.as_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

// ============================================================================
// Errors
// ============================================================================

/// Why a wire frame failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// A record ended mid-field or mid-varint.
    Truncated,
    /// A varint ran past its 10-byte maximum.
    VarintOverflow,
    /// A length prefix exceeded [`MAX_WIRE_FRAME`].
    FrameTooLarge,
    /// A field held a value of the wrong shape (bad utf8, wrong id length,
    /// unsupported wire type for the field).
    BadField,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated => write!(f, "record truncated"),
            WireError::VarintOverflow => write!(f, "varint exceeds 10 bytes"),
            WireError::FrameTooLarge => write!(f, "frame length exceeds limit"),
            WireError::BadField => write!(f, "malformed field"),
        }
    }
}

impl std::error::Error for WireError {}

// ============================================================================
// Unsigned varint
// ============================================================================

/// Append `value` as an unsigned LEB128 varint.
pub fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Decode an unsigned varint from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer ends before the varint does (stream
/// decoders wait for more bytes), `Ok(Some((value, consumed)))` otherwise.
pub fn read_uvarint(buf: &[u8]) -> Result<Option<(u64, usize)>, WireError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 10 {
            return Err(WireError::VarintOverflow);
        }
        // The 10th byte may only carry the final bit of a u64.
        if i == 9 && byte > 0x01 {
            return Err(WireError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Frame a record body: `uvarint(len) || body`.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    write_uvarint(&mut out, body.len() as u64);
    out.extend_from_slice(body);
    out
}

/// Split one varint-framed record off the front of `buf`.
///
/// Returns `Ok(None)` until a whole record is buffered, otherwise the body
/// and the total bytes consumed (prefix + body).
pub fn decode_frame(buf: &[u8]) -> Result<Option<(&[u8], usize)>, WireError> {
    let (len, prefix) = match read_uvarint(buf)? {
        Some(v) => v,
        None => return Ok(None),
    };
    let len = usize::try_from(len).map_err(|_| WireError::FrameTooLarge)?;
    if len > MAX_WIRE_FRAME {
        return Err(WireError::FrameTooLarge);
    }
    if buf.len() < prefix + len {
        return Ok(None);
    }
    Ok(Some((&buf[prefix..prefix + len], prefix + len)))
}

// ============================================================================
// Protobuf-shaped field codec
// ============================================================================

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Append a varint-typed field.
fn put_varint_field(buf: &mut Vec<u8>, field: u32, value: u64) {
    write_uvarint(buf, u64::from(field) << 3 | u64::from(WIRE_VARINT));
    write_uvarint(buf, value);
}

/// Append a length-delimited field.
fn put_bytes_field(buf: &mut Vec<u8>, field: u32, value: &[u8]) {
    write_uvarint(buf, u64::from(field) << 3 | u64::from(WIRE_LEN));
    write_uvarint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// One decoded field value.
enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

/// Cursor over a protobuf-shaped record, yielding (field number, value)
/// pairs and skipping wire types the caller has no use for.
struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take_uvarint(&mut self) -> Result<u64, WireError> {
        match read_uvarint(self.buf)? {
            Some((value, used)) => {
                self.buf = &self.buf[used..];
                Ok(value)
            }
            None => Err(WireError::Truncated),
        }
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < len {
            return Err(WireError::Truncated);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Next (field, value) pair, or `None` at end of record.
    fn next_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>, WireError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let key = self.take_uvarint()?;
        let field = u32::try_from(key >> 3).map_err(|_| WireError::BadField)?;
        let value = match (key & 0x07) as u8 {
            WIRE_VARINT => FieldValue::Varint(self.take_uvarint()?),
            WIRE_LEN => {
                let len = self.take_uvarint()?;
                let len = usize::try_from(len).map_err(|_| WireError::Truncated)?;
                FieldValue::Bytes(self.take_bytes(len)?)
            }
            // Skippable fixed-width types we never emit ourselves.
            WIRE_FIXED64 => {
                self.take_bytes(8)?;
                return self.next_field();
            }
            WIRE_FIXED32 => {
                self.take_bytes(4)?;
                return self.next_field();
            }
            _ => return Err(WireError::BadField),
        };
        Ok(Some((field, value)))
    }
}

fn utf8_field(bytes: &[u8]) -> Result<String, WireError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadField)
}

fn message_id_field(bytes: &[u8]) -> Result<MessageId, WireError> {
    bytes.try_into().map_err(|_| WireError::BadField)
}

// ============================================================================
// GossipSub RPC envelope
// ============================================================================

/// A subscription delta: subscribe or unsubscribe to one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubOpt {
    pub subscribe: bool,
    pub topic: String,
}

/// A full published message travelling through the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubMessage {
    /// Originating peer (message source, not the forwarding hop).
    pub source: PeerId,
    pub data: Vec<u8>,
    /// Per-source monotonic sequence number.
    pub seqno: u64,
    pub topic: String,
}

impl PubMessage {
    /// The content-derived id of this message.
    pub fn id(&self) -> MessageId {
        message_id(&self.source, self.seqno)
    }
}

/// Control frames piggybacked on an RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlBlock {
    /// (topic, advertised ids) per IHAVE.
    pub ihave: Vec<(String, Vec<MessageId>)>,
    pub iwant: Vec<MessageId>,
    pub graft: Vec<String>,
    pub prune: Vec<String>,
}

impl ControlBlock {
    pub fn is_empty(&self) -> bool {
        self.ihave.is_empty() && self.iwant.is_empty() && self.graft.is_empty() && self.prune.is_empty()
    }
}

/// The per-peer GossipSub RPC envelope.
///
/// Encode order is fixed: subscription deltas, then messages, then control,
/// so a peer always learns of a subscription before any message on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rpc {
    pub subscriptions: Vec<SubOpt>,
    pub publish: Vec<PubMessage>,
    pub control: ControlBlock,
}

impl Rpc {
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty() && self.publish.is_empty() && self.control.is_empty()
    }

    /// Encode the protobuf-shaped body (no length prefix).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for sub in &self.subscriptions {
            let mut inner = Vec::new();
            put_varint_field(&mut inner, 1, u64::from(sub.subscribe));
            put_bytes_field(&mut inner, 2, sub.topic.as_bytes());
            put_bytes_field(&mut buf, 1, &inner);
        }
        for msg in &self.publish {
            let mut inner = Vec::new();
            put_bytes_field(&mut inner, 1, msg.source.as_bytes());
            put_bytes_field(&mut inner, 2, &msg.data);
            put_bytes_field(&mut inner, 3, &msg.seqno.to_be_bytes());
            put_bytes_field(&mut inner, 4, msg.topic.as_bytes());
            put_bytes_field(&mut buf, 2, &inner);
        }
        if !self.control.is_empty() {
            let mut ctrl = Vec::new();
            for (topic, ids) in &self.control.ihave {
                let mut inner = Vec::new();
                put_bytes_field(&mut inner, 1, topic.as_bytes());
                for id in ids {
                    put_bytes_field(&mut inner, 2, id);
                }
                put_bytes_field(&mut ctrl, 1, &inner);
            }
            if !self.control.iwant.is_empty() {
                let mut inner = Vec::new();
                for id in &self.control.iwant {
                    put_bytes_field(&mut inner, 1, id);
                }
                put_bytes_field(&mut ctrl, 2, &inner);
            }
            for topic in &self.control.graft {
                let mut inner = Vec::new();
                put_bytes_field(&mut inner, 1, topic.as_bytes());
                put_bytes_field(&mut ctrl, 3, &inner);
            }
            for topic in &self.control.prune {
                let mut inner = Vec::new();
                put_bytes_field(&mut inner, 1, topic.as_bytes());
                put_bytes_field(&mut ctrl, 4, &inner);
            }
            put_bytes_field(&mut buf, 3, &ctrl);
        }
        buf
    }

    /// Decode a protobuf-shaped body (no length prefix).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut rpc = Rpc::default();
        let mut reader = FieldReader::new(bytes);
        while let Some((field, value)) = reader.next_field()? {
            match (field, value) {
                (1, FieldValue::Bytes(inner)) => rpc.subscriptions.push(decode_subopt(inner)?),
                (2, FieldValue::Bytes(inner)) => rpc.publish.push(decode_message(inner)?),
                (3, FieldValue::Bytes(inner)) => decode_control(inner, &mut rpc.control)?,
                // Unknown fields are tolerated for forward compatibility.
                _ => {}
            }
        }
        Ok(rpc)
    }
}

fn decode_subopt(bytes: &[u8]) -> Result<SubOpt, WireError> {
    let mut subscribe = false;
    let mut topic = None;
    let mut reader = FieldReader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        match (field, value) {
            (1, FieldValue::Varint(v)) => subscribe = v != 0,
            (2, FieldValue::Bytes(b)) => topic = Some(utf8_field(b)?),
            _ => {}
        }
    }
    Ok(SubOpt {
        subscribe,
        topic: topic.ok_or(WireError::BadField)?,
    })
}

fn decode_message(bytes: &[u8]) -> Result<PubMessage, WireError> {
    let mut source = None;
    let mut data = Vec::new();
    let mut seqno: u64 = 0;
    let mut topic = None;
    let mut reader = FieldReader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        match (field, value) {
            (1, FieldValue::Bytes(b)) => {
                let arr: [u8; PEER_ID_LEN] = b.try_into().map_err(|_| WireError::BadField)?;
                source = Some(PeerId::from_bytes(arr));
            }
            (2, FieldValue::Bytes(b)) => data = b.to_vec(),
            (3, FieldValue::Bytes(b)) => {
                if b.len() > 8 {
                    return Err(WireError::BadField);
                }
                let mut be = [0u8; 8];
                be[8 - b.len()..].copy_from_slice(b);
                seqno = u64::from_be_bytes(be);
            }
            (4, FieldValue::Bytes(b)) => topic = Some(utf8_field(b)?),
            _ => {}
        }
    }
    Ok(PubMessage {
        source: source.ok_or(WireError::BadField)?,
        data,
        seqno,
        topic: topic.ok_or(WireError::BadField)?,
    })
}

fn decode_control(bytes: &[u8], control: &mut ControlBlock) -> Result<(), WireError> {
    let mut reader = FieldReader::new(bytes);
    while let Some((field, value)) = reader.next_field()? {
        let FieldValue::Bytes(inner) = value else {
            continue;
        };
        match field {
            1 => {
                let mut topic = None;
                let mut ids = Vec::new();
                let mut sub = FieldReader::new(inner);
                while let Some((f, v)) = sub.next_field()? {
                    match (f, v) {
                        (1, FieldValue::Bytes(b)) => topic = Some(utf8_field(b)?),
                        (2, FieldValue::Bytes(b)) => ids.push(message_id_field(b)?),
                        _ => {}
                    }
                }
                control.ihave.push((topic.ok_or(WireError::BadField)?, ids));
            }
            2 => {
                let mut sub = FieldReader::new(inner);
                while let Some((f, v)) = sub.next_field()? {
                    if let (1, FieldValue::Bytes(b)) = (f, v) {
                        control.iwant.push(message_id_field(b)?);
                    }
                }
            }
            3 => {
                let mut sub = FieldReader::new(inner);
                while let Some((f, v)) = sub.next_field()? {
                    if let (1, FieldValue::Bytes(b)) = (f, v) {
                        control.graft.push(utf8_field(b)?);
                    }
                }
            }
            4 => {
                let mut sub = FieldReader::new(inner);
                while let Some((f, v)) = sub.next_field()? {
                    if let (1, FieldValue::Bytes(b)) = (f, v) {
                        control.prune.push(utf8_field(b)?);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ============================================================================
// Identify record
// ============================================================================

/// The one-shot identify payload: who a peer is and how to reach it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifyRecord {
    /// Canonical 32-byte Ed25519 public key.
    pub public_key: Vec<u8>,
    /// Multiaddrs the peer listens on, textual form.
    pub listen_addrs: Vec<String>,
    /// Protocols the peer speaks.
    pub protocols: Vec<String>,
    /// The sender's view of the remote address of this connection.
    pub observed_addr: String,
    /// Free-form agent string, e.g. `filament/0.1.0`.
    pub agent_version: String,
}

impl IdentifyRecord {
    /// Encode the protobuf-shaped body (no length prefix).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_bytes_field(&mut buf, 1, &self.public_key);
        for addr in &self.listen_addrs {
            put_bytes_field(&mut buf, 2, addr.as_bytes());
        }
        for protocol in &self.protocols {
            put_bytes_field(&mut buf, 3, protocol.as_bytes());
        }
        put_bytes_field(&mut buf, 4, self.observed_addr.as_bytes());
        put_bytes_field(&mut buf, 6, self.agent_version.as_bytes());
        buf
    }

    /// Decode a protobuf-shaped body (no length prefix).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut record = IdentifyRecord::default();
        let mut reader = FieldReader::new(bytes);
        while let Some((field, value)) = reader.next_field()? {
            let FieldValue::Bytes(b) = value else {
                continue;
            };
            match field {
                1 => record.public_key = b.to_vec(),
                2 => record.listen_addrs.push(utf8_field(b)?),
                3 => record.protocols.push(utf8_field(b)?),
                4 => record.observed_addr = utf8_field(b)?,
                6 => record.agent_version = utf8_field(b)?,
                _ => {}
            }
        }
        Ok(record)
    }
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

    #[test]
    fn uvarint_known_values() {
        let cases: [(u64, &[u8]); 5] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (300, &[0xac, 0x02]),
        ];
        for (value, bytes) in cases {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, value);
            assert_eq!(buf, bytes, "encoding {value}");
            assert_eq!(read_uvarint(&buf).unwrap(), Some((value, bytes.len())));
        }
    }

    #[test]
    fn uvarint_incomplete_waits() {
        assert_eq!(read_uvarint(&[0x80]).unwrap(), None);
        assert_eq!(read_uvarint(&[]).unwrap(), None);
    }

    #[test]
    fn uvarint_overlong_rejected() {
        let overlong = [0xff; 11];
        assert_eq!(read_uvarint(&overlong), Err(WireError::VarintOverflow));
    }

    #[test]
    fn frame_round_trip_and_partial() {
        let frame = encode_frame(b"hello");
        assert_eq!(decode_frame(&frame).unwrap(), Some((b"hello".as_slice(), 6)));
        // Partial delivery waits for the rest.
        assert_eq!(decode_frame(&frame[..3]).unwrap(), None);
    }

    #[test]
    fn frame_oversize_rejected() {
        let mut buf = Vec::new();
        write_uvarint(&mut buf, (MAX_WIRE_FRAME + 1) as u64);
        assert_eq!(decode_frame(&buf), Err(WireError::FrameTooLarge));
    }

    #[test]
    fn message_id_is_deterministic_and_source_bound() {
        let a = peer(1);
        let b = peer(2);
        assert_eq!(message_id(&a, 7), message_id(&a, 7));
        assert_ne!(message_id(&a, 7), message_id(&a, 8));
        assert_ne!(message_id(&a, 7), message_id(&b, 7));
    }

    #[test]
    fn rpc_round_trip_full_envelope() {
        let source = peer(3);
        let rpc = Rpc {
            subscriptions: vec![
                SubOpt { subscribe: true, topic: "news".into() },
                SubOpt { subscribe: false, topic: "weather".into() },
            ],
            publish: vec![PubMessage {
                source,
                data: b"hello mesh".to_vec(),
                seqno: 42,
                topic: "news".into(),
            }],
            control: ControlBlock {
                ihave: vec![("news".into(), vec![[0xAA; 32], [0xBB; 32]])],
                iwant: vec![[0xCC; 32]],
                graft: vec!["news".into()],
                prune: vec!["weather".into()],
            },
        };
        let decoded = Rpc::from_bytes(&rpc.to_bytes()).unwrap();
        assert_eq!(decoded, rpc);
    }

    #[test]
    fn rpc_empty_envelope() {
        let rpc = Rpc::default();
        assert!(rpc.is_empty());
        assert!(rpc.to_bytes().is_empty());
        assert_eq!(Rpc::from_bytes(&[]).unwrap(), rpc);
    }

    #[test]
    fn rpc_unknown_fields_skipped() {
        let source = peer(4);
        let rpc = Rpc {
            publish: vec![PubMessage {
                source,
                data: vec![1, 2, 3],
                seqno: 1,
                topic: "t".into(),
            }],
            ..Default::default()
        };
        let mut bytes = rpc.to_bytes();
        // Append an unknown length-delimited field (number 9).
        put_bytes_field(&mut bytes, 9, b"future extension");
        assert_eq!(Rpc::from_bytes(&bytes).unwrap(), rpc);
    }

    #[test]
    fn rpc_truncated_rejected() {
        let source = peer(5);
        let rpc = Rpc {
            publish: vec![PubMessage {
                source,
                data: vec![0; 64],
                seqno: 9,
                topic: "t".into(),
            }],
            ..Default::default()
        };
        let bytes = rpc.to_bytes();
        assert!(Rpc::from_bytes(&bytes[..bytes.len() - 5]).is_err());
    }

    #[test]
    fn rpc_bad_message_id_length_rejected() {
        let mut ctrl = Vec::new();
        let mut iwant = Vec::new();
        put_bytes_field(&mut iwant, 1, &[0u8; 16]); // wrong id length
        put_bytes_field(&mut ctrl, 2, &iwant);
        let mut body = Vec::new();
        put_bytes_field(&mut body, 3, &ctrl);
        assert_eq!(Rpc::from_bytes(&body), Err(WireError::BadField));
    }

    #[test]
    fn identify_round_trip() {
        let record = IdentifyRecord {
            public_key: vec![7; 32],
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/4001".into(), "/ip4/10.0.0.1/tcp/4001/ws".into()],
            protocols: vec!["/meshsub/1.1.0".into(), "/ipfs/ping/1.0.0".into()],
            observed_addr: "/ip4/8.8.8.8/tcp/55001".into(),
            agent_version: "filament/0.1.0".into(),
        };
        assert_eq!(IdentifyRecord::from_bytes(&record.to_bytes()).unwrap(), record);
    }
}
