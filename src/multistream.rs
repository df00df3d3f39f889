//! # Multistream-Select
//!
//! Line-oriented protocol negotiation run once per substream. Every line
//! on the wire is `uvarint length || utf8 || 0x0a`, with the newline
//! included in the length. Both sides open with the
//! [`HEADER`] line, then the dialer proposes protocol ids in preference
//! order and the listener echoes the first one it supports (or answers
//! [`NA`]).
//!
//! Negotiation consumes no application bytes: anything buffered past the
//! accepting line is handed back as `leftover` for the chosen protocol.
//!
//! Both ends are pure state machines: bytes in, `(poll, bytes-out)` out.

use crate::messages::{read_uvarint, write_uvarint};

/// Multistream-select protocol header.
pub const HEADER: &str = "/multistream/1.0.0";

/// Rejection reply.
pub const NA: &str = "na";

/// Cap on a single negotiation line; longer lines are malformed.
const MAX_LINE: usize = 1024;

// ============================================================================
// Errors
// ============================================================================

/// Why negotiation failed. All variants surface as a bad-negotiation
/// disconnect at the connection level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The peer's first line was not the multistream header.
    BadHeader,
    /// A line failed framing (overlong, missing newline, bad utf8).
    MalformedLine,
    /// The peer answered with something that is neither an echo nor `na`.
    UnexpectedReply(String),
}

impl std::fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationError::BadHeader => write!(f, "peer did not send multistream header"),
            NegotiationError::MalformedLine => write!(f, "malformed negotiation line"),
            NegotiationError::UnexpectedReply(line) => {
                write!(f, "unexpected negotiation reply '{line}'")
            }
        }
    }
}

impl std::error::Error for NegotiationError {}

// ============================================================================
// Line codec
// ============================================================================

/// Encode one negotiation line.
fn encode_line(line: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 3);
    write_uvarint(&mut out, (line.len() + 1) as u64);
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
    out
}

/// Reassembles lines from a byte stream, preserving any trailing bytes.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next whole line, or `None` until one is buffered.
    fn next_line(&mut self) -> Result<Option<String>, NegotiationError> {
        let (len, prefix) = match read_uvarint(&self.buf) {
            Ok(Some(v)) => v,
            Ok(None) => return Ok(None),
            Err(_) => return Err(NegotiationError::MalformedLine),
        };
        let len = len as usize;
        if len == 0 || len > MAX_LINE {
            return Err(NegotiationError::MalformedLine);
        }
        if self.buf.len() < prefix + len {
            return Ok(None);
        }
        let line: Vec<u8> = self.buf.drain(..prefix + len).skip(prefix).collect();
        if line.last() != Some(&b'\n') {
            return Err(NegotiationError::MalformedLine);
        }
        String::from_utf8(line[..len - 1].to_vec())
            .map(Some)
            .map_err(|_| NegotiationError::MalformedLine)
    }

    /// Hand back everything buffered past the consumed lines.
    fn take_leftover(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of feeding bytes into a negotiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    /// More bytes needed.
    Pending,
    /// Agreement on `protocol`; `leftover` bytes belong to it.
    Negotiated { protocol: String, leftover: Vec<u8> },
    /// The peer supports none of the proposals (dialer side only).
    Unsupported,
}

// ============================================================================
// Dialer
// ============================================================================

/// The proposing side. Sends the header and the first proposal
/// optimistically, then walks the proposal list on each `na`.
pub struct Dialer {
    proposals: std::vec::IntoIter<String>,
    current: Option<String>,
    saw_header: bool,
    lines: LineBuffer,
    done: bool,
}

impl Dialer {
    /// Create the dialer; the returned bytes open the negotiation.
    pub fn new(proposals: Vec<String>) -> (Self, Vec<u8>) {
        let mut proposals = proposals.into_iter();
        let current = proposals.next();
        let mut opening = encode_line(HEADER);
        if let Some(proposal) = &current {
            opening.extend(encode_line(proposal));
        }
        (
            Self {
                proposals,
                current,
                saw_header: false,
                lines: LineBuffer::default(),
                done: false,
            },
            opening,
        )
    }

    /// Feed peer bytes; returns progress and bytes to send back.
    pub fn on_bytes(&mut self, bytes: &[u8]) -> Result<(Poll, Vec<u8>), NegotiationError> {
        debug_assert!(!self.done, "dialer polled after completion");
        self.lines.push(bytes);
        let mut send = Vec::new();
        loop {
            let line = match self.lines.next_line()? {
                Some(line) => line,
                None => return Ok((Poll::Pending, send)),
            };
            if !self.saw_header {
                if line != HEADER {
                    return Err(NegotiationError::BadHeader);
                }
                self.saw_header = true;
                continue;
            }
            let current = match &self.current {
                Some(p) => p.clone(),
                None => return Err(NegotiationError::UnexpectedReply(line)),
            };
            if line == current {
                self.done = true;
                return Ok((
                    Poll::Negotiated {
                        protocol: current,
                        leftover: self.lines.take_leftover(),
                    },
                    send,
                ));
            }
            if line == NA {
                match self.proposals.next() {
                    Some(next) => {
                        send.extend(encode_line(&next));
                        self.current = Some(next);
                    }
                    None => {
                        self.done = true;
                        return Ok((Poll::Unsupported, send));
                    }
                }
                continue;
            }
            return Err(NegotiationError::UnexpectedReply(line));
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// The accepting side. Echoes the first supported proposal, answers `na`
/// to the rest.
pub struct Listener {
    supported: Vec<String>,
    saw_header: bool,
    lines: LineBuffer,
    done: bool,
}

impl Listener {
    /// Create the listener; the returned bytes are its header line.
    pub fn new(supported: Vec<String>) -> (Self, Vec<u8>) {
        (
            Self {
                supported,
                saw_header: false,
                lines: LineBuffer::default(),
                done: false,
            },
            encode_line(HEADER),
        )
    }

    /// Feed peer bytes; returns progress and bytes to send back.
    pub fn on_bytes(&mut self, bytes: &[u8]) -> Result<(Poll, Vec<u8>), NegotiationError> {
        debug_assert!(!self.done, "listener polled after completion");
        self.lines.push(bytes);
        let mut send = Vec::new();
        loop {
            let line = match self.lines.next_line()? {
                Some(line) => line,
                None => return Ok((Poll::Pending, send)),
            };
            if !self.saw_header {
                if line != HEADER {
                    return Err(NegotiationError::BadHeader);
                }
                self.saw_header = true;
                continue;
            }
            if self.supported.iter().any(|p| p == &line) {
                send.extend(encode_line(&line));
                self.done = true;
                return Ok((
                    Poll::Negotiated {
                        protocol: line,
                        leftover: self.lines.take_leftover(),
                    },
                    send,
                ));
            }
            send.extend(encode_line(NA));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive both ends to completion over a lossless in-memory pipe.
    fn negotiate(proposals: &[&str], supported: &[&str]) -> (Poll, Poll) {
        let (mut dialer, mut to_listener) =
            Dialer::new(proposals.iter().map(|s| s.to_string()).collect());
        let (mut listener, mut to_dialer) =
            Listener::new(supported.iter().map(|s| s.to_string()).collect());
        let mut dialer_poll = Poll::Pending;
        let mut listener_poll = Poll::Pending;
        for _ in 0..16 {
            if to_listener.is_empty() && to_dialer.is_empty() {
                break;
            }
            if listener_poll == Poll::Pending {
                let (poll, send) = listener.on_bytes(&to_listener).unwrap();
                listener_poll = poll;
                to_listener = Vec::new();
                to_dialer.extend(send);
            } else {
                to_listener.clear();
            }
            if dialer_poll == Poll::Pending {
                let (poll, send) = dialer.on_bytes(&to_dialer).unwrap();
                dialer_poll = poll;
                to_dialer = Vec::new();
                to_listener.extend(send);
            } else {
                to_dialer.clear();
            }
        }
        (dialer_poll, listener_poll)
    }

    #[test]
    fn second_proposal_accepted() {
        let (dialer, listener) = negotiate(&["/foo/1", "/bar/1"], &["/bar/1"]);
        assert_eq!(
            dialer,
            Poll::Negotiated { protocol: "/bar/1".into(), leftover: Vec::new() }
        );
        assert_eq!(
            listener,
            Poll::Negotiated { protocol: "/bar/1".into(), leftover: Vec::new() }
        );
    }

    #[test]
    fn first_proposal_accepted() {
        let (dialer, listener) = negotiate(&["/meshsub/1.1.0"], &["/meshsub/1.1.0", "/x/1"]);
        assert!(matches!(dialer, Poll::Negotiated { ref protocol, .. } if protocol == "/meshsub/1.1.0"));
        assert!(matches!(listener, Poll::Negotiated { ref protocol, .. } if protocol == "/meshsub/1.1.0"));
    }

    #[test]
    fn no_overlap_is_unsupported() {
        let (dialer, _) = negotiate(&["/foo/1", "/baz/1"], &["/bar/1"]);
        assert_eq!(dialer, Poll::Unsupported);
    }

    #[test]
    fn leftover_bytes_survive_negotiation() {
        let (mut dialer, opening) = Dialer::new(vec!["/echo/1".into()]);
        let (mut listener, header) = Listener::new(vec!["/echo/1".into()]);

        let (poll, reply) = listener.on_bytes(&opening).unwrap();
        assert!(matches!(poll, Poll::Negotiated { ref leftover, .. } if leftover.is_empty()));

        // The dialer's view: header + echo arrive together with early
        // application bytes appended by an eager peer.
        let mut stream = header;
        stream.extend(reply);
        stream.extend_from_slice(b"early app data");
        let (poll, send) = dialer.on_bytes(&stream).unwrap();
        assert!(send.is_empty());
        assert_eq!(
            poll,
            Poll::Negotiated {
                protocol: "/echo/1".into(),
                leftover: b"early app data".to_vec()
            }
        );
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let (mut dialer, opening) = Dialer::new(vec!["/a/1".into()]);
        let (mut listener, header) = Listener::new(vec!["/a/1".into()]);
        let mut listener_done = false;
        let mut reply = Vec::new();
        for &byte in &opening {
            let (poll, send) = listener.on_bytes(&[byte]).unwrap();
            reply.extend(send);
            if let Poll::Negotiated { .. } = poll {
                listener_done = true;
                break;
            }
        }
        assert!(listener_done);
        let mut stream = header;
        stream.extend(reply);
        let mut negotiated = false;
        for &byte in &stream {
            let (poll, _) = dialer.on_bytes(&[byte]).unwrap();
            if let Poll::Negotiated { protocol, .. } = poll {
                assert_eq!(protocol, "/a/1");
                negotiated = true;
                break;
            }
        }
        assert!(negotiated);
    }

    #[test]
    fn wrong_header_is_rejected() {
        let (mut dialer, _) = Dialer::new(vec!["/a/1".into()]);
        let bogus = encode_line("/multistream/9.9.9");
        assert_eq!(dialer.on_bytes(&bogus), Err(NegotiationError::BadHeader));
    }

    #[test]
    fn malformed_line_is_rejected() {
        let (mut listener, _) = Listener::new(vec!["/a/1".into()]);
        // Length prefix far beyond the line cap.
        let mut bogus = Vec::new();
        write_uvarint(&mut bogus, 40_000);
        assert_eq!(
            listener.on_bytes(&bogus),
            Err(NegotiationError::MalformedLine)
        );
    }

    #[test]
    fn missing_newline_is_rejected() {
        let (mut listener, _) = Listener::new(vec!["/a/1".into()]);
        let mut bogus = Vec::new();
        write_uvarint(&mut bogus, 5);
        bogus.extend_from_slice(b"abcde"); // no trailing newline
        assert_eq!(
            listener.on_bytes(&bogus),
            Err(NegotiationError::MalformedLine)
        );
    }
}
