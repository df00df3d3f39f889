//! # Multiaddr
//!
//! Composite self-describing network addresses of the form
//! `/proto/value/proto/value/…`, e.g. `/ip4/127.0.0.1/tcp/4001/ws`.
//!
//! The protocol registry is closed: {ip4, ip6, tcp, udp, ws, wss, p2p,
//! dns}. Values are typed per protocol (dotted quad for `ip4`, `u16` port
//! for `tcp`/`udp`, base58 [`PeerId`] for `p2p`). Layering is enforced at
//! parse and construction time: `tcp`/`udp` must follow `ip4`/`ip6`/`dns`,
//! `ws`/`wss` must follow `tcp`.
//!
//! Parsing and [`std::fmt::Display`] are exact inverses for every valid
//! address; equality is structural on components.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::identity::PeerId;

// ============================================================================
// Errors
// ============================================================================

/// Why a multiaddr failed to parse or validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// The address string is empty or lacks the leading slash.
    BadFormat,
    /// A protocol name outside the closed registry.
    UnknownProtocol(String),
    /// A protocol that requires a value had none.
    MissingValue(&'static str),
    /// A value that does not parse for its protocol.
    BadValue(&'static str),
    /// A protocol in a position its layering rules forbid.
    BadLayering(&'static str),
}

impl std::fmt::Display for AddrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddrError::BadFormat => write!(f, "address must start with '/' and be non-empty"),
            AddrError::UnknownProtocol(p) => write!(f, "unknown protocol '{p}'"),
            AddrError::MissingValue(p) => write!(f, "protocol '{p}' requires a value"),
            AddrError::BadValue(p) => write!(f, "invalid value for protocol '{p}'"),
            AddrError::BadLayering(p) => write!(f, "protocol '{p}' not allowed at this layer"),
        }
    }
}

impl std::error::Error for AddrError {}

// ============================================================================
// Components
// ============================================================================

/// One typed (protocol, value) tuple of a multiaddr.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Tcp(u16),
    Udp(u16),
    Ws,
    Wss,
    P2p(PeerId),
    Dns(String),
}

impl Protocol {
    /// Registry name of this protocol.
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Ip4(_) => "ip4",
            Protocol::Ip6(_) => "ip6",
            Protocol::Tcp(_) => "tcp",
            Protocol::Udp(_) => "udp",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::P2p(_) => "p2p",
            Protocol::Dns(_) => "dns",
        }
    }

    /// Whether this component can legally follow `prev` (`None` = start).
    fn layering_ok(&self, prev: Option<&Protocol>) -> bool {
        match self {
            Protocol::Ip4(_) | Protocol::Ip6(_) | Protocol::Dns(_) => prev.is_none(),
            Protocol::Tcp(_) | Protocol::Udp(_) => matches!(
                prev,
                Some(Protocol::Ip4(_)) | Some(Protocol::Ip6(_)) | Some(Protocol::Dns(_))
            ),
            Protocol::Ws | Protocol::Wss => matches!(prev, Some(Protocol::Tcp(_))),
            // A peer id may terminate any transport stack.
            Protocol::P2p(_) => prev.is_some(),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Protocol::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Protocol::Tcp(port) => write!(f, "/tcp/{port}"),
            Protocol::Udp(port) => write!(f, "/udp/{port}"),
            Protocol::Ws => write!(f, "/ws"),
            Protocol::Wss => write!(f, "/wss"),
            Protocol::P2p(id) => write!(f, "/p2p/{}", id.encode_base58()),
            Protocol::Dns(name) => write!(f, "/dns/{name}"),
        }
    }
}

// ============================================================================
// Multiaddr
// ============================================================================

/// An ordered sequence of typed protocol components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    components: Vec<Protocol>,
}

impl Multiaddr {
    /// Build from components, enforcing layering rules.
    pub fn from_components(components: Vec<Protocol>) -> Result<Self, AddrError> {
        if components.is_empty() {
            return Err(AddrError::BadFormat);
        }
        let mut prev: Option<&Protocol> = None;
        for component in &components {
            if !component.layering_ok(prev) {
                return Err(AddrError::BadLayering(component.name()));
            }
            prev = Some(component);
        }
        Ok(Self { components })
    }

    /// Parse the textual form. Total on well-formed strings.
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        let mut segments = s.split('/');
        // A well-formed address starts with '/', so the first split item
        // is the empty string before it.
        if segments.next() != Some("") {
            return Err(AddrError::BadFormat);
        }
        let mut components = Vec::new();
        while let Some(name) = segments.next() {
            if name.is_empty() {
                return Err(AddrError::BadFormat);
            }
            let component = match name {
                "ip4" => {
                    let v = segments.next().ok_or(AddrError::MissingValue("ip4"))?;
                    Protocol::Ip4(v.parse().map_err(|_| AddrError::BadValue("ip4"))?)
                }
                "ip6" => {
                    let v = segments.next().ok_or(AddrError::MissingValue("ip6"))?;
                    Protocol::Ip6(v.parse().map_err(|_| AddrError::BadValue("ip6"))?)
                }
                "tcp" => {
                    let v = segments.next().ok_or(AddrError::MissingValue("tcp"))?;
                    Protocol::Tcp(v.parse().map_err(|_| AddrError::BadValue("tcp"))?)
                }
                "udp" => {
                    let v = segments.next().ok_or(AddrError::MissingValue("udp"))?;
                    Protocol::Udp(v.parse().map_err(|_| AddrError::BadValue("udp"))?)
                }
                "ws" => Protocol::Ws,
                "wss" => Protocol::Wss,
                "p2p" => {
                    let v = segments.next().ok_or(AddrError::MissingValue("p2p"))?;
                    Protocol::P2p(PeerId::decode_base58(v).map_err(|_| AddrError::BadValue("p2p"))?)
                }
                "dns" => {
                    let v = segments.next().ok_or(AddrError::MissingValue("dns"))?;
                    if v.is_empty() {
                        return Err(AddrError::BadValue("dns"));
                    }
                    Protocol::Dns(v.to_string())
                }
                other => return Err(AddrError::UnknownProtocol(other.to_string())),
            };
            components.push(component);
        }
        Self::from_components(components)
    }

    /// The typed components in order.
    pub fn components(&self) -> &[Protocol] {
        &self.components
    }

    /// The trailing `/p2p/…` peer id, if present.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.components.last() {
            Some(Protocol::P2p(id)) => Some(*id),
            _ => None,
        }
    }

    /// Append a component, enforcing layering against the current tail.
    pub fn push(&mut self, component: Protocol) -> Result<(), AddrError> {
        if !component.layering_ok(self.components.last()) {
            return Err(AddrError::BadLayering(component.name()));
        }
        self.components.push(component);
        Ok(())
    }
}

impl std::fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for component in &self.components {
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

impl FromStr for Multiaddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn parse_display_round_trip() {
        let id = Keypair::generate(&mut StdRng::seed_from_u64(3)).peer_id();
        let cases = vec![
            "/ip4/127.0.0.1/tcp/4001".to_string(),
            "/ip4/10.0.0.2/tcp/443/wss".to_string(),
            "/ip6/::1/udp/9000".to_string(),
            "/dns/bootstrap.example.org/tcp/4001/ws".to_string(),
            format!("/ip4/192.168.1.4/tcp/4001/p2p/{}", id.encode_base58()),
        ];
        for case in cases {
            let addr = Multiaddr::parse(&case).unwrap_or_else(|e| panic!("{case}: {e}"));
            assert_eq!(addr.to_string(), case);
            assert_eq!(Multiaddr::parse(&addr.to_string()).unwrap(), addr);
        }
    }

    #[test]
    fn typed_components() {
        let addr = Multiaddr::parse("/ip4/127.0.0.1/tcp/8080/ws").unwrap();
        assert_eq!(
            addr.components(),
            &[
                Protocol::Ip4(Ipv4Addr::new(127, 0, 0, 1)),
                Protocol::Tcp(8080),
                Protocol::Ws,
            ]
        );
    }

    #[test]
    fn peer_id_extraction() {
        let id = Keypair::generate(&mut StdRng::seed_from_u64(5)).peer_id();
        let addr =
            Multiaddr::parse(&format!("/ip4/1.2.3.4/tcp/1/p2p/{}", id.encode_base58())).unwrap();
        assert_eq!(addr.peer_id(), Some(id));
        assert_eq!(Multiaddr::parse("/ip4/1.2.3.4/tcp/1").unwrap().peer_id(), None);
    }

    #[test]
    fn push_enforces_layering() {
        let id = Keypair::generate(&mut StdRng::seed_from_u64(6)).peer_id();
        let mut addr = Multiaddr::parse("/ip4/1.2.3.4/tcp/4001").unwrap();
        addr.push(Protocol::P2p(id)).unwrap();
        assert_eq!(addr.peer_id(), Some(id));
        assert_eq!(
            addr.push(Protocol::Ws),
            Err(AddrError::BadLayering("ws"))
        );
    }

    #[test]
    fn layering_violations_rejected() {
        assert_eq!(
            Multiaddr::parse("/tcp/80"),
            Err(AddrError::BadLayering("tcp"))
        );
        assert_eq!(
            Multiaddr::parse("/ip4/1.2.3.4/ws"),
            Err(AddrError::BadLayering("ws"))
        );
        assert_eq!(
            Multiaddr::parse("/ip4/1.2.3.4/udp/1/ws"),
            Err(AddrError::BadLayering("ws"))
        );
        assert_eq!(
            Multiaddr::parse("/ip4/1.2.3.4/ip4/5.6.7.8"),
            Err(AddrError::BadLayering("ip4"))
        );
    }

    #[test]
    fn malformed_values_rejected() {
        assert_eq!(
            Multiaddr::parse("/ip4/999.0.0.1/tcp/80"),
            Err(AddrError::BadValue("ip4"))
        );
        assert_eq!(
            Multiaddr::parse("/ip4/1.2.3.4/tcp/70000"),
            Err(AddrError::BadValue("tcp"))
        );
        assert_eq!(
            Multiaddr::parse("/ip4/1.2.3.4/tcp"),
            Err(AddrError::MissingValue("tcp"))
        );
        assert_eq!(
            Multiaddr::parse("/quic/1"),
            Err(AddrError::UnknownProtocol("quic".into()))
        );
        assert_eq!(Multiaddr::parse(""), Err(AddrError::BadFormat));
        assert_eq!(Multiaddr::parse("ip4/1.2.3.4"), Err(AddrError::BadFormat));
        assert_eq!(Multiaddr::parse("/"), Err(AddrError::BadFormat));
    }
}
