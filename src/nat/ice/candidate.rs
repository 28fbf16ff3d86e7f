// src/nat/ice/candidate.rs
//! ICE candidate representation and SDP `a=candidate` parsing

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use crate::nat::error::{IceError, IceResult};
use crate::nat::stun::StunSocket;
use super::foundation::calculate_foundation;
use super::priority::calculate_priority;

/// Transport of a candidate (RFC 6544 TCP types included for tagging only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// UDP
    Udp,
    /// TCP, active side
    TcpActive,
    /// TCP, passive side
    TcpPassive,
    /// TCP, simultaneous open
    TcpSo,
}

impl Transport {
    /// Protocol token used on the `a=candidate` line
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            _ => "TCP",
        }
    }

    /// `tcptype` token, if any
    pub fn tcp_type(&self) -> Option<&'static str> {
        match self {
            Self::Udp => None,
            Self::TcpActive => Some("active"),
            Self::TcpPassive => Some("passive"),
            Self::TcpSo => Some("so"),
        }
    }

    /// STUN over a stream transport is not retransmitted
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Self::Udp)
    }

    /// Whether a local candidate on `self` can be paired with a remote on `remote`
    pub fn is_compatible(&self, remote: Transport) -> bool {
        matches!(
            (self, remote),
            (Self::Udp, Self::Udp)
                | (Self::TcpActive, Self::TcpPassive)
                | (Self::TcpPassive, Self::TcpActive)
                | (Self::TcpSo, Self::TcpSo)
        )
    }
}

/// IP address, port and transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportAddress {
    /// IP address and port
    pub addr: SocketAddr,
    /// Transport protocol
    pub transport: Transport,
}

impl TransportAddress {
    /// UDP transport address
    pub fn udp(addr: SocketAddr) -> Self {
        Self { addr, transport: Transport::Udp }
    }

    /// IP address
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Port
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Same address family and compatible transport
    pub fn can_pair_with(&self, remote: &TransportAddress) -> bool {
        self.addr.is_ipv4() == remote.addr.is_ipv4() && self.transport.is_compatible(remote.transport)
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.transport.tcp_type().unwrap_or("udp"))
    }
}

/// ICE candidate type (RFC 5245 Section 4.1.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Host candidate (local address)
    Host,
    /// Server reflexive (from STUN)
    ServerReflexive,
    /// Peer reflexive (discovered during connectivity checks)
    PeerReflexive,
    /// Relayed candidate (TURN, never gathered here)
    Relay,
}

impl CandidateType {
    /// Token used on the `a=candidate` line
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }

    /// RFC 5245 Section 4.1.2.2 recommended type preferences
    pub fn preference(&self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }
}

impl FromStr for CandidateType {
    type Err = IceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            other => Err(IceError::Sdp(format!("invalid candidate type {:?}", other))),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// Transport address of the candidate
    pub address: TransportAddress,

    /// Candidate type
    pub typ: CandidateType,

    /// Base the candidate was derived from; equals `address` for host candidates
    pub base: TransportAddress,

    /// Equal for candidates sharing type, base IP, server and transport
    pub foundation: String,

    /// Component ID (1 for RTP, 2 for RTCP)
    pub component_id: u16,

    /// Priority (RFC 5245 Section 4.1.2)
    pub priority: u32,

    /// Related address (for reflexive candidates)
    pub related_address: Option<TransportAddress>,
}

impl Candidate {
    /// Create a new host candidate
    pub fn new_host(address: TransportAddress, component_id: u16, local_preference: u16) -> Self {
        Self {
            foundation: calculate_foundation(CandidateType::Host, &address.ip(), address.transport, None),
            priority: calculate_priority(CandidateType::Host, local_preference, component_id),
            address,
            typ: CandidateType::Host,
            base: address,
            component_id,
            related_address: None,
        }
    }

    /// Create server reflexive candidate learned from `server`
    pub fn new_server_reflexive(
        mapped: SocketAddr,
        base: &Candidate,
        server: &SocketAddr,
        local_preference: u16,
    ) -> Self {
        let address = TransportAddress { addr: mapped, transport: base.address.transport };
        Self {
            foundation: calculate_foundation(
                CandidateType::ServerReflexive,
                &base.address.ip(),
                address.transport,
                Some(&server.ip()),
            ),
            priority: calculate_priority(CandidateType::ServerReflexive, local_preference, base.component_id),
            address,
            typ: CandidateType::ServerReflexive,
            base: base.address,
            component_id: base.component_id,
            related_address: Some(base.address),
        }
    }

    /// Peer reflexive candidate for a mapping observed in a check response
    ///
    /// `priority` is the PRIORITY value that was sent in the request.
    pub fn new_peer_reflexive(mapped: SocketAddr, base: &Candidate, priority: u32) -> Self {
        let address = TransportAddress { addr: mapped, transport: base.address.transport };
        Self {
            foundation: calculate_foundation(
                CandidateType::PeerReflexive,
                &base.base.ip(),
                address.transport,
                None,
            ),
            priority,
            address,
            typ: CandidateType::PeerReflexive,
            base: base.base,
            component_id: base.component_id,
            related_address: Some(base.base),
        }
    }

    /// Remote peer reflexive candidate learned from an inbound check
    pub fn new_remote_peer_reflexive(source: TransportAddress, component_id: u16, priority: u32) -> Self {
        Self {
            // Arbitrary but unique per source, RFC 5245 Section 7.2.1.3
            foundation: calculate_foundation(CandidateType::PeerReflexive, &source.ip(), source.transport, None)
                + &format!("{:x}", source.port()),
            priority,
            address: source,
            typ: CandidateType::PeerReflexive,
            base: source,
            component_id,
            related_address: None,
        }
    }

    /// Transport address as a socket address
    pub fn addr(&self) -> SocketAddr {
        self.address.addr
    }

    /// Check if this is an IPv6 candidate
    pub fn is_ipv6(&self) -> bool {
        self.address.addr.is_ipv6()
    }

    /// Check if this is a host candidate
    pub fn is_host(&self) -> bool {
        self.typ == CandidateType::Host
    }

    /// Convert to SDP attribute value (without the leading `a=`)
    pub fn to_sdp_attribute(&self) -> String {
        let mut parts = vec![
            format!("candidate:{}", self.foundation),
            self.component_id.to_string(),
            self.address.transport.protocol().to_string(),
            self.priority.to_string(),
            self.address.ip().to_string(),
            self.address.port().to_string(),
            "typ".to_string(),
            self.typ.to_str().to_string(),
        ];

        if let Some(related) = &self.related_address {
            parts.extend_from_slice(&[
                "raddr".to_string(),
                related.ip().to_string(),
                "rport".to_string(),
                related.port().to_string(),
            ]);
        }

        if let Some(tcp_type) = self.address.transport.tcp_type() {
            parts.extend_from_slice(&["tcptype".to_string(), tcp_type.to_string()]);
        }

        parts.join(" ")
    }

    /// Parse from SDP attribute value; accepts `candidate:` with or without `a=`
    pub fn from_sdp_attribute(s: &str) -> IceResult<Self> {
        let s = s.trim().trim_start_matches("a=");
        let s = s
            .strip_prefix("candidate:")
            .ok_or_else(|| IceError::Sdp(format!("not a candidate line: {:?}", s)))?;
        let parts: Vec<&str> = s.split_whitespace().collect();

        if parts.len() < 7 {
            return Err(IceError::Sdp("truncated candidate line".to_string()));
        }

        let foundation = parts[0].to_string();
        let component_id: u16 = parts[1].parse()
            .map_err(|_| IceError::Sdp(format!("invalid component id {:?}", parts[1])))?;
        if !(1..=256).contains(&component_id) {
            return Err(IceError::Sdp(format!("component id {} out of range", component_id)));
        }

        let is_udp = match parts[2].to_ascii_uppercase().as_str() {
            "UDP" => true,
            "TCP" => false,
            other => return Err(IceError::Sdp(format!("invalid transport {:?}", other))),
        };

        let priority = parts[3].parse()
            .map_err(|_| IceError::Sdp(format!("invalid priority {:?}", parts[3])))?;
        let ip = parts[4].parse::<IpAddr>()
            .map_err(|_| IceError::Sdp(format!("invalid IP address {:?}", parts[4])))?;
        let port = parts[5].parse::<u16>()
            .map_err(|_| IceError::Sdp(format!("invalid port {:?}", parts[5])))?;

        if parts[6] != "typ" || parts.len() < 8 {
            return Err(IceError::Sdp("missing typ field".to_string()));
        }
        let typ: CandidateType = parts[7].parse()?;

        let mut related = None;
        let mut transport = if is_udp { Transport::Udp } else { Transport::TcpPassive };

        // Parse optional fields
        let mut i = 8;
        while i + 1 < parts.len() {
            match parts[i] {
                "raddr" if i + 3 < parts.len() && parts[i + 2] == "rport" => {
                    if let (Ok(rip), Ok(rport)) = (parts[i + 1].parse::<IpAddr>(), parts[i + 3].parse::<u16>()) {
                        related = Some(SocketAddr::new(rip, rport));
                    }
                    i += 4;
                }
                "tcptype" if !is_udp => {
                    transport = match parts[i + 1] {
                        "active" => Transport::TcpActive,
                        "so" => Transport::TcpSo,
                        _ => Transport::TcpPassive,
                    };
                    i += 2;
                }
                _ => i += 2,
            }
        }

        let address = TransportAddress { addr: SocketAddr::new(ip, port), transport };
        let related_address = related.map(|addr| TransportAddress { addr, transport });

        Ok(Self {
            address,
            typ,
            // A remote base is never observable; use the address itself
            base: address,
            foundation,
            component_id,
            priority,
            related_address,
        })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} c{} ({})", self.typ.to_str(), self.address, self.component_id, self.priority)
    }
}

/// A candidate gathered by this agent, together with the socket it sends from
///
/// Peer reflexive and server reflexive candidates share the socket of their base.
#[derive(Clone)]
pub struct LocalCandidate {
    /// The candidate
    pub candidate: Candidate,
    /// Socket of the candidate's base
    pub socket: Arc<StunSocket>,
}

impl LocalCandidate {
    /// Pair `candidate` with the socket it sends from
    pub fn new(candidate: Candidate, socket: Arc<StunSocket>) -> Self {
        Self { candidate, socket }
    }
}

impl fmt::Debug for LocalCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCandidate")
            .field("candidate", &self.candidate)
            .field("socket", &self.socket.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str, component: u16) -> Candidate {
        Candidate::new_host(TransportAddress::udp(addr.parse().unwrap()), component, 65535)
    }

    #[test]
    fn test_host_candidate() {
        let c = host("192.168.1.10:5000", 1);
        assert_eq!(c.typ, CandidateType::Host);
        assert_eq!(c.base, c.address);
        assert_eq!(c.priority, (126 << 24) | (65535 << 8) | 255);
    }

    #[test]
    fn test_sdp_round_trip() {
        let base = host("192.168.1.10:5000", 2);
        let server: SocketAddr = "198.51.100.7:3478".parse().unwrap();
        let srflx = Candidate::new_server_reflexive("203.0.113.4:62000".parse().unwrap(), &base, &server, 65535);

        let line = srflx.to_sdp_attribute();
        assert!(line.starts_with(&format!("candidate:{} 2 UDP ", srflx.foundation)));
        assert!(line.ends_with("typ srflx raddr 192.168.1.10 rport 5000"));

        let parsed = Candidate::from_sdp_attribute(&format!("a={}", line)).unwrap();
        assert_eq!(parsed.address, srflx.address);
        assert_eq!(parsed.foundation, srflx.foundation);
        assert_eq!(parsed.priority, srflx.priority);
        assert_eq!(parsed.related_address, srflx.related_address);
    }

    #[test]
    fn test_parse_tcp_candidate() {
        let c = Candidate::from_sdp_attribute(
            "candidate:1 1 TCP 2128609279 10.0.0.1 9 typ host tcptype active",
        ).unwrap();
        assert_eq!(c.address.transport, Transport::TcpActive);
        assert!(c.address.transport.is_reliable());
        assert!(c.address.transport.is_compatible(Transport::TcpPassive));
        assert!(!c.address.transport.is_compatible(Transport::Udp));
    }

    #[test]
    fn test_reject_bad_lines() {
        assert!(Candidate::from_sdp_attribute("candidate:1 1 UDP 1 10.0.0.1").is_err());
        assert!(Candidate::from_sdp_attribute("candidate:1 0 UDP 1 10.0.0.1 5 typ host").is_err());
        assert!(Candidate::from_sdp_attribute("candidate:1 1 SCTP 1 10.0.0.1 5 typ host").is_err());
        assert!(Candidate::from_sdp_attribute("candidate:1 1 UDP 1 10.0.0.1 5 typ bogus").is_err());
        assert!(Candidate::from_sdp_attribute("ice-ufrag:abcd").is_err());
    }

    #[test]
    fn test_family_and_transport_pairing() {
        let v4 = TransportAddress::udp("10.0.0.1:1".parse().unwrap());
        let v6 = TransportAddress::udp("[fe80::1]:1".parse().unwrap());
        assert!(v4.can_pair_with(&v4));
        assert!(!v4.can_pair_with(&v6));
    }

    #[test]
    fn test_peer_reflexive_keeps_base() {
        let base = host("10.0.0.1:4000", 1);
        let prflx = Candidate::new_peer_reflexive("203.0.113.9:4100".parse().unwrap(), &base, 1234);
        assert_eq!(prflx.base, base.address);
        assert_eq!(prflx.priority, 1234);
        assert_ne!(prflx.foundation, base.foundation);
    }
}
