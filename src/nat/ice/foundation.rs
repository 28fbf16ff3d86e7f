// src/nat/ice/foundation.rs
//! Foundation calculation for ICE candidates (RFC 5245 Section 4.1.1.3)
//!
//! Two candidates share a foundation when they have the same type, base IP
//! address, transport and STUN server. The value is opaque to the peer; it
//! only needs to be stable for the lifetime of the agent.

use std::net::IpAddr;
use sha2::{Digest, Sha256};
use crate::nat::ice::candidate::{CandidateType, Transport};

/// Foundations are at most 32 ice-chars on the wire
const MAX_FOUNDATION_LENGTH: usize = 32;

/// Calculate foundation for a candidate
///
/// # Arguments
///
/// * `candidate_type` - The type of candidate (host, srflx, prflx, relay)
/// * `base_ip` - The base IP address for this candidate
/// * `transport` - The transport the candidate runs over
/// * `server_ip` - STUN server IP for server reflexive candidates
pub fn calculate_foundation(
    candidate_type: CandidateType,
    base_ip: &IpAddr,
    transport: Transport,
    server_ip: Option<&IpAddr>,
) -> String {
    let mut hasher = Sha256::new();

    hasher.update(candidate_type.to_str().as_bytes());
    hasher.update(transport.protocol().as_bytes());
    hasher.update(normalize_ip(base_ip).as_bytes());

    if candidate_type == CandidateType::ServerReflexive {
        if let Some(server) = server_ip {
            hasher.update(b"stun_server:");
            hasher.update(normalize_ip(server).as_bytes());
        }
    }

    let hash = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    let mut foundation = format!("{:x}", u64::from_be_bytes(prefix));
    foundation.truncate(MAX_FOUNDATION_LENGTH);
    foundation
}

/// IPv4-mapped IPv6 addresses hash like their IPv4 form
fn normalize_ip(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("ipv4:{}", v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => format!("ipv4:{}", v4),
            None => format!("ipv6:{}", v6),
        },
    }
}
