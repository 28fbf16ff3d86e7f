// src/nat/ice/utils.rs
//! ICE utility functions

use std::net::IpAddr;
use rand::Rng;

/// Characters allowed in ice-ufrag / ice-pwd (RFC 5245 Section 15.4)
const ICE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Default length of a generated username fragment (minimum is 4)
pub const UFRAG_LENGTH: usize = 8;

/// Default length of a generated password (minimum is 22)
pub const PWD_LENGTH: usize = 24;

/// Check if IP address is link-local
pub fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80, // fe80::/10
    }
}

/// Check if IP address is loopback
pub fn is_loopback(ip: &IpAddr) -> bool {
    ip.is_loopback()
}

/// Check if IP address is private
pub fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00, // ULA fc00::/7
    }
}

/// Whether a host candidate may be gathered on `ip`
///
/// Loopback, link-local, multicast and unspecified addresses are skipped.
pub fn is_ice_candidate_address(ip: &IpAddr) -> bool {
    !is_loopback(ip) && !is_link_local(ip) && !ip.is_multicast() && !ip.is_unspecified()
}

/// Random string over the ice-char alphabet
pub fn random_ice_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ICE_CHARS[rng.gen_range(0..ICE_CHARS.len())] as char)
        .collect()
}

/// Fresh (ufrag, pwd) pair
pub fn generate_credentials() -> (String, String) {
    (random_ice_string(UFRAG_LENGTH), random_ice_string(PWD_LENGTH))
}

/// Tiebreaker drawn from the full 64-bit space
pub fn generate_tie_breaker() -> u64 {
    rand::thread_rng().gen::<u64>()
}

/// Whether `s` is a valid ufrag/pwd of at least `min` characters
pub fn is_valid_ice_string(s: &str, min: usize) -> bool {
    s.len() >= min && s.len() <= 256 && s.bytes().all(|b| ICE_CHARS.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_address_filter() {
        let usable = ["192.168.1.1", "10.0.0.1", "203.0.113.5", "2001:db8::1"];
        let skipped = ["127.0.0.1", "::1", "169.254.1.1", "fe80::1", "224.0.0.1", "ff02::1", "0.0.0.0", "::"];

        for ip in usable {
            assert!(is_ice_candidate_address(&ip.parse().unwrap()), "{} should be usable", ip);
        }
        for ip in skipped {
            assert!(!is_ice_candidate_address(&ip.parse().unwrap()), "{} should be skipped", ip);
        }
    }

    #[test]
    fn test_is_private() {
        assert!(is_private(&"192.168.1.1".parse().unwrap()));
        assert!(is_private(&"fd00::1".parse().unwrap()));
        assert!(!is_private(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_generated_credentials_are_valid() {
        let (ufrag, pwd) = generate_credentials();
        assert!(is_valid_ice_string(&ufrag, 4));
        assert!(is_valid_ice_string(&pwd, 22));
        assert_ne!(generate_credentials().1, pwd);
        assert!(!is_valid_ice_string("a b c d", 4));
    }
}
