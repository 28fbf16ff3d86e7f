// src/nat/ice/priority.rs
//! ICE priority arithmetic (RFC 5245 Sections 4.1.2 and 5.7.2)

use super::candidate::CandidateType;

/// Maximum values for validation
pub const MAX_LOCAL_PREFERENCE: u16 = 65535;
/// Highest component id
pub const MAX_COMPONENT_ID: u16 = 256;

/// Calculate candidate priority
///
/// priority = (2^24)*(type preference) +
///            (2^8)*(local preference) +
///            (2^0)*(256 - component ID)
pub fn calculate_priority(candidate_type: CandidateType, local_preference: u16, component_id: u16) -> u32 {
    let component = component_id.clamp(1, MAX_COMPONENT_ID) as u32;
    (candidate_type.preference() << 24) | ((local_preference as u32) << 8) | (256 - component)
}

/// Priority a peer reflexive candidate learned from this check would get
///
/// Carried in the PRIORITY attribute of every connectivity check.
pub fn calculate_prflx_priority(local_preference: u16, component_id: u16) -> u32 {
    calculate_priority(CandidateType::PeerReflexive, local_preference, component_id)
}

/// Local preference encoded in a candidate priority
pub fn local_preference_of(priority: u32) -> u16 {
    ((priority >> 8) & 0xFFFF) as u16
}

/// Calculate pair priority
///
/// 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0), where G is the controlling
/// agent's candidate priority and D the controlled agent's.
pub fn calculate_pair_priority(controlling: u32, controlled: u32) -> u64 {
    let g = controlling as u64;
    let d = controlled as u64;
    (g.min(d) << 32) + 2 * g.max(d) + u64::from(g > d)
}

/// Local preference for the `index`-th usable interface; earlier interfaces rank higher
pub fn interface_local_preference(index: usize) -> u16 {
    MAX_LOCAL_PREFERENCE.saturating_sub(index.min(MAX_LOCAL_PREFERENCE as usize) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_priority() {
        assert_eq!(calculate_priority(CandidateType::Host, 65535, 1), 0x7EFF_FFFF);
        assert_eq!(calculate_priority(CandidateType::ServerReflexive, 65535, 2), (100 << 24) | (65535 << 8) | 254);
        assert_eq!(calculate_priority(CandidateType::Relay, 0, 256), 0);
        assert_eq!(calculate_prflx_priority(65535, 1), (110 << 24) | (65535 << 8) | 255);
        assert_eq!(local_preference_of(calculate_priority(CandidateType::Host, 1234, 2)), 1234);
    }

    #[test]
    fn test_type_ordering() {
        let host = calculate_priority(CandidateType::Host, 0, 1);
        let prflx = calculate_priority(CandidateType::PeerReflexive, 65535, 1);
        let srflx = calculate_priority(CandidateType::ServerReflexive, 65535, 1);
        assert!(host > prflx && prflx > srflx);
    }

    #[test]
    fn test_pair_priority_formula() {
        let g = 2_130_706_431u32;
        let d = 1_694_498_815u32;
        assert_eq!(
            calculate_pair_priority(g, d),
            (1u64 << 32) * d as u64 + 2 * g as u64 + 1
        );
        assert_eq!(
            calculate_pair_priority(d, g),
            (1u64 << 32) * d as u64 + 2 * g as u64
        );
    }

    #[test]
    fn test_pair_priority_symmetric_between_agents() {
        // Both agents compute the same value for the same pair
        let (a, b) = (1_862_270_975u32, 2_113_937_151u32);
        let seen_by_controlling = calculate_pair_priority(a, b);
        let seen_by_controlled = calculate_pair_priority(a, b);
        assert_eq!(seen_by_controlling, seen_by_controlled);
        assert_ne!(calculate_pair_priority(a, b), calculate_pair_priority(b, a));
    }

    #[test]
    fn test_pair_priority_monotone() {
        let mut last = 0u64;
        for local in (1u32..1_000_000).step_by(99_991) {
            let p = calculate_pair_priority(local, 500_000);
            assert!(p > last);
            last = p;
        }
    }

    #[test]
    fn test_interface_local_preference() {
        assert_eq!(interface_local_preference(0), 65535);
        assert_eq!(interface_local_preference(3), 65532);
        assert_eq!(interface_local_preference(usize::MAX), 0);
    }
}
