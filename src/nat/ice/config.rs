// src/nat/ice/config.rs
//! ICE agent configuration

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::nat::error::{IceError, IceResult};
use crate::nat::stun::TransactionConfig;
use super::nomination::NominationMode;

/// ICE agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN servers as `host:port`, resolved at gathering time
    pub stun_servers: Vec<String>,

    /// Pacing timer Ta in milliseconds
    pub ta_ms: u32,

    /// Initial STUN retransmission timeout in milliseconds
    pub rto_ms: u32,

    /// Maximum STUN transmissions per transaction (Rc)
    pub rc: u32,

    /// Final wait multiplier after the last transmission (Rm)
    pub rm: u32,

    /// Upper bound on a single transaction in milliseconds
    pub max_transaction_ms: u32,

    /// Upper bound on one server reflexive or gateway lookup in milliseconds
    pub gather_timeout_ms: u32,

    /// Only gather host candidates; no STUN servers or gateway probes
    pub local_only: bool,

    /// Nomination mode used when controlling
    pub nomination: NominationMode,

    /// Interval between binding indications on selected pairs, 0 disables
    pub keepalive_s: u32,

    /// Explicit host addresses; empty enumerates interfaces.
    /// Listed addresses are used as-is, loopback included.
    pub host_addresses: Vec<IpAddr>,

    /// Checks allowed in flight at once per agent
    pub max_concurrent_checks: usize,

    /// Datagrams buffered per component before the oldest is dropped
    pub queue_capacity: usize,

    /// Upper bound on pairs per check list
    pub max_pairs: usize,

    /// SOFTWARE attribute placed on responses
    pub software: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
            ],
            ta_ms: 20,
            rto_ms: 500,
            rc: 7,
            rm: 16,
            max_transaction_ms: 39_500,
            gather_timeout_ms: 5_000,
            local_only: false,
            nomination: NominationMode::Regular,
            keepalive_s: 15,
            host_addresses: Vec::new(),
            max_concurrent_checks: 10,
            queue_capacity: 256,
            max_pairs: 100,
            software: Some(format!("sharp-ice {}", crate::VERSION)),
        }
    }
}

impl IceConfig {
    /// Host-only configuration, as used between peers on one machine or LAN
    pub fn local_only() -> Self {
        Self {
            local_only: true,
            stun_servers: Vec::new(),
            ..Default::default()
        }
    }

    /// Load from a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> IceResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| IceError::Configuration(format!("invalid JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> IceResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| IceError::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Reject values the agent cannot run with
    pub fn validate(&self) -> IceResult<()> {
        if self.ta_ms == 0 {
            return Err(IceError::Configuration("ta_ms must be positive".to_string()));
        }
        if self.rto_ms == 0 {
            return Err(IceError::Configuration("rto_ms must be positive".to_string()));
        }
        if self.gather_timeout_ms == 0 {
            return Err(IceError::Configuration("gather_timeout_ms must be positive".to_string()));
        }
        if self.rc == 0 {
            return Err(IceError::Configuration("rc must allow at least one transmission".to_string()));
        }
        if self.max_concurrent_checks == 0 {
            return Err(IceError::Configuration("max_concurrent_checks must be positive".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(IceError::Configuration("queue_capacity must be positive".to_string()));
        }
        if self.max_pairs == 0 {
            return Err(IceError::Configuration("max_pairs must be positive".to_string()));
        }
        Ok(())
    }

    /// Pacing timer Ta
    pub fn ta(&self) -> Duration {
        Duration::from_millis(self.ta_ms as u64)
    }

    /// Time allowed for one server reflexive lookup
    ///
    /// Never longer than a whole STUN transaction.
    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms.min(self.max_transaction_ms) as u64)
    }

    /// Keepalive period, `None` when disabled
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_s > 0).then(|| Duration::from_secs(self.keepalive_s as u64))
    }

    /// Retransmission settings for sockets owned by the agent
    pub fn transaction_config(&self) -> TransactionConfig {
        TransactionConfig {
            rto: Duration::from_millis(self.rto_ms as u64),
            max_transmissions: self.rc,
            final_multiplier: self.rm,
            max_duration: Duration::from_millis(self.max_transaction_ms as u64),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IceConfig::default();
        assert_eq!(config.ta_ms, 20);
        assert_eq!(config.rto_ms, 500);
        assert_eq!(config.rc, 7);
        assert_eq!(config.keepalive_s, 15);
        assert_eq!(config.nomination, NominationMode::Regular);
        assert!(!config.local_only);
        assert!(config.validate().is_ok());

        let tx = config.transaction_config();
        assert_eq!(tx.rto, Duration::from_millis(500));
        assert_eq!(tx.max_transmissions, 7);
        assert_eq!(tx.final_multiplier, 16);
        assert_eq!(config.gather_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_gather_timeout_follows_config() {
        let config = IceConfig::from_json(r#"{ "gather_timeout_ms": 250 }"#).unwrap();
        assert_eq!(config.gather_timeout(), Duration::from_millis(250));

        let capped = IceConfig { gather_timeout_ms: 60_000, max_transaction_ms: 2_000, ..Default::default() };
        assert_eq!(capped.gather_timeout(), Duration::from_secs(2));

        assert!(IceConfig::from_json(r#"{ "gather_timeout_ms": 0 }"#).is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let config = IceConfig::from_json(
            r#"{ "local_only": true, "nomination": "aggressive", "host_addresses": ["127.0.0.1"] }"#,
        ).unwrap();
        assert!(config.local_only);
        assert_eq!(config.nomination, NominationMode::Aggressive);
        assert_eq!(config.host_addresses, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.ta_ms, 20);
    }

    #[test]
    fn test_validation() {
        assert!(IceConfig::from_json(r#"{ "rc": 0 }"#).is_err());
        assert!(IceConfig::from_json(r#"{ "ta_ms": 0 }"#).is_err());
        assert!(IceConfig::from_json("not json").is_err());
        assert!(IceConfig { keepalive_s: 0, ..Default::default() }.keepalive_interval().is_none());
    }
}
