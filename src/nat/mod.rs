// src/nat/mod.rs
//! NAT traversal: STUN, ICE and gateway port mapping

/// Error types shared by the STUN and ICE layers
pub mod error;
pub mod gateway;
pub mod stun;
pub mod ice;

pub use error::{IceError, IceResult, StunError};
pub use gateway::GatewayProber;
#[cfg(feature = "upnp")]
pub use gateway::UpnpGatewayProber;
