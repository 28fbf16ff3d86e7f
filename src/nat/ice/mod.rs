// src/nat/ice/mod.rs
//! ICE (Interactive Connectivity Establishment), RFC 5245
//!
//! The implementation includes:
//! - Host and server reflexive candidate gathering
//! - Paced connectivity checks with triggered checks and peer reflexive discovery
//! - Regular and aggressive nomination, ICE-lite
//! - Role conflict resolution by tie-breaker
//! - Per-component datagram channels over the selected pairs
//!
//! ## Usage
//!
//! ```no_run
//! use sharp_ice::nat::ice::{IceAgent, IceConfig, IceRole, IceSocket};
//! # async fn demo() -> sharp_ice::nat::error::IceResult<()> {
//! let agent = IceAgent::builder(IceRole::Controlling)
//!     .config(IceConfig::default())
//!     .socket(IceSocket::new("video", 2))
//!     .build()
//!     .await?;
//!
//! // Send agent.local_description() to the peer, receive theirs
//! # let remote = agent.local_description();
//! agent.set_remote(&remote)?;
//! agent.start()?;
//! agent.wait_for_completion().await;
//!
//! let rtp = agent.channel(0, 1)?;
//! rtp.write(b"hello")?;
//! # Ok(())
//! # }
//! ```

pub mod candidate;
pub mod foundation;
pub mod priority;
pub mod utils;
pub mod config;
pub mod gathering;
pub mod check_list;
pub mod connectivity;
pub mod nomination;
pub mod events;
pub mod channel;
pub mod sdp;
pub mod agent;

// Re-export main types for convenience
pub use agent::{
    AgentStatsSnapshot, IceAgent, IceAgentBuilder, IceRole, IceSocket, IceStatus, SelectedPair,
};
pub use candidate::{Candidate, CandidateType, LocalCandidate, Transport, TransportAddress};
pub use channel::Channel;
pub use check_list::{CandidatePair, CandidatePairState, CheckList, CheckListState};
pub use config::IceConfig;
pub use events::{EventBus, IceEvent, Subscription};
pub use nomination::NominationMode;
pub use sdp::{MediaDescription, SessionDescription};
