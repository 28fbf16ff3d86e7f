// src/nat/stun/mod.rs
//! STUN (Session Traversal Utilities for NAT), RFC 5389
//!
//! ## Layers
//! - [`protocol`]: bit-exact message codec with the ICE attributes
//!   (PRIORITY, USE-CANDIDATE, ICE-CONTROLLING, ICE-CONTROLLED)
//! - [`transaction`]: retransmitting request/response engine with
//!   transaction-id correlation and single-shot waiters
//! - [`socket`]: a bound UDP socket that demultiplexes STUN from
//!   application datagrams
//!
//! ## Usage Examples
//!
//! ```no_run
//! use sharp_ice::nat::stun::{Message, StunSocket, TransactionConfig};
//! # async fn demo() -> sharp_ice::nat::error::IceResult<()> {
//! let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
//! let socket = StunSocket::bind(0, "0.0.0.0:0".parse().unwrap(), TransactionConfig::default(), tx).await?;
//! let reply = socket
//!     .engine()
//!     .send_request("198.51.100.1:3478".parse().unwrap(), &Message::binding_request(), None)
//!     .await?;
//! println!("mapped address: {:?}", reply.mapped_address());
//! # Ok(())
//! # }
//! ```

/// Message and attribute codec (RFC 5389)
pub mod protocol;
pub mod cache;
pub mod transaction;
pub mod socket;

// Re-export core types for easy access
pub use protocol::{
    Message, MessageType, MessageClass, TransactionId, Attribute, AttributeType,
    is_stun_message, MAGIC_COOKIE, HEADER_SIZE,
};
pub use transaction::{
    Transaction, TransactionConfig, TransactionEngine, TransactionStats, StunReply,
    MAX_IPV4_PACKET, MAX_IPV6_PACKET,
};
pub use socket::{StunSocket, SocketId, InboundPacket, PacketKind};
