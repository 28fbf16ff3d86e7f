use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the ICE agent and its collaborators
#[derive(Debug, Error)]
pub enum IceError {
    /// STUN codec / transaction errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),

    /// Role conflict detected and resolved by tiebreaker comparison
    #[error("Role conflict resolved (local tiebreaker {local}, remote tiebreaker {remote:?})")]
    RoleConflict {
        /// Our tie-breaker
        local: u64,
        /// Tie-breaker of the peer, when it sent one
        remote: Option<u64>,
    },

    /// Some server-reflexive probes failed, host candidates were kept
    #[error("Gathering partially failed: {failed} of {total} probes did not complete")]
    GatheringPartial {
        /// Lookups that failed
        failed: usize,
        /// Lookups attempted
        total: usize,
    },

    /// A connectivity check failed for a single pair
    #[error("Candidate pair {pair} failed: {reason}")]
    PairFailed {
        /// Foundation of the pair
        pair: String,
        /// Why the check failed
        reason: String,
    },

    /// Every pair of a component failed without nomination
    #[error("Component {component} of stream {stream} failed")]
    ComponentFailed {
        /// Stream index
        stream: usize,
        /// Component id
        component: u16,
    },

    /// The agent was closed while the operation was outstanding
    #[error("ICE agent closed")]
    AgentClosed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed session description
    #[error("SDP error: {0}")]
    Sdp(String),

    /// Gateway probe errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Timeout errors
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// STUN-specific errors following RFC 5389
#[derive(Debug, Error)]
pub enum StunError {
    /// Truncation, bad magic, bad attribute length or FINGERPRINT mismatch
    #[error("Malformed STUN packet: {0}")]
    MalformedPacket(String),

    /// Unknown comprehension-required attributes
    #[error("Unknown comprehension-required attributes: {0:?}")]
    UnknownAttribute(Vec<u16>),

    /// MESSAGE-INTEGRITY missing or wrong
    #[error("MESSAGE-INTEGRITY check failed")]
    IntegrityFailure,

    /// Missing required attribute
    #[error("Missing required attribute: {0}")]
    MissingAttribute(&'static str),

    /// Outbound packet exceeds the path MTU budget
    #[error("STUN packet of {len} bytes exceeds the {limit} byte limit")]
    Oversize {
        /// Size the packet would have
        len: usize,
        /// Largest size allowed
        limit: usize,
    },

    /// No response after all retransmissions
    #[error("No response from {dest} after {sends} transmissions ({elapsed:?})")]
    TransactionTimeout {
        /// Server the request went to
        dest: SocketAddr,
        /// Transmissions made
        sends: u32,
        /// Time from first send to giving up
        elapsed: Duration,
    },

    /// Transaction cancelled by its owner
    #[error("STUN transaction cancelled")]
    Cancelled,

    /// STUN error response
    #[error("STUN error response: {code} - {reason}")]
    ErrorResponse {
        /// ERROR-CODE number
        code: u16,
        /// Reason phrase
        reason: String,
    },
}

impl IceError {
    /// Recoverable errors are confined to a pair or transaction and never fail the agent
    pub fn is_recoverable(&self) -> bool {
        match self {
            IceError::Stun(e) => e.is_recoverable(),
            IceError::RoleConflict { .. }
            | IceError::GatheringPartial { .. }
            | IceError::PairFailed { .. }
            | IceError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl StunError {
    /// See [`IceError::is_recoverable`]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StunError::TransactionTimeout { .. }
                | StunError::IntegrityFailure
                | StunError::ErrorResponse { .. }
                | StunError::MalformedPacket(_)
                | StunError::UnknownAttribute(_)
        )
    }
}

/// Result type for ICE operations
pub type IceResult<T> = Result<T, IceError>;

/// Extension trait for adding context to I/O errors
pub trait IoErrorContext<T> {
    /// Wrap the error with a short description of the failed operation
    fn ice_context(self, context: &str) -> IceResult<T>;
}

impl<T> IoErrorContext<T> for io::Result<T> {
    fn ice_context(self, context: &str) -> IceResult<T> {
        self.map_err(|e| IceError::Io(io::Error::new(e.kind(), format!("{}: {}", context, e))))
    }
}
