// src/nat/ice/connectivity.rs
//! Connectivity check messages (RFC 5245 Section 7)
//!
//! Building outgoing checks, validating inbound ones, and judging the
//! responses. Everything here is free of agent state; the agent feeds in
//! credentials and role and acts on the verdicts.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tracing::trace;

use crate::nat::error::{IceError, IceResult, StunError};
use crate::nat::stun::{Attribute, Message, MessageClass, MessageType, StunReply, TransactionId};
use super::agent::IceRole;

/// Error code for a role conflict (RFC 5245 Section 19.2)
pub const ROLE_CONFLICT: u16 = 487;
/// Error code for a request missing USERNAME or PRIORITY
pub const BAD_REQUEST: u16 = 400;
/// Error code for a request failing authentication
pub const UNAUTHORIZED: u16 = 401;

/// Fields of one outgoing check
#[derive(Debug, Clone)]
pub struct CheckRequest<'a> {
    /// Our username fragment
    pub local_ufrag: &'a str,
    /// Username fragment of the peer
    pub remote_ufrag: &'a str,
    /// Password of the peer, keys MESSAGE-INTEGRITY
    pub remote_pwd: &'a str,
    /// PRIORITY value: what a peer reflexive candidate from this check would get
    pub priority: u32,
    /// Our role, sent as ICE-CONTROLLING or ICE-CONTROLLED
    pub role: IceRole,
    /// Our tie-breaker
    pub tie_breaker: u64,
    /// Carry USE-CANDIDATE
    pub use_candidate: bool,
}

impl CheckRequest<'_> {
    /// Binding request with USERNAME, PRIORITY and the role attribute
    pub fn to_message(&self, transaction_id: TransactionId) -> Message {
        let mut msg = Message::new(MessageType::BindingRequest, transaction_id)
            .with(Attribute::Username(format!("{}:{}", self.remote_ufrag, self.local_ufrag)))
            .with(Attribute::Priority(self.priority));
        msg.add_attribute(match self.role {
            IceRole::Controlling => Attribute::IceControlling(self.tie_breaker),
            IceRole::Controlled => Attribute::IceControlled(self.tie_breaker),
        });
        if self.use_candidate && self.role == IceRole::Controlling {
            msg.add_attribute(Attribute::UseCandidate);
        }
        msg
    }

    /// Encoded request, integrity keyed with the remote password
    pub fn encode(&self, transaction_id: TransactionId) -> IceResult<Bytes> {
        Ok(self.to_message(transaction_id).encode(Some(self.remote_pwd.as_bytes()), true)?)
    }
}

/// How a finished check went
#[derive(Debug)]
pub enum CheckOutcome {
    /// Valid response; `mapped` is our address as the peer saw it
    Success {
        /// XOR-MAPPED-ADDRESS of the response
        mapped: SocketAddr,
        /// Time from first send to the response
        rtt: Duration,
    },
    /// Peer answered 487
    RoleConflict,
    /// The pair failed
    Failed(IceError),
}

/// Judge the result of a check sent to `dest`
///
/// The transaction engine has already dropped responses that fail
/// MESSAGE-INTEGRITY under the remote password.
pub fn evaluate_response(result: IceResult<StunReply>, dest: SocketAddr) -> CheckOutcome {
    let reply = match result {
        Ok(reply) => reply,
        Err(e) => return CheckOutcome::Failed(e),
    };

    // Non-symmetric responses fail the pair (RFC 5245 Section 7.1.3.1)
    if reply.from != dest {
        return CheckOutcome::Failed(IceError::PairFailed {
            pair: dest.to_string(),
            reason: format!("response came from {}", reply.from),
        });
    }

    match reply.message.message_type.class() {
        MessageClass::SuccessResponse => match reply.mapped_address() {
            Some(mapped) => CheckOutcome::Success { mapped, rtt: reply.rtt },
            None => CheckOutcome::Failed(StunError::MissingAttribute("XOR-MAPPED-ADDRESS").into()),
        },
        _ => match reply.message.error_code() {
            Some((ROLE_CONFLICT, _)) => CheckOutcome::RoleConflict,
            Some((code, reason)) => CheckOutcome::Failed(
                StunError::ErrorResponse { code, reason: reason.to_string() }.into(),
            ),
            None => CheckOutcome::Failed(StunError::MissingAttribute("ERROR-CODE").into()),
        },
    }
}

/// Verdict on an inbound binding request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestVerdict {
    /// Answer with an error response
    Reject {
        /// ERROR-CODE number
        code: u16,
        /// Reason phrase
        reason: &'static str,
    },
    /// Authenticated request
    Accept {
        /// PRIORITY of the request
        priority: u32,
        /// Request carried USE-CANDIDATE
        use_candidate: bool,
        /// Role and tie-breaker the peer claims
        remote_role: Option<(IceRole, u64)>,
    },
}

/// Authenticate an inbound check (RFC 5245 Section 7.2.1)
///
/// USERNAME must be `local_ufrag:remote_ufrag`; the remote part is only
/// checked once the remote credentials are known.
pub fn validate_request(
    msg: &Message,
    raw: &[u8],
    local_ufrag: &str,
    local_pwd: &str,
    remote_ufrag: Option<&str>,
) -> RequestVerdict {
    let Some(username) = msg.username() else {
        return RequestVerdict::Reject { code: BAD_REQUEST, reason: "Bad Request" };
    };
    let Some(priority) = msg.priority() else {
        return RequestVerdict::Reject { code: BAD_REQUEST, reason: "Bad Request" };
    };

    let (ours, theirs) = username.split_once(':').unwrap_or((username, ""));
    if ours != local_ufrag || remote_ufrag.map_or(false, |r| r != theirs) {
        trace!("Username {:?} does not match", username);
        return RequestVerdict::Reject { code: UNAUTHORIZED, reason: "Unauthorized" };
    }

    if Message::verify_integrity(raw, local_pwd.as_bytes()).is_err() {
        return RequestVerdict::Reject { code: UNAUTHORIZED, reason: "Unauthorized" };
    }

    let remote_role = msg
        .ice_controlling()
        .map(|t| (IceRole::Controlling, t))
        .or_else(|| msg.ice_controlled().map(|t| (IceRole::Controlled, t)));

    RequestVerdict::Accept {
        priority,
        use_candidate: msg.use_candidate(),
        remote_role,
    }
}

/// What to do about the role attributes of an inbound check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Roles already differ
    NoConflict,
    /// Keep our role and answer 487
    RejectWithConflict,
    /// Take the other role and process the check
    SwitchRole,
}

/// Role conflict resolution (RFC 5245 Section 7.2.1.1)
pub fn resolve_role_conflict(local: IceRole, local_tie_breaker: u64, remote: Option<(IceRole, u64)>) -> ConflictResolution {
    match (local, remote) {
        (IceRole::Controlling, Some((IceRole::Controlling, theirs))) => {
            if local_tie_breaker >= theirs {
                ConflictResolution::RejectWithConflict
            } else {
                ConflictResolution::SwitchRole
            }
        }
        (IceRole::Controlled, Some((IceRole::Controlled, theirs))) => {
            if local_tie_breaker >= theirs {
                ConflictResolution::SwitchRole
            } else {
                ConflictResolution::RejectWithConflict
            }
        }
        _ => ConflictResolution::NoConflict,
    }
}

/// Success response carrying the source address we saw
pub fn success_response(request: &Message, from: SocketAddr, software: Option<&str>, local_pwd: &str) -> IceResult<Bytes> {
    let mut msg = Message::success_response(request).with(Attribute::XorMappedAddress(from));
    if let Some(software) = software {
        msg.add_attribute(Attribute::Software(software.to_string()));
    }
    Ok(msg.encode(Some(local_pwd.as_bytes()), true)?)
}

/// Error response; integrity is only added for codes sent after authentication
pub fn error_response(request: &Message, code: u16, reason: &str, local_pwd: Option<&str>) -> IceResult<Bytes> {
    let msg = Message::error_response(request, code, reason);
    Ok(msg.encode(local_pwd.map(str::as_bytes), true)?)
}

/// Binding indication refreshing NAT bindings on a selected pair
pub fn keepalive_indication() -> IceResult<Bytes> {
    Ok(Message::new(MessageType::BindingIndication, TransactionId::new()).encode(None, true)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_UFRAG: &str = "locl";
    const LOCAL_PWD: &str = "local-password-1234567890";
    const REMOTE_UFRAG: &str = "rmte";
    const REMOTE_PWD: &str = "remote-password-123456789";

    fn peer_check(role: IceRole, tie_breaker: u64, use_candidate: bool) -> (Message, Bytes) {
        // A check as the remote agent sends it to us
        let request = CheckRequest {
            local_ufrag: REMOTE_UFRAG,
            remote_ufrag: LOCAL_UFRAG,
            remote_pwd: LOCAL_PWD,
            priority: 1_862_270_975,
            role,
            tie_breaker,
            use_candidate,
        };
        let raw = request.encode(TransactionId::new()).unwrap();
        (Message::decode(&raw).unwrap(), raw)
    }

    fn reply(message: Message, from: SocketAddr, pwd: &str) -> StunReply {
        let raw = message.encode(Some(pwd.as_bytes()), true).unwrap();
        StunReply { message: Message::decode(&raw).unwrap(), raw, from, rtt: Duration::from_millis(4) }
    }

    #[test]
    fn test_check_request_attributes() {
        let (msg, _) = peer_check(IceRole::Controlling, 42, true);
        assert_eq!(msg.username(), Some("locl:rmte"));
        assert_eq!(msg.priority(), Some(1_862_270_975));
        assert_eq!(msg.ice_controlling(), Some(42));
        assert!(msg.use_candidate());

        let (controlled, _) = peer_check(IceRole::Controlled, 7, true);
        assert_eq!(controlled.ice_controlled(), Some(7));
        assert!(!controlled.use_candidate());
    }

    #[test]
    fn test_validate_request() {
        let (msg, raw) = peer_check(IceRole::Controlled, 9, false);
        assert_eq!(
            validate_request(&msg, &raw, LOCAL_UFRAG, LOCAL_PWD, Some(REMOTE_UFRAG)),
            RequestVerdict::Accept {
                priority: 1_862_270_975,
                use_candidate: false,
                remote_role: Some((IceRole::Controlled, 9)),
            }
        );

        assert!(matches!(
            validate_request(&msg, &raw, "othr", LOCAL_PWD, None),
            RequestVerdict::Reject { code: UNAUTHORIZED, .. }
        ));
        assert!(matches!(
            validate_request(&msg, &raw, LOCAL_UFRAG, "wrong-password-xxxxxxxxxx", None),
            RequestVerdict::Reject { code: UNAUTHORIZED, .. }
        ));

        let bare = Message::binding_request();
        let bare_raw = bare.encode(None, true).unwrap();
        assert!(matches!(
            validate_request(&bare, &bare_raw, LOCAL_UFRAG, LOCAL_PWD, None),
            RequestVerdict::Reject { code: BAD_REQUEST, .. }
        ));
    }

    #[test]
    fn test_role_conflict_resolution() {
        use ConflictResolution::*;
        assert_eq!(resolve_role_conflict(IceRole::Controlling, 10, Some((IceRole::Controlling, 5))), RejectWithConflict);
        assert_eq!(resolve_role_conflict(IceRole::Controlling, 5, Some((IceRole::Controlling, 10))), SwitchRole);
        assert_eq!(resolve_role_conflict(IceRole::Controlled, 10, Some((IceRole::Controlled, 5))), SwitchRole);
        assert_eq!(resolve_role_conflict(IceRole::Controlled, 5, Some((IceRole::Controlled, 10))), RejectWithConflict);
        assert_eq!(resolve_role_conflict(IceRole::Controlling, 5, Some((IceRole::Controlled, 10))), NoConflict);
        assert_eq!(resolve_role_conflict(IceRole::Controlled, 5, None), NoConflict);
    }

    #[test]
    fn test_evaluate_success() {
        let dest: SocketAddr = "10.0.0.2:6000".parse().unwrap();
        let mapped: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let (request, _) = peer_check(IceRole::Controlling, 1, false);
        let response = Message::success_response(&request).with(Attribute::XorMappedAddress(mapped));

        match evaluate_response(Ok(reply(response.clone(), dest, REMOTE_PWD)), dest) {
            CheckOutcome::Success { mapped: m, .. } => assert_eq!(m, mapped),
            other => panic!("unexpected {:?}", other),
        }

        // Asymmetric source
        let elsewhere: SocketAddr = "10.0.0.3:6000".parse().unwrap();
        assert!(matches!(
            evaluate_response(Ok(reply(response.clone(), elsewhere, REMOTE_PWD)), dest),
            CheckOutcome::Failed(IceError::PairFailed { .. })
        ));
    }

    #[test]
    fn test_evaluate_errors() {
        let dest: SocketAddr = "10.0.0.2:6000".parse().unwrap();
        let (request, _) = peer_check(IceRole::Controlling, 1, false);

        let conflict = Message::error_response(&request, ROLE_CONFLICT, "Role Conflict");
        assert!(matches!(
            evaluate_response(Ok(reply(conflict, dest, REMOTE_PWD)), dest),
            CheckOutcome::RoleConflict
        ));

        let unauthorized = Message::error_response(&request, UNAUTHORIZED, "Unauthorized");
        assert!(matches!(
            evaluate_response(Ok(reply(unauthorized, dest, REMOTE_PWD)), dest),
            CheckOutcome::Failed(IceError::Stun(StunError::ErrorResponse { code: UNAUTHORIZED, .. }))
        ));

        assert!(matches!(
            evaluate_response(Err(IceError::Timeout(Duration::from_secs(1))), dest),
            CheckOutcome::Failed(IceError::Timeout(_))
        ));
    }

    #[test]
    fn test_responses_encode() {
        let (request, _) = peer_check(IceRole::Controlling, 1, false);
        let from: SocketAddr = "192.0.2.1:3000".parse().unwrap();
        let raw = success_response(&request, from, Some("test"), LOCAL_PWD).unwrap();
        let decoded = Message::decode(&raw).unwrap();
        assert_eq!(decoded.mapped_address(), Some(from));
        assert_eq!(decoded.transaction_id, request.transaction_id);
        assert!(Message::verify_integrity(&raw, LOCAL_PWD.as_bytes()).is_ok());

        let raw = error_response(&request, BAD_REQUEST, "Bad Request", None).unwrap();
        assert_eq!(Message::decode(&raw).unwrap().error_code(), Some((BAD_REQUEST, "Bad Request")));

        let indication = Message::decode(&keepalive_indication().unwrap()).unwrap();
        assert_eq!(indication.message_type, MessageType::BindingIndication);
    }
}
