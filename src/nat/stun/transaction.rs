//! STUN transaction engine (RFC 5389 Section 7.2.1)
//!
//! Sends requests, retransmits them on an exponential schedule, correlates
//! responses by transaction id and hands the outcome to a single-shot waiter.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::nat::error::{IceError, IceResult, StunError};
use super::cache::ExpiringCache;
use super::protocol::{AttributeType, Message, MessageClass, TransactionId};

/// Largest request sent over IPv4 without risking fragmentation (576 - IP - UDP headers)
pub const MAX_IPV4_PACKET: usize = 548;

/// Largest request sent over IPv6 (1280 - IP - UDP headers)
pub const MAX_IPV6_PACKET: usize = 1232;

/// Retransmission parameters
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Initial retransmission timeout (RTO)
    pub rto: Duration,

    /// Maximum number of transmissions (Rc)
    pub max_transmissions: u32,

    /// Final wait multiplier applied to the initial RTO after the last send (Rm)
    pub final_multiplier: u32,

    /// Hard cap on the lifetime of one transaction
    pub max_duration: Duration,

    /// Reliable transports send once and wait `max_duration`
    pub reliable: bool,

    /// How long transaction ids stay reserved
    pub cache_ttl: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            rto: Duration::from_millis(500),
            max_transmissions: 7,
            final_multiplier: 16,
            max_duration: Duration::from_millis(39_500),
            reliable: false,
            cache_ttl: Duration::from_secs(600),
        }
    }
}

/// A correlated response
#[derive(Debug, Clone)]
pub struct StunReply {
    /// Decoded response
    pub message: Message,
    /// Encoded form, needed for MESSAGE-INTEGRITY verification
    pub raw: Bytes,
    /// Source of the response
    pub from: SocketAddr,
    /// Time since the first transmission
    pub rtt: Duration,
}

impl StunReply {
    /// Whether this is a success response
    pub fn is_success(&self) -> bool {
        self.message.message_type.class() == MessageClass::SuccessResponse
    }

    /// XOR-MAPPED-ADDRESS or MAPPED-ADDRESS of the response
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.message.mapped_address()
    }

    /// Error code of an error response
    pub fn error_code(&self) -> Option<u16> {
        self.message.error_code().map(|(code, _)| code)
    }
}

/// Counters kept per engine
#[derive(Debug, Default)]
pub struct TransactionStats {
    /// Requests sent, retransmissions excluded
    pub requests_sent: AtomicU64,
    /// Retransmissions
    pub retransmissions: AtomicU64,
    /// Responses matched to a transaction
    pub responses_received: AtomicU64,
    /// Responses for finished transactions
    pub late_responses: AtomicU64,
    /// Transactions that got no response
    pub timeouts: AtomicU64,
    /// Transactions cancelled by their owner
    pub cancelled: AtomicU64,
    /// Responses dropped for failing MESSAGE-INTEGRITY
    pub unauthenticated: AtomicU64,
}

type Outcome = IceResult<StunReply>;

struct Waiter {
    completion_sender: oneshot::Sender<Outcome>,
    cancel: CancellationToken,
    started: Instant,
    /// Key the response must be authenticated with
    response_key: Option<Vec<u8>>,
}

enum Entry {
    Pending(Waiter),
    Completed,
}

type PendingMap = Arc<Mutex<ExpiringCache<TransactionId, Entry>>>;

/// Handle to an outstanding transaction; resolves once with the outcome
///
/// Dropping the handle cancels the transaction.
pub struct Transaction {
    id: TransactionId,
    rx: oneshot::Receiver<Outcome>,
    cancel: CancellationToken,
}

impl Transaction {
    /// Transaction id of the request
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Stop retransmitting and resolve the waiter with `Cancelled`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Future for Transaction {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(IceError::AgentClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Per-socket STUN transaction engine
pub struct TransactionEngine {
    socket: Arc<UdpSocket>,
    config: TransactionConfig,
    pending: PendingMap,
    stats: Arc<TransactionStats>,
    shutdown: CancellationToken,
}

impl TransactionEngine {
    /// Engine sending on `socket`
    pub fn new(socket: Arc<UdpSocket>, config: TransactionConfig) -> Self {
        let pending = Arc::new(Mutex::new(ExpiringCache::new(config.cache_ttl)));
        Self {
            socket,
            config,
            pending,
            stats: Arc::new(TransactionStats::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Retransmission settings
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Counters of this engine
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    /// Random transaction id not used by this engine within the cache TTL
    pub fn next_transaction_id(&self) -> TransactionId {
        let pending = self.pending.lock();
        loop {
            let id = TransactionId::new();
            if !pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Encode `request` and start its transaction
    ///
    /// Fails synchronously with `Oversize` when the encoded packet exceeds
    /// the path limit for `dest`.
    pub fn start(
        &self,
        dest: SocketAddr,
        request: &Message,
        integrity_key: Option<&[u8]>,
    ) -> IceResult<Transaction> {
        let data = request.encode(integrity_key, true)?;
        self.start_raw(dest, request.transaction_id, data, integrity_key)
    }

    /// Start a transaction for an already encoded request
    ///
    /// With a `response_key`, responses that fail MESSAGE-INTEGRITY under it
    /// are discarded and the transaction keeps waiting (RFC 5389 Section 10.1.3).
    pub fn start_raw(
        &self,
        dest: SocketAddr,
        id: TransactionId,
        data: Bytes,
        response_key: Option<&[u8]>,
    ) -> IceResult<Transaction> {
        let limit = if dest.is_ipv4() { MAX_IPV4_PACKET } else { MAX_IPV6_PACKET };
        if data.len() > limit {
            return Err(StunError::Oversize { len: data.len(), limit }.into());
        }
        if self.shutdown.is_cancelled() {
            return Err(IceError::AgentClosed);
        }

        let (tx, rx) = oneshot::channel();
        let cancel = self.shutdown.child_token();
        let started = Instant::now();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                return Err(IceError::InvalidState(format!("transaction {:?} already in use", id)));
            }
            pending.insert(id, Entry::Pending(Waiter {
                completion_sender: tx,
                cancel: cancel.clone(),
                started,
                response_key: response_key.map(<[u8]>::to_vec),
            }));
        }

        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);

        let driver = Retransmitter {
            socket: self.socket.clone(),
            config: self.config.clone(),
            pending: self.pending.clone(),
            stats: self.stats.clone(),
            cancel: cancel.clone(),
            id,
            dest,
            data,
            started,
        };
        tokio::spawn(driver.run());

        Ok(Transaction { id, rx, cancel })
    }

    /// `start` + await
    pub async fn send_request(
        &self,
        dest: SocketAddr,
        request: &Message,
        integrity_key: Option<&[u8]>,
    ) -> IceResult<StunReply> {
        self.start(dest, request, integrity_key)?.await
    }

    /// Offer an inbound response to the waiters
    ///
    /// Returns the message back when no transaction (live or recently
    /// completed) owns it, so the caller can route it elsewhere.
    pub fn handle_response(&self, message: Message, raw: Bytes, from: SocketAddr) -> Option<(Message, Bytes)> {
        let waiter = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&message.transaction_id) {
                None => return Some((message, raw)),
                Some(entry) => {
                    if let Entry::Pending(Waiter { response_key: Some(key), .. }) = entry {
                        if !is_authentic(&message, &raw, key) {
                            self.stats.unauthenticated.fetch_add(1, Ordering::Relaxed);
                            debug!("Discarding unauthenticated response for {:?} from {}", message.transaction_id, from);
                            return None;
                        }
                    }
                    match std::mem::replace(entry, Entry::Completed) {
                        Entry::Pending(waiter) => waiter,
                        Entry::Completed => {
                            self.stats.late_responses.fetch_add(1, Ordering::Relaxed);
                            trace!("Dropping late response for {:?} from {}", message.transaction_id, from);
                            return None;
                        }
                    }
                }
            }
        };

        self.stats.responses_received.fetch_add(1, Ordering::Relaxed);
        waiter.cancel.cancel();

        let reply = StunReply {
            message,
            raw,
            from,
            rtt: waiter.started.elapsed(),
        };
        let _ = waiter.completion_sender.send(Ok(reply));
        None
    }

    /// Number of transactions still waiting for a reply
    pub fn outstanding(&self) -> usize {
        let pending = self.pending.lock();
        pending.values().filter(|e| matches!(e, Entry::Pending(_))).count()
    }

    /// Deliver `AgentClosed` to every waiter and stop all retransmissions
    pub fn close(&self) {
        let waiters: Vec<Waiter> = {
            let mut pending = self.pending.lock();
            pending
                .drain()
                .into_iter()
                .filter_map(|(_, entry)| match entry {
                    Entry::Pending(waiter) => Some(waiter),
                    Entry::Completed => None,
                })
                .collect()
        };

        if !waiters.is_empty() {
            debug!("Closing transaction engine with {} outstanding transactions", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.completion_sender.send(Err(IceError::AgentClosed));
        }
        self.shutdown.cancel();
    }
}

impl Drop for TransactionEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Error responses may come without MESSAGE-INTEGRITY; when present it must verify
fn is_authentic(message: &Message, raw: &[u8], key: &[u8]) -> bool {
    if Message::verify_integrity(raw, key).is_ok() {
        return true;
    }
    message.message_type.class() == MessageClass::ErrorResponse
        && message.get_attribute(AttributeType::MessageIntegrity).is_none()
}

struct Retransmitter {
    socket: Arc<UdpSocket>,
    config: TransactionConfig,
    pending: PendingMap,
    stats: Arc<TransactionStats>,
    cancel: CancellationToken,
    id: TransactionId,
    dest: SocketAddr,
    data: Bytes,
    started: Instant,
}

impl Retransmitter {
    async fn run(self) {
        let deadline = self.started + self.config.max_duration;
        let mut rto = self.config.rto;
        let mut sends = 0u32;

        loop {
            if let Err(e) = self.socket.send_to(&self.data, self.dest).await {
                warn!("Failed to send STUN request {:?} to {}: {}", self.id, self.dest, e);
                self.complete(Err(IceError::Io(e)));
                return;
            }
            sends += 1;
            if sends > 1 {
                self.stats.retransmissions.fetch_add(1, Ordering::Relaxed);
            }
            trace!("Sent {:?} to {} (transmission {})", self.id, self.dest, sends);

            let last = self.config.reliable || sends >= self.config.max_transmissions;
            let wait = if self.config.reliable {
                self.config.max_duration
            } else if last {
                rto + self.config.rto * self.config.final_multiplier
            } else {
                rto
            };
            let wake = (Instant::now() + wait).min(deadline);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if self.complete(Err(StunError::Cancelled.into())) {
                        self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    }
                    return;
                }
                _ = sleep_until(wake) => {}
            }

            if last || Instant::now() >= deadline {
                let elapsed = self.started.elapsed();
                if self.complete(Err(StunError::TransactionTimeout {
                    dest: self.dest,
                    sends,
                    elapsed,
                }.into())) {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!("STUN transaction {:?} to {} timed out after {:?}", self.id, self.dest, elapsed);
                }
                return;
            }

            rto *= 2;
        }
    }

    /// Resolve the waiter if it is still pending; false if someone beat us to it
    fn complete(&self, outcome: Outcome) -> bool {
        let waiter = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&self.id) {
                Some(entry) => match std::mem::replace(entry, Entry::Completed) {
                    Entry::Pending(waiter) => waiter,
                    Entry::Completed => return false,
                },
                None => return false,
            }
        };
        let _ = waiter.completion_sender.send(outcome);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::stun::protocol::{Attribute, MessageType};

    async fn black_hole() -> (Arc<UdpSocket>, UdpSocket) {
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (local, sink)
    }

    fn fast_config() -> TransactionConfig {
        TransactionConfig {
            rto: Duration::from_millis(50),
            max_transmissions: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_oversize_fails_synchronously() {
        let (local, sink) = black_hole().await;
        let engine = TransactionEngine::new(local, fast_config());

        let request = Message::binding_request()
            .with(Attribute::Software("x".repeat(540)));
        let err = engine
            .start(sink.local_addr().unwrap(), &request, None)
            .err()
            .expect("oversize request must be rejected");
        assert!(matches!(err, IceError::Stun(StunError::Oversize { limit: MAX_IPV4_PACKET, .. })));
        assert_eq!(engine.stats().requests_sent.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_response_resolves_waiter_and_late_duplicate_is_dropped() {
        let (local, server) = black_hole().await;
        let engine = TransactionEngine::new(local.clone(), fast_config());

        let request = Message::binding_request();
        let transaction = engine
            .start(server.local_addr().unwrap(), &request, None)
            .unwrap();

        let mut buf = [0u8; 1500];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        let received = Message::decode(&buf[..len]).unwrap();
        assert_eq!(received.transaction_id, transaction.id());

        let response = Message::success_response(&received)
            .with(Attribute::XorMappedAddress(from));
        let raw = response.encode(None, true).unwrap();

        assert!(engine
            .handle_response(Message::decode(&raw).unwrap(), raw.clone(), server.local_addr().unwrap())
            .is_none());
        let reply = transaction.await.unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.mapped_address(), Some(local.local_addr().unwrap()));

        // Duplicate after completion is swallowed
        assert!(engine
            .handle_response(Message::decode(&raw).unwrap(), raw, server.local_addr().unwrap())
            .is_none());
        assert_eq!(engine.stats().late_responses.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_forged_response_is_discarded_and_waiting_continues() {
        let (local, server) = black_hole().await;
        let engine = TransactionEngine::new(local, fast_config());
        let key = b"remote-password-123456789";

        let request = Message::binding_request();
        let transaction = engine
            .start(server.local_addr().unwrap(), &request, Some(key))
            .unwrap();
        let from = server.local_addr().unwrap();
        let response = Message::success_response(&request).with(Attribute::XorMappedAddress(from));

        let forged = response.encode(Some(b"not-the-right-password"), true).unwrap();
        assert!(engine.handle_response(Message::decode(&forged).unwrap(), forged, from).is_none());
        assert_eq!(engine.stats().unauthenticated.load(Ordering::Relaxed), 1);
        assert_eq!(engine.outstanding(), 1);

        let genuine = response.encode(Some(key), true).unwrap();
        assert!(engine.handle_response(Message::decode(&genuine).unwrap(), genuine, from).is_none());
        let reply = tokio::time::timeout(Duration::from_secs(1), transaction).await.unwrap().unwrap();
        assert!(reply.is_success());
        assert_eq!(engine.stats().late_responses.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_unsigned_error_response_is_accepted() {
        let (local, server) = black_hole().await;
        let engine = TransactionEngine::new(local, fast_config());

        let request = Message::binding_request();
        let transaction = engine
            .start(server.local_addr().unwrap(), &request, Some(b"remote-password-123456789"))
            .unwrap();
        let error = Message::error_response(&request, 401, "Unauthorized");
        let raw = error.encode(None, true).unwrap();
        assert!(engine
            .handle_response(Message::decode(&raw).unwrap(), raw, server.local_addr().unwrap())
            .is_none());

        let reply = tokio::time::timeout(Duration::from_secs(1), transaction).await.unwrap().unwrap();
        assert_eq!(reply.error_code(), Some(401));
    }

    #[tokio::test]
    async fn test_unmatched_response_is_returned() {
        let (local, _sink) = black_hole().await;
        let engine = TransactionEngine::new(local, fast_config());

        let stray = Message::new(MessageType::BindingResponse, TransactionId::new());
        let raw = stray.encode(None, false).unwrap();
        let from = "127.0.0.1:9".parse().unwrap();
        assert!(engine.handle_response(stray, raw, from).is_some());
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let (local, sink) = black_hole().await;
        let engine = TransactionEngine::new(local, TransactionConfig::default());

        let transaction = engine
            .start(sink.local_addr().unwrap(), &Message::binding_request(), None)
            .unwrap();
        transaction.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), transaction).await.unwrap();
        assert!(matches!(outcome, Err(IceError::Stun(StunError::Cancelled))));
    }

    #[tokio::test]
    async fn test_close_delivers_agent_closed() {
        let (local, sink) = black_hole().await;
        let engine = TransactionEngine::new(local, TransactionConfig::default());

        let transaction = engine
            .start(sink.local_addr().unwrap(), &Message::binding_request(), None)
            .unwrap();
        engine.close();

        let outcome = tokio::time::timeout(Duration::from_secs(1), transaction).await.unwrap();
        assert!(matches!(outcome, Err(IceError::AgentClosed)));
        assert!(matches!(
            engine.start(sink.local_addr().unwrap(), &Message::binding_request(), None),
            Err(IceError::AgentClosed)
        ));
    }

    #[tokio::test]
    async fn test_reliable_transport_sends_once() {
        let (local, sink) = black_hole().await;
        let config = TransactionConfig {
            reliable: true,
            max_duration: Duration::from_millis(300),
            ..fast_config()
        };
        let engine = TransactionEngine::new(local, config);

        let outcome = engine
            .send_request(sink.local_addr().unwrap(), &Message::binding_request(), None)
            .await;
        assert!(matches!(
            outcome,
            Err(IceError::Stun(StunError::TransactionTimeout { sends: 1, .. }))
        ));
        assert_eq!(engine.stats().retransmissions.load(Ordering::Relaxed), 0);
    }
}
