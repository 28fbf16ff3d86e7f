//! Bound datagram endpoint shared by STUN transactions and application data
//!
//! A receive loop demultiplexes every datagram: STUN responses go straight to
//! the transaction engine, everything else is forwarded to the owner's
//! inbound channel tagged with the socket's handle id.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::nat::error::{IceResult, IoErrorContext};
use super::protocol::{is_stun_message, Message};
use super::transaction::{TransactionConfig, TransactionEngine};

/// Receive buffer size; larger datagrams are truncated by the OS
const RECV_BUFFER_SIZE: usize = 2048;

/// Consecutive non-transient receive errors after which the loop gives up
const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 16;

/// First pause after a persistent receive error; doubles up to the cap
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);
const RECV_ERROR_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Handle id of a socket inside its owner's socket table
pub type SocketId = usize;

/// What arrived on a socket
#[derive(Debug, Clone)]
pub enum PacketKind {
    /// STUN request, indication, or a response no transaction claimed
    Stun {
        /// Decoded message
        message: Message,
        /// Datagram as received
        raw: Bytes,
    },
    /// Anything that is not STUN
    Data(Bytes),
}

/// A datagram forwarded to the owner of the socket
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// Socket the datagram arrived on
    pub socket: SocketId,
    /// Local address of that socket
    pub local: SocketAddr,
    /// Sender
    pub from: SocketAddr,
    /// Demultiplexed payload
    pub kind: PacketKind,
}

/// A bound UDP socket with its own transaction engine and receive loop
pub struct StunSocket {
    id: SocketId,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    engine: Arc<TransactionEngine>,
    shutdown: CancellationToken,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl StunSocket {
    /// Bind `addr` and start demultiplexing into `sink`
    pub async fn bind(
        id: SocketId,
        addr: SocketAddr,
        config: TransactionConfig,
        sink: mpsc::UnboundedSender<InboundPacket>,
    ) -> IceResult<Arc<Self>> {
        let socket = UdpSocket::bind(addr)
            .await
            .ice_context(&format!("bind {}", addr))?;
        let local_addr = socket.local_addr().ice_context("local_addr")?;
        let socket = Arc::new(socket);
        let engine = Arc::new(TransactionEngine::new(socket.clone(), config));
        let shutdown = CancellationToken::new();

        let this = Arc::new(Self {
            id,
            socket: socket.clone(),
            local_addr,
            engine: engine.clone(),
            shutdown: shutdown.clone(),
            recv_task: Mutex::new(None),
        });

        let task = tokio::spawn(receive_loop(id, socket, local_addr, engine, sink, shutdown));
        *this.recv_task.lock() = Some(task);

        debug!("Bound socket #{} on {}", id, local_addr);
        Ok(this)
    }

    /// Handle id inside the owner's socket table
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Bound local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transaction engine sending on this socket
    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    /// Best-effort send; never waits for the socket to become writable
    pub fn send_to(&self, data: &[u8], dest: SocketAddr) -> IceResult<usize> {
        match self.socket.try_send_to(data, dest) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                trace!("Socket {} not writable, dropping {} bytes to {}", self.local_addr, data.len(), dest);
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fail outstanding transactions and stop the receive loop
    pub fn close(&self) {
        self.engine.close();
        self.shutdown.cancel();
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
    }

    /// Whether the socket was closed
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for StunSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive_loop(
    id: SocketId,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    engine: Arc<TransactionEngine>,
    sink: mpsc::UnboundedSender<InboundPacket>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut errors = 0u32;

    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => result,
        };
        let (len, from) = match result {
            Ok(r) => {
                errors = 0;
                r
            }
            // ICMP errors from earlier sends surface here on some platforms
            Err(e) if is_transient(&e) => {
                debug!("recv_from on {} failed: {}", local, e);
                continue;
            }
            Err(e) => {
                errors += 1;
                if errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                    warn!("recv_from on {} failed {} times in a row, stopping: {}", local, errors, e);
                    break;
                }
                let pause = recv_error_backoff(errors);
                debug!("recv_from on {} failed: {}; retrying in {:?}", local, e, pause);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => continue,
                }
            }
        };

        let data = Bytes::copy_from_slice(&buf[..len]);
        let kind = if is_stun_message(&data) {
            match Message::decode(&data) {
                Ok(message) if message.message_type.is_response() => {
                    match engine.handle_response(message, data, from) {
                        None => continue,
                        Some((message, raw)) => PacketKind::Stun { message, raw },
                    }
                }
                Ok(message) => PacketKind::Stun { message, raw: data },
                Err(e) => {
                    debug!("Dropping undecodable STUN packet from {}: {}", from, e);
                    continue;
                }
            }
        } else {
            PacketKind::Data(data)
        };

        if sink.send(InboundPacket { socket: id, local, from, kind }).is_err() {
            warn!("Inbound channel for {} closed, stopping receive loop", local);
            break;
        }
    }

    trace!("Receive loop on {} finished", local);
}

/// Errors that report a past send rather than a broken socket
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn recv_error_backoff(consecutive: u32) -> Duration {
    let shift = consecutive.saturating_sub(1).min(16);
    RECV_ERROR_BACKOFF
        .saturating_mul(1 << shift)
        .min(RECV_ERROR_BACKOFF_MAX)
}
