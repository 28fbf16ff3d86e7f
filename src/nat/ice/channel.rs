// src/nat/ice/channel.rs
//! Datagram channels over selected pairs
//!
//! Non-STUN datagrams arriving on a component's sockets are queued in a
//! bounded [`ComponentQueue`]; the oldest datagram is dropped when the queue
//! is full. Writes go out the selected pair's local socket and never wait.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::nat::error::{IceError, IceResult};
use super::agent::IceAgent;
use super::events::{IceEvent, Subscription};

/// Bounded receive queue of one component
#[derive(Debug)]
pub struct ComponentQueue {
    items: Mutex<VecDeque<(SocketAddr, Bytes)>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl ComponentQueue {
    /// Queue holding at most `capacity` datagrams
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue, evicting the oldest datagram when full
    pub fn push(&self, from: SocketAddr, data: Bytes) {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Receive queue full, dropped oldest datagram");
            }
            items.push_back((from, data));
        }
        self.notify.notify_one();
    }

    /// Oldest datagram, if any
    pub fn try_pop(&self) -> Option<(SocketAddr, Bytes)> {
        self.items.lock().pop_front()
    }

    /// Wait for the next datagram
    pub async fn pop(&self) -> IceResult<(SocketAddr, Bytes)> {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return Ok(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(IceError::AgentClosed);
            }
            notified.await;
        }
    }

    /// Wake waiters; `pop` fails once the queue is drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Queued datagrams
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Datagrams evicted because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Application view of one (stream, component)
#[derive(Clone)]
pub struct Channel {
    agent: IceAgent,
    stream: usize,
    component: u16,
}

impl Channel {
    pub(crate) fn new(agent: IceAgent, stream: usize, component: u16) -> Self {
        Self { agent, stream, component }
    }

    /// Stream index
    pub fn stream(&self) -> usize {
        self.stream
    }

    /// Component id
    pub fn component(&self) -> u16 {
        self.component
    }

    fn queue(&self) -> IceResult<std::sync::Arc<ComponentQueue>> {
        self.agent.queue(self.stream, self.component).ok_or(IceError::AgentClosed)
    }

    /// Next queued datagram, without waiting
    pub fn read(&self) -> Option<Bytes> {
        self.read_from().map(|(_, data)| data)
    }

    /// Next queued datagram and its source, without waiting
    pub fn read_from(&self) -> Option<(SocketAddr, Bytes)> {
        self.queue().ok()?.try_pop()
    }

    /// Wait for a datagram
    pub async fn receive(&self) -> IceResult<(SocketAddr, Bytes)> {
        self.queue()?.pop().await
    }

    /// Send over the selected pair; fails before a pair is selected
    pub fn write(&self, data: &[u8]) -> IceResult<usize> {
        let (socket, remote) = self.agent.selected_route(self.stream, self.component).ok_or_else(|| {
            IceError::InvalidState(format!(
                "no selected pair for stream {} component {}",
                self.stream, self.component
            ))
        })?;
        socket.send_to(data, remote)
    }

    /// Send to an explicit peer from this component's first socket
    pub fn send_to(&self, data: &[u8], peer: SocketAddr) -> IceResult<usize> {
        let socket = self
            .agent
            .component_socket(self.stream, self.component, peer)
            .ok_or(IceError::AgentClosed)?;
        socket.send_to(data, peer)
    }

    /// Subscribe to `BytesAvailable` for this channel
    pub fn add_listener(&self) -> Subscription {
        let (stream, component) = (self.stream, self.component);
        self.agent.events().subscribe_filtered(move |event| {
            matches!(event, IceEvent::BytesAvailable { stream: s, component: c, .. } if *s == stream && *c == component)
        })
    }

    /// Datagrams lost to queue overflow
    pub fn dropped(&self) -> u64 {
        self.queue().map(|q| q.dropped()).unwrap_or(0)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("stream", &self.stream)
            .field("component", &self.component)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn test_queue_drops_oldest() {
        let queue = ComponentQueue::new(3);
        for i in 0..5u8 {
            queue.push(peer(), Bytes::from(vec![i]));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.try_pop().unwrap().1, Bytes::from(vec![2u8]));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(ComponentQueue::new(8));
        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.pop().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(peer(), Bytes::from_static(b"Testing"));

        let (from, data) = waiter.await.unwrap().unwrap();
        assert_eq!(from, peer());
        assert_eq!(&data[..], b"Testing");
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let queue = Arc::new(ComponentQueue::new(8));
        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.pop().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(matches!(waiter.await.unwrap(), Err(IceError::AgentClosed)));
    }
}
