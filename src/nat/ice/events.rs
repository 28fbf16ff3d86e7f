// src/nat/ice/events.rs
//! Event bus shared by the agent and its data channels
//!
//! Every subscriber gets its own unbounded queue. Dropping the
//! [`Subscription`] removes it from the bus.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::agent::{IceRole, IceStatus};

/// Events published by an ICE agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceEvent {
    /// Agent status moved from `old` to `new`
    StateChanged {
        /// Status before
        old: IceStatus,
        /// Status after
        new: IceStatus,
    },

    /// A component has its selected pair
    NominationComplete {
        /// Stream index
        stream: usize,
        /// Component id
        component: u16,
        /// Local address of the pair
        local: SocketAddr,
        /// Remote address of the pair
        remote: SocketAddr,
    },

    /// Application bytes are queued on a channel
    BytesAvailable {
        /// Stream index
        stream: usize,
        /// Component id
        component: u16,
        /// Sender of the datagram
        from: SocketAddr,
    },

    /// A role conflict flipped the local role
    RoleChanged {
        /// Role now in effect
        role: IceRole,
    },
}

type Filter = Box<dyn Fn(&IceEvent) -> bool + Send + Sync>;

struct Subscriber {
    filter: Option<Filter>,
    tx: mpsc::UnboundedSender<IceEvent>,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

/// Cloneable handle to one agent's event bus
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event
    pub fn subscribe(&self) -> Subscription {
        self.register(None)
    }

    /// Receive only events for which `filter` returns true
    pub fn subscribe_filtered<F>(&self, filter: F) -> Subscription
    where
        F: Fn(&IceEvent) -> bool + Send + Sync + 'static,
    {
        self.register(Some(Box::new(filter)))
    }

    fn register(&self, filter: Option<Filter>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().insert(id, Subscriber { filter, tx });
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every interested subscriber
    pub fn emit(&self, event: IceEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|_, sub| {
            if sub.filter.as_ref().map_or(true, |f| f(&event)) {
                sub.tx.send(event.clone()).is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });
    }

    /// Live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Drop every subscriber; pending `recv` calls return `None`
    pub fn close(&self) {
        self.inner.subscribers.lock().clear();
    }
}

/// A live subscription; unsubscribes on drop
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<IceEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Wait for the next event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<IceEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<IceEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.lock().remove(&self.id);
        }
    }
}
