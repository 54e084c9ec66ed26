//! In-process change propagation for committed order mutations.
//!
//! Subscribers register an [`Interest`] and receive every matching
//! [`OrderEvent`] on a bounded channel. Delivery is best effort: a full
//! channel drops the event and bumps the subscription's missed counter, after
//! which the subscriber is expected to re-read through the repository. The
//! repository, not this hub, is the source of truth.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::types::{Order, OrderId, OrderStatus, ProfileId, Role};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEventKind {
    Created,
    Claimed,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub kind: OrderEventKind,
    pub order: Order,
    #[serde(default)]
    pub previous_status: Option<OrderStatus>,
}

impl OrderEvent {
    pub fn created(order: Order) -> Self {
        Self {
            kind: OrderEventKind::Created,
            order,
            previous_status: None,
        }
    }

    pub fn claimed(order: Order) -> Self {
        Self {
            kind: OrderEventKind::Claimed,
            order,
            previous_status: Some(OrderStatus::Pending),
        }
    }

    pub fn completed(order: Order) -> Self {
        Self {
            kind: OrderEventKind::Completed,
            order,
            previous_status: Some(OrderStatus::Accepted),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Orders entering or leaving the available pool.
    PendingPool,
    /// Orders where the profile is requester, agent or recipient.
    Involving(ProfileId),
    /// One order, for as long as the reader is allowed to read it.
    Order {
        order_id: OrderId,
        reader: ProfileId,
        role: Role,
    },
}

impl Interest {
    pub fn matches(&self, event: &OrderEvent) -> bool {
        match self {
            Interest::PendingPool => {
                event.order.status == OrderStatus::Pending
                    || event.previous_status == Some(OrderStatus::Pending)
            }
            Interest::Involving(profile_id) => event.order.involves(*profile_id),
            Interest::Order {
                order_id,
                reader,
                role,
            } => event.order.id == *order_id && event.order.readable_by(*reader, *role),
        }
    }

    /// True when `event` takes the order out of the reader's sight, which ends
    /// a single-order subscription.
    pub fn revoked_by(&self, event: &OrderEvent) -> bool {
        match self {
            Interest::Order {
                order_id,
                reader,
                role,
            } => event.order.id == *order_id && !event.order.readable_by(*reader, *role),
            _ => false,
        }
    }
}

struct Entry {
    interest: Interest,
    sender: mpsc::Sender<OrderEvent>,
    missed: Arc<AtomicU64>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: HashMap<u64, Entry>,
    /// Highest revision published per order, keeps per-order commit order.
    published: HashMap<OrderId, u64>,
}

#[derive(Clone)]
pub struct ChangeNotifier {
    registry: Arc<Mutex<Registry>>,
    capacity: usize,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            capacity: capacity.max(1),
        }
    }

    fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
        // The registry holds no invariant a panicking publisher could break.
        registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, interest: Interest) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let missed = Arc::new(AtomicU64::new(0));

        let mut registry = Self::lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.insert(
            id,
            Entry {
                interest,
                sender,
                missed: missed.clone(),
            },
        );
        debug!(subscription = id, ?interest, "subscriber registered");

        Subscription {
            id,
            receiver,
            missed,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Fans `event` out to matching subscribers and returns how many received
    /// it. Events older than one already published for the same order are
    /// discarded.
    pub fn publish(&self, event: OrderEvent) -> usize {
        let mut registry = Self::lock(&self.registry);

        let order_id = event.order.id;
        let revision = event.order.revision;
        if let Some(last) = registry.published.get(&order_id).copied() {
            if last >= revision {
                debug!(%order_id, revision, last, "stale order event discarded");
                return 0;
            }
        }
        registry.published.insert(order_id, revision);

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, entry) in registry.entries.iter() {
            if entry.interest.revoked_by(&event) {
                debug!(subscription = id, %order_id, "read access lost, subscription closed");
                closed.push(*id);
                continue;
            }
            if !entry.interest.matches(&event) {
                continue;
            }
            match entry.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    entry.missed.fetch_add(1, Ordering::Relaxed);
                    warn!(subscription = id, %order_id, "subscriber lagging, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            registry.entries.remove(&id);
        }

        debug!(%order_id, kind = ?event.kind, delivered, "order event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        Self::lock(&self.registry).entries.len()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CHANNEL_CAPACITY)
    }
}

/// Receiving half of a registration. Dropping it unregisters the interest.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<OrderEvent>,
    missed: Arc<AtomicU64>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<OrderEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OrderEvent> {
        self.receiver.try_recv().ok()
    }

    /// Events dropped since the last call. Non-zero means the subscriber's
    /// view is stale and must be rebuilt from a fresh read.
    pub fn take_missed(&self) -> u64 {
        self.missed.swap(0, Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            ChangeNotifier::lock(&registry).entries.remove(&self.id);
        }
    }
}
