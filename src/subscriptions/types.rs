//! Subscription types for live collection snapshots.

use crate::types::{Collection, Snapshot};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a live subscription watches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenTarget {
    pub collection: Collection,
    /// `None` for global collections.
    pub year: Option<String>,
}

impl ListenTarget {
    /// Target for `collection`, scoped to `year` when the collection is
    /// year-scoped.
    pub fn for_year(collection: Collection, year: &str) -> Self {
        Self {
            collection,
            year: collection.is_year_scoped().then(|| year.to_string()),
        }
    }
}

/// A snapshot queued for the sync engine.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub collection: Collection,
    pub snapshot: Snapshot,
}

/// Snapshots that found the delivery queue full, newest one per subscription.
///
/// A held snapshot is always newer than anything still queued for the same
/// subscription, so it is handed out only once the queue is empty.
#[derive(Debug, Default)]
pub(crate) struct Overflow {
    order: VecDeque<SubscriptionId>,
    latest: HashMap<SubscriptionId, Delivery>,
}

impl Overflow {
    /// Replace the held snapshot for the delivery's subscription, if any.
    /// Gives the delivery back when nothing is held for it.
    fn replace(&mut self, delivery: Delivery) -> Option<Delivery> {
        match self.latest.get_mut(&delivery.subscription) {
            Some(held) => {
                held.snapshot = delivery.snapshot;
                None
            }
            None => Some(delivery),
        }
    }

    pub(crate) fn hold(&mut self, delivery: Delivery) {
        let id = delivery.subscription;
        if self.latest.insert(id, delivery).is_none() {
            self.order.push_back(id);
        }
    }

    /// Oldest held delivery.
    pub(crate) fn pop(&mut self) -> Option<Delivery> {
        while let Some(id) = self.order.pop_front() {
            if let Some(delivery) = self.latest.remove(&id) {
                return Some(delivery);
            }
        }
        None
    }

    /// Drop held deliveries whose subscription fails `live`. Returns how
    /// many were dropped.
    pub(crate) fn retain(&mut self, mut live: impl FnMut(SubscriptionId) -> bool) -> usize {
        let before = self.latest.len();
        self.latest.retain(|id, _| live(*id));
        let latest = &self.latest;
        self.order.retain(|id| latest.contains_key(id));
        before - self.latest.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.latest.len()
    }
}

/// Write end of a subscription, handed to the remote source.
///
/// Cloning is cheap; all clones stop delivering once the subscription is
/// canceled.
#[derive(Clone)]
pub struct SnapshotSink {
    pub(crate) subscription: SubscriptionId,
    pub(crate) collection: Collection,
    pub(crate) sender: Sender<Delivery>,
    pub(crate) overflow: Arc<Mutex<Overflow>>,
    pub(crate) active: Arc<AtomicBool>,
}

impl SnapshotSink {
    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Queue a snapshot. Returns false once the subscription is canceled, so
    /// the source can forget this listener.
    ///
    /// When the queue is full the snapshot is held aside instead, replacing
    /// any snapshot already held for this subscription.
    pub fn deliver(&self, snapshot: Snapshot) -> bool {
        if !self.is_active() {
            return false;
        }

        let delivery = Delivery {
            subscription: self.subscription,
            collection: self.collection,
            snapshot,
        };

        // Held across the send so a queued snapshot never overtakes a held one.
        let mut overflow = self.overflow.lock();
        let delivery = match overflow.replace(delivery) {
            Some(delivery) => delivery,
            None => {
                debug!(subscription = %self.subscription, collection = %self.collection, "held snapshot replaced");
                return true;
            }
        };

        match self.sender.try_send(delivery) {
            Ok(()) => {
                debug!(subscription = %self.subscription, collection = %self.collection, "snapshot queued");
                true
            }
            Err(TrySendError::Full(delivery)) => {
                warn!(subscription = %self.subscription, collection = %self.collection, "delivery buffer full, holding latest snapshot");
                overflow.hold(delivery);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl fmt::Debug for SnapshotSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotSink")
            .field("subscription", &self.subscription)
            .field("collection", &self.collection)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Remote-side cancel hook returned by a snapshot source.
pub struct ListenerRegistration {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerRegistration {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// Registration with nothing to detach.
    pub fn noop() -> Self {
        Self { detach: None }
    }

    /// Detach from the remote. Runs the hook at most once.
    pub fn detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// A live subscription owned by the registry.
///
/// Canceling is idempotent. A handle that is dropped while still live cancels
/// itself, so every handle is canceled exactly once.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub target: ListenTarget,
    pub(crate) active: Arc<AtomicBool>,
    pub(crate) registration: Option<ListenerRegistration>,
}

impl SubscriptionHandle {
    pub fn is_live(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop deliveries and detach from the remote. Returns false if the
    /// handle was already canceled.
    pub fn cancel(&mut self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(mut registration) = self.registration.take() {
            registration.detach();
        }
        debug!(subscription = %self.id, collection = %self.target.collection, "subscription canceled");
        true
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
