//! Subscription registry: the set of live snapshot subscriptions.

use crate::error::{Result, SyncError};
use crate::remote::SnapshotSource;
use crate::types::Collection;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{
    Delivery, ListenTarget, Overflow, SnapshotSink, SubscriptionHandle, SubscriptionId,
};

/// Owns every live subscription and the channel their snapshots arrive on.
pub struct SubscriptionRegistry {
    source: Arc<dyn SnapshotSource>,
    /// Live handles by ID. A delivery is applied only while its ID is here.
    handles: Mutex<HashMap<SubscriptionId, SubscriptionHandle>>,
    /// Serializes replace-all so two teardowns never interleave.
    replace_lock: Mutex<()>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    sender: Sender<Delivery>,
    receiver: Receiver<Delivery>,
    /// Latest snapshots that did not fit in a bounded queue.
    overflow: Arc<Mutex<Overflow>>,
}

impl SubscriptionRegistry {
    /// Create a registry over `source`. `buffer` bounds the delivery queue;
    /// `None` leaves it unbounded.
    pub fn new(source: Arc<dyn SnapshotSource>, buffer: Option<usize>) -> Self {
        let (sender, receiver) = match buffer {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        Self {
            source,
            handles: Mutex::new(HashMap::new()),
            replace_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            sender,
            receiver,
            overflow: Arc::new(Mutex::new(Overflow::default())),
        }
    }

    /// Cancel everything, then open one subscription per monitored collection
    /// for `year`.
    ///
    /// On failure the error names the collection that could not be opened;
    /// subscriptions opened before it stay registered.
    pub fn replace_all(&self, year: &str) -> Result<Vec<SubscriptionId>> {
        let _guard = self.replace_lock.lock();

        self.cancel_all();

        let mut opened = Vec::with_capacity(Collection::ALL.len());
        for collection in Collection::ALL {
            let id = self.open(ListenTarget::for_year(collection, year))?;
            opened.push(id);
        }

        debug!(year, count = opened.len(), "subscriptions replaced");
        Ok(opened)
    }

    /// Open a single subscription.
    pub fn open(&self, target: ListenTarget) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let active = Arc::new(AtomicBool::new(true));
        let collection = target.collection;

        // Registered before listening, so a snapshot delivered from inside
        // `listen` is already accepted.
        self.handles.lock().insert(
            id,
            SubscriptionHandle {
                id,
                target: target.clone(),
                active: Arc::clone(&active),
                registration: None,
            },
        );

        let sink = SnapshotSink {
            subscription: id,
            collection,
            sender: self.sender.clone(),
            overflow: Arc::clone(&self.overflow),
            active,
        };

        match self.source.listen(&target, sink) {
            Ok(registration) => {
                let orphaned = match self.handles.lock().get_mut(&id) {
                    Some(handle) => {
                        handle.registration = Some(registration);
                        None
                    }
                    None => Some(registration),
                };
                // Canceled while listening; detach right away.
                if let Some(mut registration) = orphaned {
                    registration.detach();
                }
                debug!(subscription = %id, %collection, year = ?target.year, "subscription opened");
                Ok(id)
            }
            Err(e) => {
                if let Some(mut handle) = self.handles.lock().remove(&id) {
                    handle.cancel();
                }
                warn!(%collection, error = %e, "failed to open subscription");
                Err(SyncError::Subscription {
                    collection,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Cancel one subscription. Returns false if it was not live.
    pub fn cancel(&self, id: SubscriptionId) -> bool {
        let removed = self.handles.lock().remove(&id);
        match removed {
            Some(mut handle) => handle.cancel(),
            None => false,
        }
    }

    /// Cancel every subscription and empty the registry. Returns how many
    /// were live.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<SubscriptionHandle> = self.handles.lock().drain().map(|(_, h)| h).collect();
        let count = drained.len();
        // Detach outside the lock: a source may deliver from its detach hook.
        for mut handle in drained {
            handle.cancel();
        }
        if count > 0 {
            debug!(count, "subscriptions canceled");
        }
        self.purge_stale();
        count
    }

    /// Drop queued and held deliveries whose subscription is no longer live,
    /// so they cannot crowd out a bounded queue. Returns how many were
    /// dropped.
    fn purge_stale(&self) -> usize {
        // Sinks send while holding the overflow lock, so the queue is ours
        // until it is released.
        let mut overflow = self.overflow.lock();
        let queued: Vec<Delivery> = self.receiver.try_iter().collect();

        let handles = self.handles.lock();
        let live = |id: SubscriptionId| {
            handles
                .get(&id)
                .map_or(false, SubscriptionHandle::is_live)
        };

        let mut dropped = overflow.retain(live);
        for delivery in queued {
            if !live(delivery.subscription) {
                dropped += 1;
                continue;
            }
            if let Err(TrySendError::Full(delivery) | TrySendError::Disconnected(delivery)) =
                self.sender.try_send(delivery)
            {
                overflow.hold(delivery);
            }
        }

        if dropped > 0 {
            debug!(dropped, "stale deliveries purged");
        }
        dropped
    }

    /// Whether `delivery` comes from a live subscription. Deliveries from
    /// canceled subscriptions are discarded by the caller.
    pub fn accept(&self, delivery: &Delivery) -> bool {
        let live = self
            .handles
            .lock()
            .get(&delivery.subscription)
            .map_or(false, SubscriptionHandle::is_live);
        if !live {
            debug!(subscription = %delivery.subscription, collection = %delivery.collection, "stale delivery discarded");
        }
        live
    }

    pub fn is_live(&self, id: SubscriptionId) -> bool {
        self.handles.lock().contains_key(&id)
    }

    /// Get live subscription count.
    pub fn live_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Targets of every live subscription.
    pub fn live_targets(&self) -> Vec<ListenTarget> {
        self.handles
            .lock()
            .values()
            .map(|handle| handle.target.clone())
            .collect()
    }

    /// Next queued delivery, if any (non-blocking). Held overflow snapshots
    /// come out once the queue is empty.
    pub fn try_next(&self) -> Option<Delivery> {
        self.receiver
            .try_recv()
            .ok()
            .or_else(|| self.overflow.lock().pop())
    }

    /// Wait up to `timeout` for the next queued delivery.
    pub fn next_timeout(&self, timeout: Duration) -> Option<Delivery> {
        if let Some(delivery) = self.try_next() {
            return Some(delivery);
        }
        // A snapshot is only held while the queue is full, which wakes us.
        match self.receiver.recv_timeout(timeout) {
            Ok(delivery) => Some(delivery),
            Err(_) => self.overflow.lock().pop(),
        }
    }

    /// Number of deliveries waiting to be processed, held ones included.
    pub fn pending(&self) -> usize {
        self.receiver.len() + self.overflow.lock().len()
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
