//! Live subscriptions to remote collections.
//!
//! The registry opens one subscription per monitored collection and hands
//! each remote listener a [`SnapshotSink`]. Snapshots land on a single
//! channel as [`Delivery`] values; the sync engine drains it and asks the
//! registry whether each delivery is still live before applying it.
//!
//! Cancellation guarantees:
//! - canceling is idempotent and detaches the remote listener once
//! - a sink stops accepting snapshots as soon as its handle is canceled
//! - deliveries already queued for a canceled handle are discarded
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new(source, None);
//! registry.replace_all("2021")?;
//!
//! while let Some(delivery) = registry.try_next() {
//!     if registry.accept(&delivery) {
//!         apply(delivery);
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionRegistry;
pub use types::{
    Delivery, ListenTarget, ListenerRegistration, SnapshotSink, SubscriptionHandle,
    SubscriptionId,
};
