//! # Feat Sync
//!
//! Realtime data synchronization for a year-scoped feat tracker.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: one live subscription per remote collection, replaced
//!   wholesale when the chosen year changes
//! - **Transform**: snapshots become sorted lists; feats are filtered by the
//!   realtime cutoff embargo
//! - **Store**: a single state container changed only through [`Action`]s
//! - **Session**: one token shared by every data-access client
//! - **Sync engine**: orchestrates year switches, login/logout and admin
//!   property updates
//!
//! ## Example
//!
//! ```ignore
//! use featsync::{Collaborators, Credentials, MemoryBackend, Store, SyncConfig, SyncEngine};
//! use std::sync::Arc;
//!
//! let backend = MemoryBackend::new();
//! let engine = SyncEngine::new(
//!     SyncConfig::default(),
//!     Arc::new(Store::new()),
//!     Collaborators::from_backend(backend.clone()),
//! );
//!
//! engine.switch_year("2021")?;
//! engine.process_pending();
//!
//! engine.login(&Credentials::new("team", "secret"))?;
//! let state = engine.store().get_state();
//! println!("{} feats visible", state.feats.len());
//! ```

pub mod config;
pub mod error;
pub mod memory;
pub mod remote;
pub mod session;
pub mod store;
pub mod subscriptions;
pub mod sync;
pub mod transform;
pub mod types;

// Re-exports
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use memory::MemoryBackend;
pub use remote::{AuthService, PropertiesBackend, PropertiesPatch, RemoteError, SnapshotSource};
pub use session::{
    ClientKind, DataClient, DataClients, FileSessionStorage, MemorySessionStorage,
    SessionGateway, SessionStorage, TokenCell,
};
pub use store::{reduce, Action, Store};
pub use subscriptions::{
    Delivery, ListenTarget, ListenerRegistration, SnapshotSink, SubscriptionHandle,
    SubscriptionId, SubscriptionRegistry,
};
pub use sync::{Collaborators, SyncEngine, YearPhase};
pub use transform::FeatVisibility;
pub use types::*;
