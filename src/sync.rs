//! Sync engine: ties subscriptions, the store and the session together and
//! drives year switches.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::remote::{AuthService, PropertiesBackend, PropertiesPatch, RemoteError, SnapshotSource};
use crate::session::{FileSessionStorage, MemorySessionStorage, SessionGateway, SessionStorage};
use crate::store::{Action, Store};
use crate::subscriptions::{Delivery, SubscriptionId, SubscriptionRegistry};
use crate::transform::{self, FeatVisibility};
use crate::types::{Collection, Credentials, Session, Snapshot, UnixTime, User, YearProperties};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the engine is in a year switch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum YearPhase {
    /// Nothing in flight. `loaded` is the year whose subscriptions are open.
    Idle { loaded: Option<String> },
    /// Tearing down and reopening for `target`. A request arriving meanwhile
    /// is parked in `pending`; the newest one wins.
    Switching {
        target: String,
        pending: Option<String>,
    },
}

/// The remote services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SnapshotSource>,
    pub auth: Arc<dyn AuthService>,
    pub properties: Arc<dyn PropertiesBackend>,
    /// Session slot. None = derive from [`SyncConfig::session_path`].
    pub storage: Option<Arc<dyn SessionStorage>>,
}

impl Collaborators {
    /// Use one backend for every remote service.
    pub fn from_backend<B>(backend: B) -> Self
    where
        B: SnapshotSource + AuthService + PropertiesBackend + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            source: backend.clone(),
            auth: backend.clone(),
            properties: backend,
            storage: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }
}

/// Keeps the store in sync with the remote collections of the chosen year.
pub struct SyncEngine {
    store: Arc<Store>,
    registry: SubscriptionRegistry,
    session: SessionGateway,
    properties: Arc<dyn PropertiesBackend>,
    phase: Mutex<YearPhase>,
    /// Last live feats snapshot, re-filtered when the viewer or cutoff changes.
    last_feats: Mutex<Option<(SubscriptionId, Snapshot)>>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, store: Arc<Store>, collaborators: Collaborators) -> Self {
        let storage: Arc<dyn SessionStorage> = match (collaborators.storage, &config.session_path)
        {
            (Some(storage), _) => storage,
            (None, Some(path)) => Arc::new(FileSessionStorage::new(path)),
            (None, None) => Arc::new(MemorySessionStorage::new()),
        };

        let session = SessionGateway::new(
            collaborators.auth,
            storage,
            Arc::clone(&store),
            config.auth_fallback_message.clone(),
        );

        Self {
            registry: SubscriptionRegistry::new(collaborators.source, config.delivery_buffer),
            session,
            properties: collaborators.properties,
            store,
            phase: Mutex::new(YearPhase::Idle { loaded: None }),
            last_feats: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn session(&self) -> &SessionGateway {
        &self.session
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn phase(&self) -> YearPhase {
        self.phase.lock().clone()
    }

    // --- Year switching ---

    /// Make `year` the chosen year.
    ///
    /// No-op if `year` is already loaded. While another switch is running the
    /// request is parked and performed once that switch finishes.
    pub fn switch_year(&self, year: &str) -> Result<()> {
        let (mut from, mut target) = {
            let mut phase = self.phase.lock();
            match &mut *phase {
                YearPhase::Switching { target, pending } => {
                    debug!(year, in_flight = %target, "year switch queued");
                    *pending = Some(year.to_string());
                    return Ok(());
                }
                YearPhase::Idle { loaded } if loaded.as_deref() == Some(year) => return Ok(()),
                YearPhase::Idle { loaded } => {
                    let from = loaded.take();
                    *phase = YearPhase::Switching {
                        target: year.to_string(),
                        pending: None,
                    };
                    (from, year.to_string())
                }
            }
        };

        loop {
            let result = self.perform_switch(from.as_deref(), &target);

            let mut phase = self.phase.lock();
            let pending = match &mut *phase {
                YearPhase::Switching { pending, .. } => pending.take(),
                YearPhase::Idle { .. } => None,
            };

            match pending {
                Some(next) if next != target => {
                    info!(superseded = %target, year = %next, "running queued year switch");
                    *phase = YearPhase::Switching {
                        target: next.clone(),
                        pending: None,
                    };
                    from = Some(target);
                    target = next;
                }
                _ => {
                    *phase = YearPhase::Idle {
                        loaded: result.is_ok().then(|| target.clone()),
                    };
                    return result;
                }
            }
        }
    }

    fn perform_switch(&self, from: Option<&str>, year: &str) -> Result<()> {
        info!(from = ?from, year, "switching year");

        self.store.dispatch(Action::UpdateChosenYear {
            chosen_year: year.to_string(),
        });

        self.registry.cancel_all();
        self.clear_year_data();

        if from.is_some() {
            if let Err(e) = self.session.logout() {
                warn!(error = %e, "failed to clear persisted session");
            }
        }
        // Only a session restored for `year` may hand out a token again.
        self.session.clear_token();

        self.registry.replace_all(year)?;

        let restored = self.session.restore(year);
        self.store.dispatch(Action::UpdateUser {
            user: restored.map(|session| session.user),
        });

        info!(year, "year loaded");
        Ok(())
    }

    /// Drop everything derived from the previous year's subscriptions.
    fn clear_year_data(&self) {
        *self.last_feats.lock() = None;
        self.store.dispatch(Action::UpdateFeats { feats: Vec::new() });
        self.store.dispatch(Action::UpdateUsers { users: Vec::new() });
        self.store
            .dispatch(Action::UpdateLocations { locations: Vec::new() });
        self.store
            .dispatch(Action::year_properties(YearProperties::default()));
    }

    /// Cancel every subscription, e.g. when the view goes away.
    pub fn shutdown(&self) {
        self.registry.cancel_all();
        self.session.clear_token();
        *self.last_feats.lock() = None;
        *self.phase.lock() = YearPhase::Idle { loaded: None };
        info!("sync engine shut down");
    }

    // --- Session ---

    /// Log in for the chosen year, persist the session and fan out its token.
    pub fn login(&self, credentials: &Credentials) -> Result<Session> {
        let year = self
            .store
            .get_state()
            .chosen_year
            .clone()
            .ok_or_else(|| SyncError::Auth("no year selected".into()))?;

        let session = self.session.login(credentials, &year)?;

        if let Err(e) = self.session.persist(&session) {
            warn!(error = %e, "failed to persist session");
        }
        self.session.set_token(session.token.clone());
        self.store.dispatch(Action::Login {
            user: session.user.clone(),
        });
        self.refilter_feats();

        Ok(session)
    }

    /// Log out and hide embargoed feats again.
    pub fn logout(&self) -> Result<()> {
        let result = self.session.logout();
        self.refilter_feats();
        result
    }

    // --- Admin ---

    pub fn update_start_date(&self, start_date: UnixTime) -> Result<()> {
        let patch = PropertiesPatch {
            start_date: Some(start_date),
            ..Default::default()
        };
        self.update_properties(&patch)?;
        self.store.dispatch(Action::UpdateStartDate {
            start_date: Some(start_date),
        });
        Ok(())
    }

    pub fn update_cutoff_time(&self, cutoff: UnixTime) -> Result<()> {
        let patch = PropertiesPatch {
            realtime_cutoff_time: Some(cutoff),
            ..Default::default()
        };
        self.update_properties(&patch)?;
        self.store.dispatch(Action::UpdateCutoffTime {
            realtime_cutoff_time: Some(cutoff),
        });
        self.refilter_feats();
        Ok(())
    }

    fn update_properties(&self, patch: &PropertiesPatch) -> Result<()> {
        let state = self.store.get_state();
        let year = state
            .chosen_year
            .as_deref()
            .ok_or_else(|| SyncError::Auth("no year selected".into()))?;

        if !state.user.as_ref().map_or(false, User::is_admin) {
            return Err(SyncError::Auth("admin rights required".into()));
        }

        let authorization = self.session.clients().properties.authorization();
        self.properties
            .update(year, patch, authorization.as_deref())
            .map_err(|e| match e {
                RemoteError::Rejected(message) => {
                    SyncError::Auth(message.unwrap_or_else(|| "update rejected".into()))
                }
                RemoteError::Transport(reason) => SyncError::Network(reason),
            })?;

        info!(year, ?patch, "year properties updated");
        Ok(())
    }

    // --- Delivery processing ---

    /// Apply every queued snapshot without blocking. Returns how many were
    /// applied; stale ones are discarded and not counted.
    pub fn process_pending(&self) -> usize {
        let mut applied = 0;
        while let Some(delivery) = self.registry.try_next() {
            if self.apply(delivery) {
                applied += 1;
            }
        }
        applied
    }

    /// Wait up to `timeout` for one snapshot and apply it.
    pub fn process_next(&self, timeout: Duration) -> bool {
        match self.registry.next_timeout(timeout) {
            Some(delivery) => self.apply(delivery),
            None => false,
        }
    }

    fn apply(&self, delivery: Delivery) -> bool {
        if !self.registry.accept(&delivery) {
            return false;
        }

        let Delivery {
            subscription,
            collection,
            snapshot,
        } = delivery;

        match collection {
            Collection::Locations => self.store.dispatch(Action::UpdateLocations {
                locations: transform::locations(&snapshot),
            }),
            Collection::Users => self.store.dispatch(Action::UpdateUsers {
                users: transform::users(&snapshot),
            }),
            Collection::Feats => {
                self.dispatch_feats(&snapshot);
                *self.last_feats.lock() = Some((subscription, snapshot));
            }
            Collection::ActiveYear => match transform::active_year(&snapshot) {
                Some(active_year) => self.store.dispatch(Action::UpdateActiveYear { active_year }),
                None => return false,
            },
            Collection::YearProperties => match transform::year_properties(&snapshot) {
                Some(properties) => {
                    self.store.dispatch(Action::year_properties(properties));
                    self.refilter_feats();
                }
                None => return false,
            },
            Collection::AvailableYears => self.store.dispatch(Action::UpdateAvailableYears {
                available_years: transform::available_years(&snapshot),
            }),
        }
        true
    }

    /// Filter against the viewer and cutoff current at write time.
    fn dispatch_feats(&self, snapshot: &Snapshot) {
        self.store.dispatch_with(|state| {
            Some(Action::UpdateFeats {
                feats: transform::feats(snapshot, &FeatVisibility::from_state(state)),
            })
        });
    }

    fn refilter_feats(&self) {
        let last = self.last_feats.lock();
        if let Some((subscription, snapshot)) = last.as_ref() {
            if self.registry.is_live(*subscription) {
                self.dispatch_feats(snapshot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::types::{Document, UserType};
    use serde_json::json;

    fn engine(backend: &MemoryBackend) -> SyncEngine {
        SyncEngine::new(
            SyncConfig::default(),
            Arc::new(Store::new()),
            Collaborators::from_backend(backend.clone()),
        )
    }

    #[test]
    fn test_initial_switch_opens_subscriptions() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend);

        engine.switch_year("2021").unwrap();

        assert_eq!(
            engine.phase(),
            YearPhase::Idle {
                loaded: Some("2021".into())
            }
        );
        assert_eq!(engine.registry().live_count(), Collection::ALL.len());
        assert_eq!(
            engine.store().get_state().chosen_year.as_deref(),
            Some("2021")
        );
    }

    #[test]
    fn test_same_year_is_noop() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend);
        engine.switch_year("2021").unwrap();
        let version = engine.store().version();

        engine.switch_year("2021").unwrap();
        assert_eq!(engine.store().version(), version);
    }

    #[test]
    fn test_request_during_switch_is_parked() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend);
        *engine.phase.lock() = YearPhase::Switching {
            target: "2020".into(),
            pending: None,
        };

        engine.switch_year("2021").unwrap();
        engine.switch_year("2022").unwrap();

        assert_eq!(
            engine.phase(),
            YearPhase::Switching {
                target: "2020".into(),
                pending: Some("2022".into())
            }
        );
        assert_eq!(engine.registry().live_count(), 0);
    }

    #[test]
    fn test_feats_refiltered_when_cutoff_arrives_late() {
        let backend = MemoryBackend::new();
        backend.set_documents(
            Collection::Feats,
            "2021",
            vec![Document::new("f1", json!({"user": "u1", "date": 50}))],
        );
        let engine = engine(&backend);
        engine.switch_year("2021").unwrap();
        engine.process_pending();
        assert!(engine.store().get_state().feats.is_empty());

        backend.set_document(
            Collection::YearProperties,
            "2021",
            json!({"realtimeCutoffTime": 100}),
        );
        engine.process_pending();
        assert_eq!(engine.store().get_state().feats.len(), 1);
    }

    #[test]
    fn test_admin_update_requires_admin() {
        let backend = MemoryBackend::new();
        backend.add_account(
            "team",
            "pw",
            User {
                id: "t".into(),
                name: "Team".into(),
                user_type: UserType::Team,
                points: 0,
            },
        );
        let engine = engine(&backend);
        engine.switch_year("2021").unwrap();
        engine.login(&Credentials::new("team", "pw")).unwrap();

        let err = engine.update_start_date(10).unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        assert_eq!(engine.store().get_state().start_date, None);
    }

    #[test]
    fn test_shutdown_cancels_everything() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend);
        engine.switch_year("2021").unwrap();
        engine.shutdown();

        assert_eq!(engine.registry().live_count(), 0);
        assert_eq!(backend.listener_count(), 0);
        assert_eq!(engine.phase(), YearPhase::Idle { loaded: None });
    }
}
