//! The application store: one state container, changed only by dispatching
//! an [`Action`].

use crate::types::{AppState, Feat, Location, UnixTime, User, YearInfo, YearProperties};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Every way the store can change. Each variant replaces whole fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Login {
        user: User,
    },
    Logout,
    UpdateUser {
        user: Option<User>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateChosenYear {
        chosen_year: String,
    },
    #[serde(rename_all = "camelCase")]
    UpdateActiveYear {
        active_year: String,
    },
    #[serde(rename_all = "camelCase")]
    UpdateYearProperties {
        start_date: Option<UnixTime>,
        realtime_cutoff_time: Option<UnixTime>,
        finished: Option<bool>,
        info: YearInfo,
    },
    #[serde(rename_all = "camelCase")]
    UpdateAvailableYears {
        available_years: Vec<String>,
    },
    UpdateLocations {
        locations: Vec<Location>,
    },
    UpdateUsers {
        users: Vec<User>,
    },
    UpdateFeats {
        feats: Vec<Feat>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateStartDate {
        start_date: Option<UnixTime>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateCutoffTime {
        realtime_cutoff_time: Option<UnixTime>,
    },
}

impl Action {
    pub fn year_properties(properties: YearProperties) -> Self {
        Action::UpdateYearProperties {
            start_date: properties.start_date,
            realtime_cutoff_time: properties.realtime_cutoff_time,
            finished: properties.finished,
            info: properties.info,
        }
    }

    /// Wire name of the action kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Login { .. } => "LOGIN",
            Action::Logout => "LOGOUT",
            Action::UpdateUser { .. } => "UPDATE_USER",
            Action::UpdateChosenYear { .. } => "UPDATE_CHOSEN_YEAR",
            Action::UpdateActiveYear { .. } => "UPDATE_ACTIVE_YEAR",
            Action::UpdateYearProperties { .. } => "UPDATE_YEAR_PROPERTIES",
            Action::UpdateAvailableYears { .. } => "UPDATE_AVAILABLE_YEARS",
            Action::UpdateLocations { .. } => "UPDATE_LOCATIONS",
            Action::UpdateUsers { .. } => "UPDATE_USERS",
            Action::UpdateFeats { .. } => "UPDATE_FEATS",
            Action::UpdateStartDate { .. } => "UPDATE_START_DATE",
            Action::UpdateCutoffTime { .. } => "UPDATE_CUTOFF_TIME",
        }
    }
}

/// Apply `action` to `state`.
pub fn reduce(state: &mut AppState, action: Action) {
    match action {
        Action::Login { user } => state.user = Some(user),
        Action::Logout => state.user = None,
        Action::UpdateUser { user } => state.user = user,
        Action::UpdateChosenYear { chosen_year } => state.chosen_year = Some(chosen_year),
        Action::UpdateActiveYear { active_year } => state.active_year = Some(active_year),
        Action::UpdateYearProperties {
            start_date,
            realtime_cutoff_time,
            finished,
            info,
        } => {
            state.start_date = start_date;
            state.realtime_cutoff_time = realtime_cutoff_time;
            state.finished = finished.unwrap_or(false);
            state.info = info;
        }
        Action::UpdateAvailableYears { available_years } => {
            state.available_years = available_years
        }
        Action::UpdateLocations { locations } => state.locations = locations,
        Action::UpdateUsers { users } => state.users = users,
        Action::UpdateFeats { feats } => state.feats = feats,
        Action::UpdateStartDate { start_date } => state.start_date = start_date,
        Action::UpdateCutoffTime {
            realtime_cutoff_time,
        } => state.realtime_cutoff_time = realtime_cutoff_time,
    }
}

/// Single-writer state container.
///
/// Readers get an immutable snapshot; a dispatch builds the next state and
/// swaps it in, so a snapshot never changes under its holder.
pub struct Store {
    state: RwLock<Arc<AppState>>,
    /// Lock for dispatches, so read-then-write updates see the latest state.
    write_lock: Mutex<()>,
    /// Number of applied dispatches.
    version: AtomicU64,
    watchers: Mutex<Vec<Sender<Arc<AppState>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::with_state(AppState::default())
    }

    pub fn with_state(state: AppState) -> Self {
        Self {
            state: RwLock::new(Arc::new(state)),
            write_lock: Mutex::new(()),
            version: AtomicU64::new(0),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Current state snapshot.
    pub fn get_state(&self) -> Arc<AppState> {
        Arc::clone(&self.state.read())
    }

    /// Apply an action. Readers see the new state once this returns.
    pub fn dispatch(&self, action: Action) {
        self.dispatch_with(|_| Some(action));
    }

    /// Build an action from the state current at write time and apply it.
    /// Returns false if `build` produced nothing.
    pub fn dispatch_with<F>(&self, build: F) -> bool
    where
        F: FnOnce(&AppState) -> Option<Action>,
    {
        let _lock = self.write_lock.lock();

        let current = self.get_state();
        let action = match build(&current) {
            Some(action) => action,
            None => return false,
        };

        debug!(kind = action.kind(), "dispatch");

        let mut next = AppState::clone(&current);
        reduce(&mut next, action);
        let next = Arc::new(next);

        *self.state.write() = Arc::clone(&next);
        self.version.fetch_add(1, Ordering::SeqCst);
        self.notify(next);
        true
    }

    /// Number of dispatches applied so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Receive every state produced by later dispatches.
    pub fn watch(&self) -> Receiver<Arc<AppState>> {
        let (sender, receiver) = unbounded();
        self.watchers.lock().push(sender);
        receiver
    }

    fn notify(&self, state: Arc<AppState>) {
        // Drop watchers whose receiver is gone.
        self.watchers
            .lock()
            .retain(|watcher| watcher.send(Arc::clone(&state)).is_ok());
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserType;
    use serde_json::json;

    fn admin() -> User {
        User {
            id: "root".to_string(),
            name: "Root".to_string(),
            user_type: UserType::Admin,
            points: 0,
        }
    }

    #[test]
    fn test_login_logout() {
        let store = Store::new();
        store.dispatch(Action::Login { user: admin() });
        assert_eq!(store.get_state().user, Some(admin()));

        store.dispatch(Action::Logout);
        assert_eq!(store.get_state().user, None);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn test_snapshot_not_mutated_by_later_dispatch() {
        let store = Store::new();
        store.dispatch(Action::UpdateChosenYear {
            chosen_year: "2020".to_string(),
        });
        let before = store.get_state();

        store.dispatch(Action::UpdateChosenYear {
            chosen_year: "2021".to_string(),
        });

        assert_eq!(before.chosen_year.as_deref(), Some("2020"));
        assert_eq!(store.get_state().chosen_year.as_deref(), Some("2021"));
    }

    #[test]
    fn test_year_properties_sets_four_fields() {
        let store = Store::new();
        store.dispatch(Action::UpdateAvailableYears {
            available_years: vec!["2021".into()],
        });
        store.dispatch(Action::year_properties(YearProperties {
            start_date: Some(1),
            realtime_cutoff_time: Some(2),
            finished: Some(true),
            info: YearInfo {
                what: Some("Crawl".into()),
                ..Default::default()
            },
        }));

        let state = store.get_state();
        assert_eq!(state.start_date, Some(1));
        assert_eq!(state.realtime_cutoff_time, Some(2));
        assert!(state.finished);
        assert_eq!(state.info.what.as_deref(), Some("Crawl"));
        assert_eq!(state.available_years, vec!["2021"]);
    }

    #[test]
    fn test_start_date_and_cutoff_updates() {
        let store = Store::new();
        store.dispatch(Action::UpdateStartDate {
            start_date: Some(10),
        });
        store.dispatch(Action::UpdateCutoffTime {
            realtime_cutoff_time: Some(20),
        });
        let state = store.get_state();
        assert_eq!(state.start_date, Some(10));
        assert_eq!(state.realtime_cutoff_time, Some(20));
    }

    #[test]
    fn test_dispatch_with_none_is_noop() {
        let store = Store::new();
        assert!(!store.dispatch_with(|_| None));
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_watchers_see_each_state() {
        let store = Store::new();
        let watcher = store.watch();
        store.dispatch(Action::UpdateActiveYear {
            active_year: "2021".into(),
        });
        let state = watcher.try_recv().unwrap();
        assert_eq!(state.active_year.as_deref(), Some("2021"));

        drop(watcher);
        store.dispatch(Action::Logout);
        assert!(store.watchers.lock().is_empty());
    }

    #[test]
    fn test_action_wire_format() {
        let action: Action = serde_json::from_value(json!({
            "type": "UPDATE_CHOSEN_YEAR",
            "chosenYear": "2021"
        }))
        .unwrap();
        assert_eq!(
            action,
            Action::UpdateChosenYear {
                chosen_year: "2021".into()
            }
        );
        assert_eq!(
            serde_json::to_value(Action::Logout).unwrap(),
            json!({"type": "LOGOUT"})
        );
        assert_eq!(action.kind(), "UPDATE_CHOSEN_YEAR");
    }
}
