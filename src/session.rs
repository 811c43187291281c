//! Session and token handling.
//!
//! The gateway owns the auth token. Every data-access client reads it through
//! one shared [`TokenCell`], so a token change reaches all of them in a
//! single write and no client can lag behind the others.

use crate::error::{Result, SyncError};
use crate::remote::{AuthService, RemoteError};
use crate::store::{Action, Store};
use crate::types::{Credentials, Session, User};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Persisted session slot. An empty slot means logged out.
pub trait SessionStorage: Send + Sync {
    fn load(&self) -> Result<Option<Session>>;
    fn save(&self, session: &Session) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Session kept as JSON in a single file.
#[derive(Debug)]
pub struct FileSessionStorage {
    path: PathBuf,
}

impl FileSessionStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStorage for FileSessionStorage {
    fn load(&self) -> Result<Option<Session>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;
        let mut contents = String::new();
        let read = file.read_to_string(&mut contents);
        file.unlock()?;
        read?;

        if contents.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let written = (|| -> Result<()> {
            file.set_len(0)?;
            serde_json::to_writer(&mut file, session)?;
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();
        file.unlock()?;
        written
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Session kept in memory, serialized the same way as on disk.
#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    slot: Mutex<Option<String>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw serialized slot contents.
    pub fn raw(&self) -> Option<String> {
        self.slot.lock().clone()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn load(&self) -> Result<Option<Session>> {
        match self.slot.lock().as_deref() {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, session: &Session) -> Result<()> {
        *self.slot.lock() = Some(serde_json::to_string(session)?);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// Shared token slot read by every data-access client.
#[derive(Clone, Debug, Default)]
pub struct TokenCell {
    inner: Arc<RwLock<Option<String>>>,
}

impl TokenCell {
    pub fn get(&self) -> Option<String> {
        self.inner.read().clone()
    }

    fn set(&self, token: Option<String>) {
        *self.inner.write() = token;
    }
}

/// Which remote service a client talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientKind {
    Feats,
    Users,
    Locations,
    Properties,
}

/// A data-access client's view of the current credentials.
#[derive(Clone, Debug)]
pub struct DataClient {
    kind: ClientKind,
    token: TokenCell,
}

impl DataClient {
    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn token(&self) -> Option<String> {
        self.token.get()
    }

    /// Authorization header value for the next request.
    pub fn authorization(&self) -> Option<String> {
        self.token().map(|token| format!("bearer {token}"))
    }
}

/// The clients that depend on the session token.
#[derive(Clone, Debug)]
pub struct DataClients {
    pub feats: DataClient,
    pub users: DataClient,
    pub locations: DataClient,
    pub properties: DataClient,
}

impl DataClients {
    fn sharing(token: &TokenCell) -> Self {
        let client = |kind| DataClient {
            kind,
            token: token.clone(),
        };
        Self {
            feats: client(ClientKind::Feats),
            users: client(ClientKind::Users),
            locations: client(ClientKind::Locations),
            properties: client(ClientKind::Properties),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataClient> {
        [&self.feats, &self.users, &self.locations, &self.properties].into_iter()
    }
}

/// Successful credential exchange body: the token plus the user's fields.
#[derive(Deserialize)]
struct LoginResponse {
    token: String,
    #[serde(flatten)]
    user: User,
}

/// Holds the auth token and turns login/logout into store transitions.
pub struct SessionGateway {
    auth: Arc<dyn AuthService>,
    storage: Arc<dyn SessionStorage>,
    store: Arc<Store>,
    token: TokenCell,
    clients: DataClients,
    fallback_message: String,
}

impl SessionGateway {
    pub fn new(
        auth: Arc<dyn AuthService>,
        storage: Arc<dyn SessionStorage>,
        store: Arc<Store>,
        fallback_message: impl Into<String>,
    ) -> Self {
        let token = TokenCell::default();
        let clients = DataClients::sharing(&token);
        Self {
            auth,
            storage,
            store,
            token,
            clients,
            fallback_message: fallback_message.into(),
        }
    }

    /// Exchange credentials for a session scoped to `year`.
    ///
    /// Does not touch the token, the store or the persisted session.
    pub fn login(&self, credentials: &Credentials, year: &str) -> Result<Session> {
        let credentials = Credentials {
            username: credentials.username.trim().to_string(),
            password: credentials.password.clone(),
        };

        let body = self
            .auth
            .login(&credentials, year)
            .map_err(|e| match e {
                RemoteError::Rejected(message) => {
                    SyncError::Auth(message.unwrap_or_else(|| self.fallback_message.clone()))
                }
                RemoteError::Transport(reason) => SyncError::Network(reason),
            })?;

        let response: LoginResponse = serde_json::from_value(body)
            .map_err(|e| SyncError::Network(format!("unexpected login response: {e}")))?;

        info!(user = %response.user.id, year, "logged in");
        Ok(Session {
            token: response.token,
            user: response.user,
            year: Some(year.to_string()),
        })
    }

    /// Hand `token` to every dependent client at once.
    pub fn set_token(&self, token: impl Into<String>) {
        self.token.set(Some(token.into()));
        debug!("token updated for all clients");
    }

    pub fn clear_token(&self) {
        self.token.set(None);
    }

    pub fn token(&self) -> Option<String> {
        self.token.get()
    }

    pub fn clients(&self) -> &DataClients {
        &self.clients
    }

    pub fn persist(&self, session: &Session) -> Result<()> {
        self.storage.save(session)
    }

    /// Reinstate the persisted session if it was issued for `year`, and fan
    /// out its token. Sessions for another year (or of unknown year) are
    /// discarded rather than reused.
    pub fn restore(&self, year: &str) -> Option<Session> {
        let session = match self.storage.load() {
            Ok(Some(session)) => session,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "persisted session unreadable, ignoring");
                return None;
            }
        };

        if session.year.as_deref() != Some(year) {
            info!(
                session_year = ?session.year,
                year,
                "persisted session belongs to another year, discarding"
            );
            if let Err(e) = self.storage.clear() {
                warn!(error = %e, "failed to clear persisted session");
            }
            return None;
        }

        self.set_token(session.token.clone());
        debug!(user = %session.user.id, year, "session restored");
        Some(session)
    }

    /// Clear the token and the persisted session, then dispatch LOGOUT.
    pub fn logout(&self) -> Result<()> {
        self.clear_token();
        let cleared = self.storage.clear();
        self.store.dispatch(Action::Logout);
        info!("logged out");
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserType;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    struct FixedAuth(std::result::Result<Value, RemoteError>);

    impl AuthService for FixedAuth {
        fn login(
            &self,
            credentials: &Credentials,
            _year: &str,
        ) -> std::result::Result<Value, RemoteError> {
            assert_eq!(credentials.username, credentials.username.trim());
            self.0.clone()
        }
    }

    fn gateway(auth: FixedAuth) -> (SessionGateway, Arc<Store>, Arc<MemorySessionStorage>) {
        let store = Arc::new(Store::new());
        let storage = Arc::new(MemorySessionStorage::new());
        let gateway = SessionGateway::new(
            Arc::new(auth),
            storage.clone(),
            store.clone(),
            "fallback",
        );
        (gateway, store, storage)
    }

    fn session(year: Option<&str>) -> Session {
        Session {
            token: "t1".into(),
            user: User {
                id: "u1".into(),
                name: "Team".into(),
                user_type: UserType::Team,
                points: 3,
            },
            year: year.map(str::to_string),
        }
    }

    #[test]
    fn test_login_parses_token_and_user() {
        let (gateway, _, _) = gateway(FixedAuth(Ok(json!({
            "token": "abc",
            "id": "u1",
            "name": "Team",
            "type": "team",
            "points": 4
        }))));

        let session = gateway
            .login(&Credentials::new("  team  ", "pw"), "2021")
            .unwrap();
        assert_eq!(session.token, "abc");
        assert_eq!(session.user.points, 4);
        assert_eq!(session.year.as_deref(), Some("2021"));
        // Login alone does not fan out the token.
        assert_eq!(gateway.token(), None);
    }

    #[test]
    fn test_login_rejection_messages() {
        let (with_message, _, _) =
            gateway(FixedAuth(Err(RemoteError::Rejected(Some("locked".into())))));
        let err = with_message
            .login(&Credentials::new("a", "b"), "2021")
            .unwrap_err();
        assert!(matches!(err, SyncError::Auth(ref m) if m == "locked"));

        let (without, _, _) = gateway(FixedAuth(Err(RemoteError::Rejected(None))));
        let err = without.login(&Credentials::new("a", "b"), "2021").unwrap_err();
        assert!(matches!(err, SyncError::Auth(ref m) if m == "fallback"));
    }

    #[test]
    fn test_login_transport_failure() {
        let (gateway, store, _) = gateway(FixedAuth(Err(RemoteError::Transport("down".into()))));
        let err = gateway.login(&Credentials::new("a", "b"), "2021").unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_set_token_reaches_every_client() {
        let (gateway, _, _) = gateway(FixedAuth(Err(RemoteError::Rejected(None))));
        gateway.set_token("first");
        gateway.set_token("second");
        for client in gateway.clients().iter() {
            assert_eq!(client.token().as_deref(), Some("second"));
            assert_eq!(client.authorization().as_deref(), Some("bearer second"));
        }
    }

    #[test]
    fn test_logout_clears_everything() {
        let (gateway, store, storage) = gateway(FixedAuth(Err(RemoteError::Rejected(None))));
        gateway.persist(&session(Some("2021"))).unwrap();
        gateway.set_token("t1");
        store.dispatch(Action::Login {
            user: session(None).user,
        });

        gateway.logout().unwrap();

        assert_eq!(gateway.token(), None);
        assert_eq!(storage.raw(), None);
        assert_eq!(store.get_state().user, None);
        assert!(gateway.clients().iter().all(|c| c.token().is_none()));
    }

    #[test]
    fn test_restore_only_for_matching_year() {
        let (gateway, _, storage) = gateway(FixedAuth(Err(RemoteError::Rejected(None))));
        gateway.persist(&session(Some("2021"))).unwrap();

        let restored = gateway.restore("2021").unwrap();
        assert_eq!(restored.token, "t1");
        assert_eq!(gateway.clients().feats.token().as_deref(), Some("t1"));

        gateway.clear_token();
        assert!(gateway.restore("2022").is_none());
        assert_eq!(gateway.token(), None);
        assert_eq!(storage.raw(), None);
    }

    #[test]
    fn test_restore_discards_session_without_year() {
        let (gateway, _, _) = gateway(FixedAuth(Err(RemoteError::Rejected(None))));
        gateway.persist(&session(None)).unwrap();
        assert!(gateway.restore("2021").is_none());
    }

    #[test]
    fn test_file_storage_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = FileSessionStorage::new(dir.path().join("nested").join("session.json"));

        assert!(storage.load().unwrap().is_none());
        storage.save(&session(Some("2021"))).unwrap();
        assert_eq!(storage.load().unwrap(), Some(session(Some("2021"))));

        storage.clear().unwrap();
        storage.clear().unwrap();
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn test_file_storage_corrupt_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "{not json").unwrap();
        let storage = FileSessionStorage::new(&path);
        assert!(matches!(storage.load(), Err(SyncError::Storage(_))));
    }
}
