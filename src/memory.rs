//! In-process backend implementing every remote collaborator.
//!
//! Documents live in a map keyed by [`ListenTarget`]. Writing a collection
//! pushes a fresh snapshot to every listener on it, the way a realtime
//! document database would. Accounts, issued tokens and failure switches
//! make the login and subscription error paths reachable.

use crate::remote::{AuthService, PropertiesBackend, PropertiesPatch, RemoteError, SnapshotSource};
use crate::subscriptions::{ListenTarget, ListenerRegistration, SnapshotSink};
use crate::types::{Collection, Credentials, Document, Snapshot, User};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::debug;

struct Account {
    password: String,
    user: User,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<ListenTarget, Vec<Document>>,
    listeners: HashMap<u64, (ListenTarget, SnapshotSink)>,
    next_listener: u64,
    accounts: HashMap<String, Account>,
    /// Token -> (user, year it was issued for).
    tokens: HashMap<String, (User, String)>,
    next_token: u64,
    failing: HashSet<Collection>,
    offline: bool,
}

impl Inner {
    fn snapshot(&self, target: &ListenTarget) -> Snapshot {
        let docs = self.documents.get(target).cloned().unwrap_or_default();
        match target.collection {
            Collection::ActiveYear | Collection::YearProperties => {
                Snapshot::Document(docs.into_iter().next())
            }
            _ => Snapshot::Documents(docs),
        }
    }

    /// Push the current snapshot of `target` to its listeners, forgetting
    /// the ones that were canceled.
    fn broadcast(&mut self, target: &ListenTarget) {
        let snapshot = self.snapshot(target);
        self.listeners.retain(|_, (listening, sink)| {
            listening != target || sink.deliver(snapshot.clone())
        });
    }
}

/// In-memory realtime database, credential exchange and properties endpoint.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every document of `collection` (scoped to `year` when the
    /// collection is year-scoped) and notify listeners.
    pub fn set_documents(&self, collection: Collection, year: &str, documents: Vec<Document>) {
        let target = ListenTarget::for_year(collection, year);
        let mut inner = self.inner.lock();
        inner.documents.insert(target.clone(), documents);
        inner.broadcast(&target);
    }

    /// Convenience for single-document collections.
    pub fn set_document(&self, collection: Collection, year: &str, data: Value) {
        self.set_documents(collection, year, vec![Document::new(year, data)]);
    }

    pub fn set_active_year(&self, year: &str) {
        let target = ListenTarget::for_year(Collection::ActiveYear, year);
        let mut inner = self.inner.lock();
        inner.documents.insert(
            target.clone(),
            vec![Document::new("activeYear", json!({ "activeYear": year }))],
        );
        inner.broadcast(&target);
    }

    /// Register a login.
    pub fn add_account(&self, username: &str, password: &str, user: User) {
        self.inner.lock().accounts.insert(
            username.to_string(),
            Account {
                password: password.to_string(),
                user,
            },
        );
    }

    /// Make every future `listen` on `collection` fail.
    pub fn fail_listen(&self, collection: Collection) {
        self.inner.lock().failing.insert(collection);
    }

    /// Simulate a transport outage for login and property updates.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Stored documents of a collection.
    pub fn documents(&self, collection: Collection, year: &str) -> Vec<Document> {
        self.inner
            .lock()
            .documents
            .get(&ListenTarget::for_year(collection, year))
            .cloned()
            .unwrap_or_default()
    }

    fn detach(inner: &Weak<Mutex<Inner>>, id: u64) {
        if let Some(inner) = inner.upgrade() {
            inner.lock().listeners.remove(&id);
            debug!(listener = id, "listener detached");
        }
    }
}

impl SnapshotSource for MemoryBackend {
    fn listen(
        &self,
        target: &ListenTarget,
        sink: SnapshotSink,
    ) -> Result<ListenerRegistration, RemoteError> {
        let mut inner = self.inner.lock();
        if inner.failing.contains(&target.collection) {
            return Err(RemoteError::Transport(format!(
                "cannot listen to {}",
                target.collection
            )));
        }

        let id = inner.next_listener;
        inner.next_listener += 1;

        if !sink.deliver(inner.snapshot(target)) {
            return Ok(ListenerRegistration::noop());
        }
        inner.listeners.insert(id, (target.clone(), sink));

        let weak = Arc::downgrade(&self.inner);
        Ok(ListenerRegistration::new(move || Self::detach(&weak, id)))
    }
}

impl AuthService for MemoryBackend {
    fn login(&self, credentials: &Credentials, year: &str) -> Result<Value, RemoteError> {
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(RemoteError::Transport("connection refused".into()));
        }

        let user = match inner.accounts.get(&credentials.username) {
            Some(account) if account.password == credentials.password => account.user.clone(),
            Some(_) => return Err(RemoteError::Rejected(Some("invalid password".into()))),
            None => return Err(RemoteError::Rejected(None)),
        };

        let token = format!("token-{}", inner.next_token);
        inner.next_token += 1;
        inner
            .tokens
            .insert(token.clone(), (user.clone(), year.to_string()));

        let mut body = serde_json::to_value(&user)
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if let Value::Object(fields) = &mut body {
            fields.insert("token".into(), Value::String(token));
        }
        Ok(body)
    }
}

impl PropertiesBackend for MemoryBackend {
    fn update(
        &self,
        year: &str,
        patch: &PropertiesPatch,
        authorization: Option<&str>,
    ) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(RemoteError::Transport("connection refused".into()));
        }

        let token = authorization.and_then(|value| value.strip_prefix("bearer "));
        let authorized = token
            .and_then(|token| inner.tokens.get(token))
            .map_or(false, |(user, issued_for)| user.is_admin() && issued_for == year);
        if !authorized {
            return Err(RemoteError::Rejected(Some("unauthorized".into())));
        }

        let target = ListenTarget::for_year(Collection::YearProperties, year);
        let docs = inner.documents.entry(target.clone()).or_default();
        if docs.is_empty() {
            docs.push(Document::new(year, json!({})));
        }
        let fields = serde_json::to_value(patch).map_err(|e| RemoteError::Transport(e.to_string()))?;
        if let Value::Object(fields) = fields {
            docs[0].data.extend(fields);
        }
        inner.broadcast(&target);
        Ok(())
    }
}
