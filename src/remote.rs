//! Remote collaborators.
//!
//! The sync layer never talks to the network itself. A snapshot source,
//! the credential exchange and the properties endpoint are plugged in through
//! these traits; [`crate::memory::MemoryBackend`] implements all of them in
//! process.

use crate::subscriptions::{ListenTarget, ListenerRegistration, SnapshotSink};
use crate::types::{Credentials, UnixTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure reported by a remote collaborator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The server answered but refused the request. Carries the `error`
    /// field of the response body when there was one.
    #[error("request rejected: {}", .0.as_deref().unwrap_or("no message"))]
    Rejected(Option<String>),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Source of live snapshots.
pub trait SnapshotSource: Send + Sync {
    /// Start listening to `target`. Every snapshot, including the initial
    /// one, goes to `sink` until the returned registration is detached or
    /// `sink.deliver` returns false.
    fn listen(
        &self,
        target: &ListenTarget,
        sink: SnapshotSink,
    ) -> Result<ListenerRegistration, RemoteError>;
}

/// Credential exchange.
pub trait AuthService: Send + Sync {
    /// Exchange credentials for `{ token, ...userFields }` scoped to `year`.
    fn login(&self, credentials: &Credentials, year: &str) -> Result<Value, RemoteError>;
}

/// Partial update of a year's properties document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertiesPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<UnixTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_cutoff_time: Option<UnixTime>,
}

/// Write access to year properties.
pub trait PropertiesBackend: Send + Sync {
    /// Apply `patch` to `year`'s properties. `authorization` is the value a
    /// properties client would send, e.g. `bearer <token>`.
    fn update(
        &self,
        year: &str,
        patch: &PropertiesPatch,
        authorization: Option<&str>,
    ) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_only_sends_set_fields() {
        let patch = PropertiesPatch {
            start_date: Some(10),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            serde_json::json!({"startDate": 10})
        );
    }

    #[test]
    fn test_rejected_message() {
        assert_eq!(
            RemoteError::Rejected(None).to_string(),
            "request rejected: no message"
        );
        assert_eq!(
            RemoteError::Rejected(Some("bad password".into())).to_string(),
            "request rejected: bad password"
        );
    }
}
