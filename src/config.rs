//! Sync engine configuration.

use std::path::PathBuf;

/// Message shown when the credential exchange rejects a login without
/// saying why.
pub const DEFAULT_AUTH_FALLBACK: &str = "Wrong username or password";

/// Sync engine configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Max queued snapshot deliveries (None = unbounded). Past it, only the
    /// newest snapshot per subscription is kept.
    /// Default: None
    pub delivery_buffer: Option<usize>,

    /// Error text used when a rejected login carries no server message.
    pub auth_fallback_message: String,

    /// Where the logged-in session is persisted (None = in memory only).
    pub session_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            delivery_buffer: None,
            auth_fallback_message: DEFAULT_AUTH_FALLBACK.to_string(),
            session_path: None,
        }
    }
}
