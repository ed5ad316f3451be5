//! Datastore handle.
//!
//! The process opens exactly one [`UserStore`] before either server starts
//! and closes it after both have stopped. Backends are chosen by the scheme of
//! the configured URI:
//!
//! - `mongodb://`, `mongodb+srv://` - [`mongo::MongoStore`]
//! - `memory://` - [`memory::MemoryStore`], process-local and volatile

pub mod memory;
pub mod mongo;

use crate::server::{config::ServerConfig, error::LifecycleError};
use std::sync::Arc;
use std::time::SystemTime;
use usergate_core::Error;

/// A stored user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl UserRecord {
    /// A fresh record stamped with `now` for both timestamps.
    pub fn new(id: String, name: String, email: String, phone: String, now: SystemTime) -> Self {
        Self {
            id,
            name,
            email,
            phone,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update. `None` leaves a field untouched; `updated_at` is always
/// refreshed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub updated_at: Option<SystemTime>,
}

impl UserPatch {
    pub(crate) fn apply(self, user: &mut UserRecord, now: SystemTime) {
        if let Some(name) = self.name {
            user.name = name;
        }
        if let Some(email) = self.email {
            user.email = email;
        }
        if let Some(phone) = self.phone {
            user.phone = phone;
        }
        user.updated_at = self.updated_at.unwrap_or(now);
    }
}

/// Datastore failures.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("operation timed out after {0:?}")]
    Timeout(core::time::Duration),

    #[error("datastore is closed")]
    Closed,

    #[error("request abandoned during shutdown")]
    Abandoned,

    #[error("datastore error: {0}")]
    Backend(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed | StoreError::Abandoned => Error::Unavailable {
                reason: err.to_string(),
            },
            other => Error::Internal {
                context: other.to_string(),
            },
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The single-document operations the User service needs.
///
/// Implementations must be safe for concurrent use from both server units.
#[tonic::async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    async fn insert(&self, user: UserRecord) -> StoreResult<UserRecord>;

    async fn get(&self, id: &str) -> StoreResult<Option<UserRecord>>;

    /// One page of users, newest first, plus the total count.
    async fn list(&self, skip: u64, limit: u64) -> StoreResult<(Vec<UserRecord>, u64)>;

    /// Applies `patch` and returns the updated user, or `None` if absent.
    async fn update(&self, id: &str, patch: UserPatch) -> StoreResult<Option<UserRecord>>;

    /// Returns whether a user was deleted.
    async fn delete(&self, id: &str) -> StoreResult<bool>;

    /// Round-trip health check, bounded by the backend.
    async fn ping(&self) -> StoreResult<()>;

    /// Releases the connection. Later calls fail with [`StoreError::Closed`].
    async fn close(&self) -> StoreResult<()>;
}

/// Opens the datastore selected by `config.database.uri`.
///
/// Connecting and the initial ping are bounded by `config.connect_timeout`.
///
/// # Errors
///
/// Returns [`LifecycleError::Connect`] for unknown schemes or an unreachable
/// backend.
pub async fn open_store(config: &ServerConfig) -> Result<Arc<dyn UserStore>, LifecycleError> {
    let uri = config.database.uri.as_str();
    let store: Arc<dyn UserStore> = if uri.starts_with(memory::SCHEME) {
        Arc::new(memory::MemoryStore::new())
    } else if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
        let store =
            mongo::MongoStore::connect(uri, &config.database.name, config.connect_timeout)
                .await
                .map_err(|e| LifecycleError::Connect {
                    reason: e.to_string(),
                })?;
        Arc::new(store)
    } else {
        return Err(LifecycleError::Connect {
            reason: format!("unsupported datastore uri scheme in {uri:?}"),
        });
    };

    tracing::info!(backend = store.kind(), database = %config.database.name, "Connected to datastore");
    Ok(store)
}
