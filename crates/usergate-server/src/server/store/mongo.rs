use super::{StoreError, StoreResult, UserPatch, UserRecord, UserStore};
use core::time::Duration;
use futures::TryStreamExt;
use mongodb::{
    Client, Collection,
    bson::{self, DateTime, Document, doc},
    options::{ClientOptions, ReturnDocument},
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::time::timeout;
use usergate_core::types::COLLECTION;

/// Bound for the health-check ping issued after startup.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// User document as stored in MongoDB. `_id` holds the ULID string.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserDocument {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    email: String,
    phone: String,
    created_at: DateTime,
    updated_at: DateTime,
}

impl From<UserRecord> for UserDocument {
    fn from(user: UserRecord) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            phone: user.phone,
            created_at: DateTime::from_system_time(user.created_at),
            updated_at: DateTime::from_system_time(user.updated_at),
        }
    }
}

impl From<UserDocument> for UserRecord {
    fn from(doc: UserDocument) -> Self {
        Self {
            id: doc.id,
            name: doc.name,
            email: doc.email,
            phone: doc.phone,
            created_at: doc.created_at.to_system_time(),
            updated_at: doc.updated_at.to_system_time(),
        }
    }
}

/// Builds the `$set` document for a partial update.
fn update_document(patch: UserPatch, now: SystemTime) -> Document {
    let mut set = doc! {
        "updated_at": DateTime::from_system_time(patch.updated_at.unwrap_or(now)),
    };
    if let Some(name) = patch.name {
        set.insert("name", name);
    }
    if let Some(email) = patch.email {
        set.insert("email", email);
    }
    if let Some(phone) = patch.phone {
        set.insert("phone", phone);
    }
    doc! { "$set": set }
}

fn backend(err: mongodb::error::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// MongoDB-backed datastore.
///
/// The driver keeps a connection pool internally, so one `MongoStore` is
/// shared by every request on both servers.
pub struct MongoStore {
    client: Client,
    users: Collection<UserDocument>,
    database: String,
    closed: AtomicBool,
}

impl MongoStore {
    /// Connects and pings `database`, all within `connect_timeout`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Connect`] if the URI is invalid or the server rejects the
    /// ping, [`StoreError::Timeout`] if the bound is exceeded.
    pub async fn connect(uri: &str, database: &str, connect_timeout: Duration) -> StoreResult<Self> {
        let connect = async {
            let mut options = ClientOptions::parse(uri)
                .await
                .map_err(|e| StoreError::Connect(e.to_string()))?;
            options.connect_timeout = Some(connect_timeout);
            options.server_selection_timeout = Some(connect_timeout);
            options.app_name.get_or_insert_with(|| "usergate".to_string());

            let client =
                Client::with_options(options).map_err(|e| StoreError::Connect(e.to_string()))?;
            client
                .database(database)
                .run_command(doc! { "ping": 1 })
                .await
                .map_err(|e| StoreError::Connect(e.to_string()))?;
            Ok::<_, StoreError>(client)
        };

        let client = timeout(connect_timeout, connect)
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))??;

        let users = client.database(database).collection::<UserDocument>(COLLECTION);
        Ok(Self {
            client,
            users,
            database: database.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[tonic::async_trait]
impl UserStore for MongoStore {
    fn kind(&self) -> &'static str {
        "mongodb"
    }

    async fn insert(&self, user: UserRecord) -> StoreResult<UserRecord> {
        self.ensure_open()?;
        let document = UserDocument::from(user.clone());
        self.users.insert_one(&document).await.map_err(backend)?;
        Ok(user)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<UserRecord>> {
        self.ensure_open()?;
        let found = self
            .users
            .find_one(doc! { "_id": id })
            .await
            .map_err(backend)?;
        Ok(found.map(UserRecord::from))
    }

    async fn list(&self, skip: u64, limit: u64) -> StoreResult<(Vec<UserRecord>, u64)> {
        self.ensure_open()?;
        let total = self
            .users
            .count_documents(doc! {})
            .await
            .map_err(backend)?;

        let cursor = self
            .users
            .find(doc! {})
            .sort(doc! { "created_at": -1, "_id": -1 })
            .skip(skip)
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .await
            .map_err(backend)?;
        let documents: Vec<UserDocument> = cursor.try_collect().await.map_err(backend)?;

        Ok((documents.into_iter().map(UserRecord::from).collect(), total))
    }

    async fn update(&self, id: &str, patch: UserPatch) -> StoreResult<Option<UserRecord>> {
        self.ensure_open()?;
        let updated = self
            .users
            .find_one_and_update(doc! { "_id": id }, update_document(patch, SystemTime::now()))
            .return_document(ReturnDocument::After)
            .await
            .map_err(backend)?;
        Ok(updated.map(UserRecord::from))
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        let result = self
            .users
            .delete_one(doc! { "_id": id })
            .await
            .map_err(backend)?;
        Ok(result.deleted_count > 0)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.ensure_open()?;
        timeout(
            PING_TIMEOUT,
            self.client
                .database(&self.database)
                .run_command(doc! { "ping": 1 }),
        )
        .await
        .map_err(|_| StoreError::Timeout(PING_TIMEOUT))?
        .map_err(backend)?;
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client.clone().shutdown().await;
        tracing::info!("Closed MongoDB connection");
        Ok(())
    }
}
