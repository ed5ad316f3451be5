use super::{StoreError, StoreResult, UserPatch, UserRecord, UserStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

/// URI scheme selecting this backend.
pub const SCHEME: &str = "memory://";

/// In-process datastore. Everything is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, UserRecord>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
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
impl UserStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, user: UserRecord) -> StoreResult<UserRecord> {
        self.ensure_open()?;
        let mut users = self.users.write();
        if users.contains_key(&user.id) {
            return Err(StoreError::Backend(format!("duplicate id {}", user.id)));
        }
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<UserRecord>> {
        self.ensure_open()?;
        Ok(self.users.read().get(id).cloned())
    }

    async fn list(&self, skip: u64, limit: u64) -> StoreResult<(Vec<UserRecord>, u64)> {
        self.ensure_open()?;
        let users = self.users.read();
        let total = users.len() as u64;
        let mut page: Vec<UserRecord> = users.values().cloned().collect();
        drop(users);

        // Newest first; ids are ULIDs, so they break ties in creation order.
        page.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        let page = page
            .into_iter()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect();
        Ok((page, total))
    }

    async fn update(&self, id: &str, patch: UserPatch) -> StoreResult<Option<UserRecord>> {
        self.ensure_open()?;
        let mut users = self.users.write();
        Ok(users.get_mut(id).map(|user| {
            patch.apply(user, SystemTime::now());
            user.clone()
        }))
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        Ok(self.users.write().remove(id).is_some())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.ensure_open()
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
