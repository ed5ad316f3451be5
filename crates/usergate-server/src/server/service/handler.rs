//! gRPC implementation of `user.v1.UserService`.
//!
//! [`UserService`] is a thin layer between the generated server trait and the
//! [`UserStore`]: it validates identifiers, normalizes pagination, stamps
//! timestamps and maps datastore outcomes onto gRPC statuses. Request errors
//! are returned to the caller and never affect the serving task.
//!
//! Every datastore call is tracked. Once its serve loop has ended the RPC
//! server waits for them with [`UserService::wait_requests`], or, when the
//! stop is forced, calls [`UserService::abandon_requests`], which makes them
//! fail with `UNAVAILABLE`. Either way the datastore is never closed under a
//! running request.

use crate::server::store::{StoreError, StoreResult, UserPatch, UserRecord, UserStore};
use core::time::Duration;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::timeout;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tonic::{Request, Response, Status};
use usergate_core::{
    Error,
    proto::{
        CreateUserRequest, DeleteUserRequest, GetUserRequest, ListUsersRequest,
        ListUsersResponse, UpdateUserRequest, User, user_service_server,
    },
    types::{Page, new_user_id, parse_user_id},
};

/// The User resource service. Clones share the datastore and the set of
/// in-flight calls.
#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn UserStore>,
    inflight: TaskTracker,
    abandon: CancellationToken,
}

impl UserService {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self {
            store,
            inflight: TaskTracker::new(),
            abandon: CancellationToken::new(),
        }
    }

    /// Datastore round trip, used by the RPC server's datastore watch.
    pub async fn ping(&self) -> StoreResult<()> {
        self.call(self.store.ping()).await
    }

    /// Datastore calls currently running.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Waits for the datastore calls still running to finish.
    pub async fn wait_requests(&self) {
        self.inflight.close();
        self.inflight.wait().await;
    }

    /// Fails every datastore call still running (and any started later)
    /// with [`StoreError::Abandoned`], then waits up to `bound` for them to
    /// unwind. Returns whether none is left.
    pub async fn abandon_requests(&self, bound: Duration) -> bool {
        self.abandon.cancel();
        self.inflight.close();
        let left = self.inflight.len();
        if left > 0 {
            tracing::warn!(left, "Abandoning in-flight datastore calls");
        }
        timeout(bound, self.inflight.wait()).await.is_ok()
    }

    async fn call<T>(&self, op: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        let op = self.inflight.track_future(op);
        tokio::select! {
            res = op => res,
            () = self.abandon.cancelled() => Err(StoreError::Abandoned),
        }
    }
}

fn to_proto(user: UserRecord) -> User {
    User {
        id: user.id,
        name: user.name,
        email: user.email,
        phone: user.phone,
        created_at: Some(user.created_at.into()),
        updated_at: Some(user.updated_at.into()),
    }
}

fn internal(action: &str, err: impl Into<Error>) -> Status {
    let err = err.into();
    tracing::error!(error = %err, "Failed to {action}");
    match err {
        Error::Internal { context } => Error::Internal {
            context: format!("failed to {action}: {context}"),
        }
        .into(),
        other => other.into(),
    }
}

#[tonic::async_trait]
impl user_service_server::UserService for UserService {
    #[tracing::instrument(skip_all, fields(name = %req.get_ref().name, email = %req.get_ref().email))]
    async fn create_user(&self, req: Request<CreateUserRequest>) -> Result<Response<User>, Status> {
        tracing::info!("Creating new user");
        let CreateUserRequest { name, email, phone } = req.into_inner();
        let user = UserRecord::new(new_user_id(), name, email, phone, SystemTime::now());

        let user = self
            .call(self.store.insert(user))
            .await
            .map_err(|e| internal("create user", e))?;
        Ok(Response::new(to_proto(user)))
    }

    #[tracing::instrument(skip_all, fields(id = %req.get_ref().id))]
    async fn get_user(&self, req: Request<GetUserRequest>) -> Result<Response<User>, Status> {
        tracing::info!("Getting user");
        let id = parse_user_id(&req.get_ref().id)?;

        match self.call(self.store.get(&id)).await {
            Ok(Some(user)) => Ok(Response::new(to_proto(user))),
            Ok(None) => Err(Error::NotFound.into()),
            Err(e) => Err(internal("get user", e)),
        }
    }

    #[tracing::instrument(skip_all, fields(page = req.get_ref().page, page_size = req.get_ref().page_size))]
    async fn list_users(
        &self,
        req: Request<ListUsersRequest>,
    ) -> Result<Response<ListUsersResponse>, Status> {
        tracing::info!("Listing users");
        let page = Page::normalize(req.get_ref().page, req.get_ref().page_size);

        let (users, total) = self
            .call(self.store.list(page.skip(), page.limit()))
            .await
            .map_err(|e| internal("list users", e))?;

        Ok(Response::new(ListUsersResponse {
            users: users.into_iter().map(to_proto).collect(),
            total: i32::try_from(total).unwrap_or(i32::MAX),
            page: page.page,
            page_size: page.page_size,
        }))
    }

    #[tracing::instrument(skip_all, fields(id = %req.get_ref().id))]
    async fn update_user(&self, req: Request<UpdateUserRequest>) -> Result<Response<User>, Status> {
        tracing::info!("Updating user");
        let UpdateUserRequest {
            id,
            name,
            email,
            phone,
        } = req.into_inner();
        let id = parse_user_id(&id)?;
        let patch = UserPatch {
            name,
            email,
            phone,
            updated_at: Some(SystemTime::now()),
        };

        match self.call(self.store.update(&id, patch)).await {
            Ok(Some(user)) => Ok(Response::new(to_proto(user))),
            Ok(None) => Err(Error::NotFound.into()),
            Err(e) => Err(internal("update user", e)),
        }
    }

    #[tracing::instrument(skip_all, fields(id = %req.get_ref().id))]
    async fn delete_user(&self, req: Request<DeleteUserRequest>) -> Result<Response<()>, Status> {
        tracing::info!("Deleting user");
        let id = parse_user_id(&req.get_ref().id)?;

        match self.call(self.store.delete(&id)).await {
            Ok(true) => Ok(Response::new(())),
            Ok(false) => Err(Error::NotFound.into()),
            Err(e) => Err(internal("delete user", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::store::memory::MemoryStore;
    use tonic::Code;
    use user_service_server::UserService as _;

    fn service() -> UserService {
        UserService::new(Arc::new(MemoryStore::new()))
    }

    async fn create(svc: &UserService, name: &str) -> User {
        svc.create_user(Request::new(CreateUserRequest {
            name: name.to_string(),
            email: format!("{name}@x.com"),
            phone: "+1".to_string(),
        }))
        .await
        .unwrap()
        .into_inner()
    }

    #[tokio::test]
    async fn creates_and_reads_back() {
        let svc = service();
        let created = create(&svc, "A").await;
        assert_eq!(created.id.len(), 26);
        assert!(created.created_at.is_some());
        assert_eq!(created.created_at, created.updated_at);

        let fetched = svc
            .get_user(Request::new(GetUserRequest {
                id: created.id.clone(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn maps_missing_and_malformed_ids() {
        let svc = service();
        let missing = usergate_core::types::new_user_id();
        let status = svc
            .get_user(Request::new(GetUserRequest { id: missing }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let status = svc
            .get_user(Request::new(GetUserRequest {
                id: "nope".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = svc
            .delete_user(Request::new(DeleteUserRequest {
                id: "nope".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn update_is_partial() {
        let svc = service();
        let created = create(&svc, "A").await;

        let updated = svc
            .update_user(Request::new(UpdateUserRequest {
                id: created.id.clone(),
                name: None,
                email: Some("new@x.com".to_string()),
                phone: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(updated.name, "A");
        assert_eq!(updated.email, "new@x.com");
        assert_eq!(updated.phone, "+1");
        assert_eq!(updated.created_at, created.created_at);

        let status = svc
            .update_user(Request::new(UpdateUserRequest {
                id: usergate_core::types::new_user_id(),
                name: Some("B".to_string()),
                email: None,
                phone: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let svc = service();
        let created = create(&svc, "A").await;
        svc.delete_user(Request::new(DeleteUserRequest {
            id: created.id.clone(),
        }))
        .await
        .unwrap();

        let status = svc
            .get_user(Request::new(GetUserRequest {
                id: created.id.clone(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let status = svc
            .delete_user(Request::new(DeleteUserRequest { id: created.id }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn list_normalizes_pagination() {
        let svc = service();
        for i in 0..12 {
            create(&svc, &format!("u{i}")).await;
        }

        let page = svc
            .list_users(Request::new(ListUsersRequest {
                page: 0,
                page_size: -5,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 10);
        assert_eq!(page.total, 12);
        assert_eq!(page.users.len(), 10);

        let second = svc
            .list_users(Request::new(ListUsersRequest {
                page: 2,
                page_size: 10,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(second.users.len(), 2);
    }

    #[tokio::test]
    async fn closed_store_is_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let svc = UserService::new(store.clone());
        store.close().await.unwrap();

        let status = svc
            .list_users(Request::new(ListUsersRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }

    /// Reads never complete until dropped; `live` counts the ones pending.
    #[derive(Default)]
    struct StalledStore {
        live: Arc<std::sync::atomic::AtomicUsize>,
    }

    struct Live(Arc<std::sync::atomic::AtomicUsize>);

    impl Drop for Live {
        fn drop(&mut self) {
            self.0.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tonic::async_trait]
    impl UserStore for StalledStore {
        fn kind(&self) -> &'static str {
            "stalled"
        }

        async fn insert(&self, user: UserRecord) -> StoreResult<UserRecord> {
            Ok(user)
        }

        async fn get(&self, _id: &str) -> StoreResult<Option<UserRecord>> {
            self.live.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let _live = Live(self.live.clone());
            futures::future::pending().await
        }

        async fn list(&self, _skip: u64, _limit: u64) -> StoreResult<(Vec<UserRecord>, u64)> {
            Ok((Vec::new(), 0))
        }

        async fn update(&self, _id: &str, _patch: UserPatch) -> StoreResult<Option<UserRecord>> {
            Ok(None)
        }

        async fn delete(&self, _id: &str) -> StoreResult<bool> {
            Ok(false)
        }

        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }

        async fn close(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn abandons_stalled_calls() {
        let store = Arc::new(StalledStore::default());
        let live = store.live.clone();
        let svc = UserService::new(store);

        let call = tokio::spawn({
            let svc = svc.clone();
            async move {
                svc.get_user(Request::new(GetUserRequest {
                    id: usergate_core::types::new_user_id(),
                }))
                .await
            }
        });
        while svc.inflight() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(svc.abandon_requests(Duration::from_secs(1)).await);
        assert_eq!(svc.inflight(), 0);
        assert_eq!(live.load(std::sync::atomic::Ordering::SeqCst), 0);
        let status = call.await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);

        // Later calls fail fast instead of reaching the datastore.
        let status = svc
            .get_user(Request::new(GetUserRequest {
                id: usergate_core::types::new_user_id(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }
}
