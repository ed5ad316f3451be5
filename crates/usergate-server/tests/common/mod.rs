#![allow(dead_code)]

use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing_subscriber::filter::LevelFilter;
use usergate_server::server::lifecycle::coordinator::Servers;
use usergate_server::server::lifecycle::handle::ServerState;
use usergate_server::server::store::{
    StoreResult, UserPatch, UserRecord, UserStore, memory::MemoryStore,
};
use usergate_server::{
    Coordinator, CoordinatorState, DatabaseConfig, LifecycleError, ServerConfig, ShutdownReport,
    Signal, SignalSender, manual_signals,
};

/// Bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Loopback config on fresh ports with the in-memory datastore.
pub fn config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        grpc_port: free_port(),
        http_port: free_port(),
        database: DatabaseConfig {
            uri: "memory://".to_string(),
            name: "grpcgateway_db".to_string(),
        },
        log_level: LevelFilter::INFO,
        connect_timeout: Duration::from_secs(1),
        dial_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(2),
    }
}

/// A coordinator running in the background.
pub struct Harness {
    pub coordinator: Coordinator,
    pub signals: SignalSender,
    pub task: JoinHandle<Result<ShutdownReport, LifecycleError>>,
}

impl Harness {
    /// Spawns the coordinator without waiting for the servers.
    pub fn spawn(config: ServerConfig) -> Self {
        Self::launch(Coordinator::new(config))
    }

    /// Like [`Harness::start`], serving `store` instead of opening one.
    pub async fn start_with_store(config: ServerConfig, store: Arc<dyn UserStore>) -> Self {
        let harness = Self::launch(Coordinator::with_store(config, store));
        harness.wait_running().await;
        harness
    }

    fn launch(coordinator: Coordinator) -> Self {
        let (signals, stream) = manual_signals();
        let task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(stream).await }
        });
        Self {
            coordinator,
            signals,
            task,
        }
    }

    /// Spawns the coordinator and waits until both servers are running.
    pub async fn start() -> Self {
        let harness = Self::spawn(config());
        harness.wait_running().await;
        harness
    }

    async fn wait_running(&self) {
        let servers = self.servers().await;
        for handle in [servers.rpc.handle(), servers.gateway.handle()] {
            let state = timeout(WAIT, handle.wait_for(|s| *s != ServerState::Created && *s != ServerState::Starting))
                .await
                .unwrap();
            assert_eq!(state, ServerState::Running, "{} did not start", handle.name());
        }
    }

    pub async fn servers(&self) -> Servers {
        timeout(
            WAIT,
            self.coordinator
                .wait_for(|s| *s != CoordinatorState::Initializing),
        )
        .await
        .unwrap();
        self.coordinator.servers().unwrap()
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.coordinator.config().http_addr())
    }

    pub fn grpc_url(&self) -> String {
        format!("http://{}", self.coordinator.config().grpc_addr())
    }

    /// Delivers SIGTERM and waits for the run to finish.
    pub async fn shutdown(self) -> ShutdownReport {
        self.signals.send(Signal::Terminate);
        self.join().await
    }

    pub async fn join(self) -> ShutdownReport {
        timeout(WAIT, self.task).await.unwrap().unwrap().unwrap()
    }
}

/// In-memory store that counts calls, can hold reads back, and records how
/// many calls were still running when it was closed.
#[derive(Default)]
pub struct TestStore {
    inner: MemoryStore,
    /// Every data call, including ones that never finished.
    pub calls: AtomicUsize,
    /// Data calls currently running.
    pub active: Arc<AtomicUsize>,
    /// `active` at the moment `close` was called.
    pub active_at_close: AtomicUsize,
    pub closes: AtomicUsize,
    /// Signalled whenever a read starts.
    pub read_started: Notify,
    read_delay: Duration,
    close_hangs: bool,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads take `delay` before answering.
    pub fn slow_reads(delay: Duration) -> Self {
        Self {
            read_delay: delay,
            ..Self::default()
        }
    }

    /// `close` never returns.
    pub fn stuck_close() -> Self {
        Self {
            close_hangs: true,
            ..Self::default()
        }
    }

    fn enter(&self) -> Active {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        Active(self.active.clone())
    }
}

/// Decrements the running count when the call finishes or is dropped.
struct Active(Arc<AtomicUsize>);

impl Drop for Active {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tonic::async_trait]
impl UserStore for TestStore {
    fn kind(&self) -> &'static str {
        "test"
    }

    async fn insert(&self, user: UserRecord) -> StoreResult<UserRecord> {
        let _active = self.enter();
        self.inner.insert(user).await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<UserRecord>> {
        let _active = self.enter();
        self.read_started.notify_one();
        tokio::time::sleep(self.read_delay).await;
        self.inner.get(id).await
    }

    async fn list(&self, skip: u64, limit: u64) -> StoreResult<(Vec<UserRecord>, u64)> {
        let _active = self.enter();
        self.inner.list(skip, limit).await
    }

    async fn update(&self, id: &str, patch: UserPatch) -> StoreResult<Option<UserRecord>> {
        let _active = self.enter();
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let _active = self.enter();
        self.inner.delete(id).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.active_at_close
            .store(self.active.load(Ordering::SeqCst), Ordering::SeqCst);
        if self.close_hangs {
            futures::future::pending::<()>().await;
        }
        self.inner.close().await
    }
}
