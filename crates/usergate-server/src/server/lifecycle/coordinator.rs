//! Process lifecycle coordinator.
//!
//! [`Coordinator::run`] owns the whole life of the process:
//!
//! 1. open the datastore (fatal if unreachable within the connect timeout)
//! 2. spawn the RPC server and the gateway as two supervised tasks
//! 3. wait for the first of: a termination signal, the RPC task ending, the
//!    gateway task ending
//! 4. stop the gateway, then the RPC server, each bounded by the shutdown
//!    timeout
//! 5. join both tasks, then close the datastore, bounded by the shutdown
//!    timeout
//!
//! A server task that ends on its own is always a failure: nothing but the
//! coordinator stops a server, and there is no degraded single-server mode.

use crate::server::{
    config::ServerConfig,
    error::LifecycleError,
    gateway::{self, GatewayServer},
    lifecycle::{handle::StopOutcome, signal::Signal},
    rpc::{self, RpcServer},
    service::handler::UserService,
    store::{UserStore, open_store},
};
use core::fmt;
use core::time::Duration;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, timeout};

/// Coordinator state. Moves strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    Initializing,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// What moved the coordinator into `shutting_down`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Signal(String),
    RpcFailed(String),
    GatewayFailed(String),
}

impl ShutdownTrigger {
    /// Whether the process should exit non-zero.
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::Signal(_))
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "received {name}"),
            Self::RpcFailed(reason) => write!(f, "gRPC server failed: {reason}"),
            Self::GatewayFailed(reason) => write!(f, "HTTP gateway failed: {reason}"),
        }
    }
}

/// Timing and outcome of one server's stop call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRecord {
    pub server: &'static str,
    pub started: Instant,
    pub finished: Instant,
    pub outcome: StopOutcome,
}

impl StopRecord {
    async fn time(server: &'static str, stop: impl Future<Output = StopOutcome>) -> Self {
        let started = Instant::now();
        let outcome = stop.await;
        Self {
            server,
            started,
            finished: Instant::now(),
            outcome,
        }
    }
}

/// Everything that happened during shutdown.
#[derive(Debug)]
pub struct ShutdownReport {
    pub trigger: ShutdownTrigger,
    pub gateway_stop: StopRecord,
    pub rpc_stop: StopRecord,
    /// How each server task ended.
    pub gateway_exit: Result<(), LifecycleError>,
    pub rpc_exit: Result<(), LifecycleError>,
    /// `Err` carries the close failure or timeout; it never aborts shutdown.
    pub store_close: Result<(), String>,
    /// Termination signals received after the first one.
    pub ignored_signals: usize,
}

/// The two servers of a running coordinator.
#[derive(Clone)]
pub struct Servers {
    pub rpc: RpcServer,
    pub gateway: GatewayServer,
}

struct Inner {
    config: ServerConfig,
    state: watch::Sender<CoordinatorState>,
    history: Mutex<Vec<CoordinatorState>>,
    servers: OnceLock<Servers>,
    store: Mutex<Option<Arc<dyn UserStore>>>,
    ran: AtomicBool,
}

/// Supervises both servers and the datastore. Cheap to clone; clones
/// observe the same run.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// A coordinator that opens the datastore named by `config`.
    pub fn new(config: ServerConfig) -> Self {
        Self::build(config, None)
    }

    /// A coordinator serving an already opened datastore. `config.database`
    /// is ignored; the store is still closed at the end of the run.
    pub fn with_store(config: ServerConfig, store: Arc<dyn UserStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: ServerConfig, store: Option<Arc<dyn UserStore>>) -> Self {
        let (state, _) = watch::channel(CoordinatorState::Initializing);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                history: Mutex::new(vec![CoordinatorState::Initializing]),
                servers: OnceLock::new(),
                store: Mutex::new(store),
                ran: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> CoordinatorState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.inner.state.subscribe()
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> Vec<CoordinatorState> {
        self.inner.history.lock().clone()
    }

    /// The servers, once the datastore is open and they have been spawned.
    pub fn servers(&self) -> Option<Servers> {
        self.inner.servers.get().cloned()
    }

    /// Waits until the state satisfies `pred` and returns it.
    pub async fn wait_for(&self, pred: impl FnMut(&CoordinatorState) -> bool) -> CoordinatorState {
        let mut rx = self.subscribe();
        match rx.wait_for(pred).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    fn enter(&self, next: CoordinatorState) {
        tracing::debug!(from = %self.state(), to = %next, "coordinator state change");
        self.inner.history.lock().push(next);
        self.inner.state.send_replace(next);
    }

    /// Runs the process until a termination signal or a server failure, then
    /// shuts everything down in order.
    ///
    /// Server failures are reported through [`ShutdownReport::trigger`], not
    /// as an `Err`: by the time `run` returns, cleanup has already happened.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Connect`] if the datastore cannot be opened, and
    /// [`LifecycleError::Reentered`] if this coordinator has already run.
    pub async fn run<S>(&self, mut signals: S) -> Result<ShutdownReport, LifecycleError>
    where
        S: Stream<Item = Signal> + Unpin,
    {
        if self.inner.ran.swap(true, Ordering::AcqRel) {
            return Err(LifecycleError::Reentered);
        }
        let config = &self.inner.config;

        let preset = self.inner.store.lock().take();
        let store = match preset {
            Some(store) => store,
            None => match open_store(config).await {
                Ok(store) => store,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to open datastore");
                    self.enter(CoordinatorState::Terminated);
                    return Err(e);
                }
            },
        };

        let rpc = RpcServer::new(
            config.grpc_addr(),
            UserService::new(store.clone()),
            config.shutdown_timeout,
        );
        let gateway = GatewayServer::new(
            config.http_addr(),
            config.grpc_addr(),
            config.dial_timeout,
            config.shutdown_timeout,
        );
        let _ = self.inner.servers.set(Servers {
            rpc: rpc.clone(),
            gateway: gateway.clone(),
        });

        let mut rpc_unit = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.start().await }
        });
        let mut gateway_unit = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.start().await }
        });
        self.enter(CoordinatorState::Running);
        tracing::info!(
            grpc = %rpc.handle().addr(),
            http = %gateway.handle().addr(),
            "Servers launched"
        );

        let mut rpc_exit = None;
        let mut gateway_exit = None;
        let trigger = tokio::select! {
            Some(signal) = signals.next() => {
                tracing::info!(%signal, "Received shutdown signal");
                ShutdownTrigger::Signal(signal.to_string())
            }
            res = &mut rpc_unit => {
                let exit = flatten(rpc::NAME, res);
                let trigger = ShutdownTrigger::RpcFailed(describe(&exit));
                rpc_exit = Some(exit);
                trigger
            }
            res = &mut gateway_unit => {
                let exit = flatten(gateway::NAME, res);
                let trigger = ShutdownTrigger::GatewayFailed(describe(&exit));
                gateway_exit = Some(exit);
                trigger
            }
        };

        self.enter(CoordinatorState::ShuttingDown);
        tracing::info!(%trigger, "Shutting down servers...");

        // The gateway goes first so no translated call outlives its backend.
        let gateway_stop = StopRecord::time(gateway::NAME, gateway.stop()).await;
        let rpc_stop = StopRecord::time(rpc::NAME, rpc.stop()).await;

        // Generous bound: each stop already waited up to twice the timeout.
        let join_bound = config.shutdown_timeout;
        let gateway_exit = match gateway_exit {
            Some(exit) => exit,
            None => join_unit(gateway::NAME, gateway_unit, join_bound).await,
        };
        let rpc_exit = match rpc_exit {
            Some(exit) => exit,
            None => join_unit(rpc::NAME, rpc_unit, join_bound).await,
        };

        let store_close = close_store(store.as_ref(), config.shutdown_timeout).await;

        self.enter(CoordinatorState::Terminated);

        let mut ignored_signals = 0;
        while let Some(Some(signal)) = signals.next().now_or_never() {
            tracing::warn!(%signal, "Ignoring signal received during shutdown");
            ignored_signals += 1;
        }

        tracing::info!(%trigger, "Shutdown complete");
        Ok(ShutdownReport {
            trigger,
            gateway_stop,
            rpc_stop,
            gateway_exit,
            rpc_exit,
            store_close,
            ignored_signals,
        })
    }
}

fn flatten(
    server: &'static str,
    res: Result<Result<(), LifecycleError>, JoinError>,
) -> Result<(), LifecycleError> {
    res.map_err(|e| LifecycleError::Join {
        server,
        reason: e.to_string(),
    })?
}

fn describe(exit: &Result<(), LifecycleError>) -> String {
    match exit {
        Ok(()) => "exited without being stopped".to_string(),
        Err(e) => e.to_string(),
    }
}

/// Closes the datastore, giving up past `bound`.
async fn close_store(store: &dyn UserStore, bound: Duration) -> Result<(), String> {
    let res = match timeout(bound, store.close()).await {
        Ok(res) => res.map_err(|e| e.to_string()),
        Err(_) => Err(format!("close timed out after {bound:?}")),
    };
    if let Err(e) = &res {
        tracing::error!(error = %e, "Failed to close datastore");
    }
    res
}

/// Waits for a server task to unwind, aborting it past `bound`.
async fn join_unit(
    server: &'static str,
    mut unit: JoinHandle<Result<(), LifecycleError>>,
    bound: Duration,
) -> Result<(), LifecycleError> {
    match timeout(bound, &mut unit).await {
        Ok(res) => flatten(server, res),
        Err(_) => {
            tracing::warn!(server, "Server task did not exit in time, aborting");
            unit.abort();
            Err(LifecycleError::Join {
                server,
                reason: "did not exit in time".to_string(),
            })
        }
    }
}
