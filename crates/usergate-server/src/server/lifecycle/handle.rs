//! Per-server lifecycle handle.
//!
//! A [`ServerHandle`] is the piece of a server that the coordinator can see:
//! its fixed address, its published [`ServerState`], and the two tokens used
//! to stop it. The server's own task drives the state forward while serving;
//! the coordinator only ever calls [`ServerHandle::stop`].
//!
//! ```text
//! created → starting → running → stopping → stopped
//!              │          │          │
//!              └──────────┴──────────┴────→ failed
//! ```
//!
//! A stop requested before the server reached `running` short-circuits
//! `starting → stopped` (or `created → stopped`): nothing was ever bound, so
//! there is nothing to drain.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a single server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServerState {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Starting)
                | (Self::Created, Self::Stopped)
                | (Self::Starting, Self::Running)
                | (Self::Starting, Self::Stopped)
                | (Self::Starting, Self::Failed)
                | (Self::Running, Self::Stopping)
                | (Self::Running, Self::Failed)
                | (Self::Stopping, Self::Stopped)
                | (Self::Stopping, Self::Failed)
        )
    }

    /// `stopped` and `failed` are final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// How a call to [`ServerHandle::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The server was already stopped (or failed); nothing to do.
    AlreadyStopped,
    /// The server never got to serve; it will not start.
    NotStarted,
    /// In-flight work drained within the timeout.
    Drained,
    /// The drain timed out and the serve loop was dropped.
    Forced,
}

#[derive(Debug)]
struct Inner {
    name: &'static str,
    addr: String,
    state: watch::Sender<ServerState>,
    shutdown: CancellationToken,
    force: CancellationToken,
}

/// Shared lifecycle handle of one server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    inner: Arc<Inner>,
}

impl ServerHandle {
    /// Creates a handle in the `created` state.
    pub fn new(name: &'static str, addr: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        Self {
            inner: Arc::new(Inner {
                name,
                addr: addr.into(),
                state,
                shutdown: CancellationToken::new(),
                force: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Address fixed at construction.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    /// Token cancelled when a graceful stop is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Token cancelled when the graceful drain has timed out.
    pub fn force_token(&self) -> CancellationToken {
        self.inner.force.clone()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// Returns `false` (and leaves the state untouched) otherwise.
    pub fn transition(&self, next: ServerState) -> bool {
        let name = self.inner.name;
        self.inner.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                tracing::debug!(server = name, from = %current, to = %next, "state change");
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Records the end of the serve loop: `failed` on error, otherwise
    /// `stopped` (passing through `stopping` if nobody asked for a stop).
    pub fn finish(&self, succeeded: bool) {
        if succeeded {
            self.transition(ServerState::Stopping);
            self.transition(ServerState::Stopped);
        } else {
            self.transition(ServerState::Failed);
        }
    }

    /// Waits until the state satisfies `pred` and returns it.
    pub async fn wait_for(&self, pred: impl FnMut(&ServerState) -> bool) -> ServerState {
        let mut rx = self.subscribe();
        match rx.wait_for(pred).await {
            Ok(state) => *state,
            // The sender lives in `self`, so it cannot be dropped while we wait.
            Err(_) => self.state(),
        }
    }

    /// Stops the server, bounded by `drain_timeout`.
    ///
    /// Requests a graceful drain, then waits for the serve loop to reach a
    /// terminal state. If it does not get there within `drain_timeout`, the
    /// force token is cancelled: the serve loop drops its accept loop and
    /// abandons whatever work is still in flight, and we wait once more for
    /// the same bound.
    ///
    /// Idempotent: stopping a stopped server is a no-op. Stopping a server
    /// that never reached `running` returns immediately and prevents it from
    /// serving later.
    pub async fn stop(&self, drain_timeout: Duration) -> StopOutcome {
        let name = self.inner.name;

        // Decided under the state lock so a concurrent `starting → running`
        // either happens before (and we drain) or is refused.
        let mut before = ServerState::Created;
        self.inner.state.send_if_modified(|current| {
            before = *current;
            let next = match *current {
                ServerState::Created | ServerState::Starting => ServerState::Stopped,
                ServerState::Running => ServerState::Stopping,
                ServerState::Stopping | ServerState::Stopped | ServerState::Failed => {
                    return false;
                }
            };
            tracing::debug!(server = name, from = %current, to = %next, "state change");
            *current = next;
            true
        });
        self.inner.shutdown.cancel();

        match before {
            ServerState::Stopped | ServerState::Failed => return StopOutcome::AlreadyStopped,
            ServerState::Created | ServerState::Starting => {
                tracing::debug!(server = name, state = %before, "stop requested before serving");
                return StopOutcome::NotStarted;
            }
            ServerState::Running | ServerState::Stopping => {}
        }

        let terminal = |s: &ServerState| s.is_terminal();
        if timeout(drain_timeout, self.wait_for(terminal)).await.is_ok() {
            return StopOutcome::Drained;
        }

        tracing::warn!(
            server = name,
            timeout_ms = drain_timeout.as_millis() as u64,
            "graceful drain timed out, force closing"
        );
        self.inner.force.cancel();

        if timeout(drain_timeout, self.wait_for(terminal)).await.is_err() {
            tracing::error!(server = name, "serve loop did not exit after force close");
        }
        StopOutcome::Forced
    }
}
