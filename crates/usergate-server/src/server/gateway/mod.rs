//! The HTTP/REST gateway.
//!
//! On start the gateway dials the RPC server, retrying with exponential
//! backoff while the backend is still binding, checks that the backend
//! actually serves `user.v1.UserService`, and only then binds its own HTTP
//! listener. Every REST call is translated into one call on that single
//! backend channel, which is dropped once the HTTP server has drained.

pub mod cors;
pub mod docs;
pub mod routes;
pub mod translate;

use crate::server::{
    error::LifecycleError,
    lifecycle::handle::{ServerHandle, ServerState, StopOutcome},
    service::handler::UserService,
};
use core::time::Duration;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tonic::server::NamedService;
use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::{
    HealthCheckRequest, health_check_response::ServingStatus, health_client::HealthClient,
};
use usergate_core::proto::user_service_server::UserServiceServer;

/// Name used in logs and errors.
pub const NAME: &str = "gateway";

/// First pause between dial attempts.
const DIAL_BACKOFF_START: Duration = Duration::from_millis(100);
/// Longest pause between dial attempts.
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(2);
/// Bound for the post-dial backend health check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Fully qualified name of the backend service the gateway translates to.
pub const BACKEND_SERVICE: &str = <UserServiceServer<UserService> as NamedService>::NAME;

/// The gateway server. Cheap to clone; clones share one lifecycle.
#[derive(Clone)]
pub struct GatewayServer {
    handle: ServerHandle,
    backend_addr: String,
    dial_timeout: Duration,
    drain_timeout: Duration,
    local_addr: Arc<OnceLock<SocketAddr>>,
}

impl GatewayServer {
    /// `backend_addr` is the RPC server's `host:port`, taken as a value so
    /// the backend may still be binding when the gateway starts.
    pub fn new(
        addr: impl Into<String>,
        backend_addr: impl Into<String>,
        dial_timeout: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            handle: ServerHandle::new(NAME, addr),
            backend_addr: backend_addr.into(),
            dial_timeout,
            drain_timeout,
            local_addr: Arc::new(OnceLock::new()),
        }
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    pub fn backend_addr(&self) -> &str {
        &self.backend_addr
    }

    /// The bound HTTP address, once the listener exists.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Dials the backend, binds, and serves until [`GatewayServer::stop`].
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::Dial`] if the backend is unreachable for the whole
    ///   dial timeout
    /// - [`LifecycleError::Register`] if the backend does not serve the User
    ///   service
    /// - [`LifecycleError::Listen`] if the HTTP address is unavailable
    /// - [`LifecycleError::Serve`] if the serve loop fails
    pub async fn start(&self) -> Result<(), LifecycleError> {
        if self.handle.is_stop_requested() || !self.handle.transition(ServerState::Starting) {
            tracing::debug!(server = NAME, "Stop requested before start, not serving");
            return Ok(());
        }

        let result = self.serve().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "HTTP gateway server failed");
        }
        self.handle.finish(result.is_ok());
        result
    }

    async fn serve(&self) -> Result<(), LifecycleError> {
        let shutdown = self.handle.shutdown_token();

        let Some(channel) = self.dial(&shutdown).await? else {
            return Ok(());
        };
        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            res = check_backend(channel.clone()) => res?,
        }

        let addr = self.handle.addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LifecycleError::Listen {
                server: NAME,
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        if let Ok(local) = listener.local_addr() {
            let _ = self.local_addr.set(local);
        }

        if !self.handle.transition(ServerState::Running) {
            return Ok(());
        }
        tracing::info!(address = %addr, local = ?self.local_addr(), "Starting HTTP gateway server");

        let router = routes::router(routes::GatewayState::new(channel, BACKEND_SERVICE));
        let force = self.handle.force_token();
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .into_future();

        let result = tokio::select! {
            res = serve => res.map_err(|e| LifecycleError::Serve {
                server: NAME,
                reason: e.to_string(),
            }),
            () = force.cancelled() => {
                tracing::warn!("HTTP gateway server force closed");
                Ok(())
            }
        };
        // After a force close, connection tasks keep their channel clone until
        // the backend answers; the RPC server's stop bounds that.
        tracing::info!(backend = %self.backend_addr, "Closed connection to gRPC backend");
        result
    }

    /// Connects to the backend, backing off between attempts.
    ///
    /// Returns `Ok(None)` if a stop was requested while dialing.
    async fn dial(&self, shutdown: &CancellationToken) -> Result<Option<Channel>, LifecycleError> {
        let dial_error = |reason: String| LifecycleError::Dial {
            server: NAME,
            addr: self.backend_addr.clone(),
            reason,
        };

        let endpoint = Endpoint::from_shared(format!("http://{}", self.backend_addr))
            .map_err(|e| dial_error(e.to_string()))?
            .connect_timeout(DIAL_BACKOFF_MAX);

        let deadline = Instant::now() + self.dial_timeout;
        let mut backoff = DIAL_BACKOFF_START;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let failure = tokio::select! {
                () = shutdown.cancelled() => return Ok(None),
                res = timeout_at(deadline, endpoint.connect()) => match res {
                    Ok(Ok(channel)) => {
                        tracing::info!(backend = %self.backend_addr, attempt, "Connected to gRPC backend");
                        return Ok(Some(channel));
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "timed out".to_string(),
                },
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(dial_error(format!(
                    "gave up after {attempt} attempts: {failure}"
                )));
            }

            let pause = backoff.min(deadline - now);
            tracing::debug!(
                backend = %self.backend_addr,
                attempt,
                error = %failure,
                retry_in_ms = pause.as_millis() as u64,
                "gRPC backend not ready"
            );
            tokio::select! {
                () = shutdown.cancelled() => return Ok(None),
                () = sleep(pause) => {}
            }
            backoff = (backoff * 2).min(DIAL_BACKOFF_MAX);
        }
    }

    /// Gracefully stops the server. Idempotent, and a no-op before start.
    pub async fn stop(&self) -> StopOutcome {
        tracing::info!("Stopping HTTP gateway server");
        let outcome = self.handle.stop(self.drain_timeout).await;
        tracing::info!(?outcome, "HTTP gateway server stopped");
        outcome
    }
}

/// Confirms the backend reports the User service as serving.
async fn check_backend(channel: Channel) -> Result<(), LifecycleError> {
    let register_error = |reason: String| LifecycleError::Register {
        server: NAME,
        reason,
    };

    let request = HealthCheckRequest {
        service: BACKEND_SERVICE.to_string(),
    };
    let mut health = HealthClient::new(channel);
    let reply = timeout(HEALTH_CHECK_TIMEOUT, health.check(request))
        .await
        .map_err(|_| register_error("backend health check timed out".to_string()))?
        .map_err(|status| {
            register_error(format!(
                "backend does not expose {BACKEND_SERVICE}: {}",
                status.message()
            ))
        })?;

    match reply.into_inner().status() {
        ServingStatus::Serving => Ok(()),
        other => Err(register_error(format!(
            "backend reports {BACKEND_SERVICE} as {}",
            other.as_str_name()
        ))),
    }
}
