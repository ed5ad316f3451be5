//! The gRPC server.
//!
//! Serves `user.v1.UserService` together with the standard health and
//! reflection services. gRPC-web is accepted over HTTP/1.1 so browsers can
//! talk to it directly, hence the permissive CORS layer.
//!
//! While serving, a watch task pings the datastore and keeps the health status of
//! `user.v1.UserService` in line with it. The gateway's `/health` reads that
//! status, so it reports the datastore too.

use crate::server::{
    error::LifecycleError,
    lifecycle::handle::{ServerHandle, ServerState, StopOutcome},
    service::handler::UserService,
};
use core::time::Duration;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio::time::{MissedTickBehavior, interval};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use usergate_core::proto::{FILE_DESCRIPTOR_SET, user_service_server::UserServiceServer};

/// Name used in logs and errors.
pub const NAME: &str = "grpc";

/// Pause between datastore health checks.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// The RPC server. Cheap to clone; clones share one lifecycle.
///
/// The resource service is registered at construction; nothing can be added
/// once [`RpcServer::start`] has been called.
#[derive(Clone)]
pub struct RpcServer {
    handle: ServerHandle,
    service: UserService,
    drain_timeout: Duration,
    health_interval: Duration,
    local_addr: Arc<OnceLock<SocketAddr>>,
}

impl RpcServer {
    pub fn new(addr: impl Into<String>, service: UserService, drain_timeout: Duration) -> Self {
        Self {
            handle: ServerHandle::new(NAME, addr),
            service,
            drain_timeout,
            health_interval: HEALTH_CHECK_INTERVAL,
            local_addr: Arc::new(OnceLock::new()),
        }
    }

    /// Overrides [`HEALTH_CHECK_INTERVAL`].
    #[must_use]
    pub fn with_health_interval(mut self, health_interval: Duration) -> Self {
        self.health_interval = health_interval;
        self
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    /// The bound address, once the listener exists.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Binds and serves until [`RpcServer::stop`] is called.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Bind`] if the address is malformed or taken,
    /// [`LifecycleError::Register`] if reflection cannot be built, and
    /// [`LifecycleError::Serve`] if the serve loop fails.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        if self.handle.is_stop_requested() || !self.handle.transition(ServerState::Starting) {
            tracing::debug!(server = NAME, "Stop requested before start, not serving");
            return Ok(());
        }

        let result = self.serve().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "gRPC server failed");
        }
        self.handle.finish(result.is_ok());
        result
    }

    async fn serve(&self) -> Result<(), LifecycleError> {
        let addr = self.handle.addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LifecycleError::Bind {
                server: NAME,
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        if let Ok(local) = listener.local_addr() {
            let _ = self.local_addr.set(local);
        }

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<UserServiceServer<UserService>>()
            .await;

        let reflection = Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| LifecycleError::Register {
                server: NAME,
                reason: e.to_string(),
            })?;

        if !self.handle.transition(ServerState::Running) {
            // Stopped while binding; release the listener without serving.
            return Ok(());
        }
        tracing::info!(address = %addr, local = ?self.local_addr(), "Starting gRPC server");

        let shutdown = self.handle.shutdown_token();
        let force = self.handle.force_token();

        // Ends with the serve loop, whichever way it ends.
        let watch_stop = shutdown.child_token();
        let watch_guard = watch_stop.clone().drop_guard();
        tokio::spawn(watch_datastore(
            self.service.clone(),
            health_reporter,
            watch_stop,
            self.health_interval,
        ));

        let serve = Server::builder()
            .accept_http1(true)
            .http2_adaptive_window(Some(true))
            .layer(
                ServiceBuilder::new()
                    .layer(
                        CorsLayer::new()
                            .allow_origin(Any)
                            .allow_methods(Any)
                            .allow_headers(Any),
                    )
                    .layer(GrpcWebLayer::new()),
            )
            .add_service(health_service)
            .add_service(reflection)
            .add_service(build_user_service(self.service.clone()))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled_owned(),
            );

        let result = tokio::select! {
            res = serve => res.map_err(|e| LifecycleError::Serve {
                server: NAME,
                reason: e.to_string(),
            }),
            () = force.cancelled() => {
                tracing::warn!("gRPC server force closed");
                Ok(())
            }
        };
        drop(watch_guard);

        // Connection tasks outlive the accept loop. Their datastore calls
        // must not outlive the server.
        tokio::select! {
            () = self.service.wait_requests() => {}
            () = force.cancelled() => {
                if !self.service.abandon_requests(self.drain_timeout).await {
                    tracing::error!(
                        left = self.service.inflight(),
                        "Datastore calls still running after force close"
                    );
                }
            }
        }
        result
    }

    /// Gracefully stops the server. Idempotent.
    ///
    /// Health flips to `NOT_SERVING` as soon as the drain begins.
    pub async fn stop(&self) -> StopOutcome {
        tracing::info!("Stopping gRPC server");
        let outcome = self.handle.stop(self.drain_timeout).await;
        tracing::info!(?outcome, "gRPC server stopped");
        outcome
    }
}

/// Keeps the User service's health status in line with the datastore until
/// `stop` is cancelled, then reports `NOT_SERVING`.
///
/// This is the only writer of that status once the server is running.
async fn watch_datastore(
    service: UserService,
    reporter: HealthReporter,
    stop: CancellationToken,
    every: Duration,
) {
    let mut ticks = interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the tick that fires immediately.
    ticks.tick().await;
    let mut serving = true;

    loop {
        let healthy = tokio::select! {
            () = stop.cancelled() => break,
            _ = ticks.tick() => tokio::select! {
                () = stop.cancelled() => break,
                res = service.ping() => match res {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(error = %e, "Datastore health check failed");
                        false
                    }
                },
            },
        };

        if healthy != serving {
            serving = healthy;
            if serving {
                tracing::info!("Datastore reachable again, reporting SERVING");
                reporter.set_serving::<UserServiceServer<UserService>>().await;
            } else {
                reporter
                    .set_not_serving::<UserServiceServer<UserService>>()
                    .await;
            }
        }
    }

    reporter
        .set_not_serving::<UserServiceServer<UserService>>()
        .await;
}

fn build_user_service(service: UserService) -> UserServiceServer<UserService> {
    UserServiceServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::store::{UserStore, memory::MemoryStore};

    fn server(addr: &str) -> RpcServer {
        let service = UserService::new(Arc::new(MemoryStore::new()));
        RpcServer::new(addr, service, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn fails_when_port_is_taken() {
        let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = squatter.local_addr().unwrap().to_string();

        let rpc = server(&addr);
        let err = rpc.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Bind { .. }));
        assert_eq!(rpc.handle().state(), ServerState::Failed);
        assert_eq!(rpc.stop().await, StopOutcome::AlreadyStopped);
    }

    #[tokio::test]
    async fn fails_on_malformed_address() {
        let rpc = server("not an address");
        assert!(matches!(
            rpc.start().await,
            Err(LifecycleError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn serves_until_stopped() {
        let rpc = server("127.0.0.1:0");
        let unit = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.start().await }
        });

        rpc.handle()
            .wait_for(|s| *s == ServerState::Running)
            .await;
        assert!(rpc.local_addr().is_some());

        assert_eq!(rpc.stop().await, StopOutcome::Drained);
        unit.await.unwrap().unwrap();
        assert_eq!(rpc.handle().state(), ServerState::Stopped);
        assert_eq!(rpc.stop().await, StopOutcome::AlreadyStopped);
    }

    #[tokio::test]
    async fn never_serves_after_early_stop() {
        let rpc = server("127.0.0.1:0");
        assert_eq!(rpc.stop().await, StopOutcome::NotStarted);
        rpc.start().await.unwrap();
        assert!(rpc.local_addr().is_none());
        assert_eq!(rpc.handle().state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn health_follows_the_datastore() {
        use tonic::transport::Endpoint;
        use tonic_health::pb::{
            HealthCheckRequest, health_check_response::ServingStatus, health_client::HealthClient,
        };

        let store = Arc::new(MemoryStore::new());
        let rpc = RpcServer::new(
            "127.0.0.1:0",
            UserService::new(store.clone()),
            Duration::from_secs(2),
        )
        .with_health_interval(Duration::from_millis(20));
        let unit = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.start().await }
        });
        rpc.handle()
            .wait_for(|s| *s == ServerState::Running)
            .await;

        let channel = Endpoint::from_shared(format!("http://{}", rpc.local_addr().unwrap()))
            .unwrap()
            .connect()
            .await
            .unwrap();
        let mut health = HealthClient::new(channel);
        let request = || HealthCheckRequest {
            service: "user.v1.UserService".to_string(),
        };
        let status = health.check(request()).await.unwrap().into_inner().status();
        assert_eq!(status, ServingStatus::Serving);

        store.close().await.unwrap();
        let mut status = ServingStatus::Serving;
        for _ in 0..100 {
            status = health.check(request()).await.unwrap().into_inner().status();
            if status == ServingStatus::NotServing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, ServingStatus::NotServing);

        drop(health);
        assert_eq!(rpc.stop().await, StopOutcome::Drained);
        unit.await.unwrap().unwrap();
    }
}
