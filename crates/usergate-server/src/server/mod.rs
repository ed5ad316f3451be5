//! Server internals.
//!
//! ## Structure
//!
//! - [`config`] - CLI/env configuration and validation.
//! - [`error`] - process-level [`error::LifecycleError`].
//! - [`telemetry`] - tracing subscriber and optional OTLP export.
//! - [`store`] - the [`store::UserStore`] datastore handle and its backends.
//! - [`service`] - the `user.v1.UserService` implementation.
//! - [`rpc`] - the gRPC server.
//! - [`gateway`] - the HTTP/REST gateway that proxies to the gRPC server.
//! - [`lifecycle`] - server handles, OS signals and the coordinator.

pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod rpc;
pub mod service;
pub mod store;
pub mod telemetry;
