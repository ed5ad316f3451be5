//! The User resource service registered into the RPC server.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC service entry point (`UserService`).

pub mod handler;
