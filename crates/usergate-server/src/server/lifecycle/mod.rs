//! Startup, supervision and ordered shutdown of the two servers.

pub mod coordinator;
pub mod handle;
pub mod signal;
