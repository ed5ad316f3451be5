#![doc = include_str!("../README.md")]

pub mod server;

pub use server::config::{CliArgs, DatabaseConfig, ServerConfig};
pub use server::error::LifecycleError;
pub use server::lifecycle::coordinator::{
    Coordinator, CoordinatorState, ShutdownReport, ShutdownTrigger, StopRecord,
};
pub use server::lifecycle::signal::{Signal, SignalSender, manual_signals, os_signals};
