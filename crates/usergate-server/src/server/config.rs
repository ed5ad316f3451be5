use crate::server::error::LifecycleError;
use clap::Parser;
use core::time::Duration;
use std::str::FromStr;
use tracing_subscriber::filter::LevelFilter;

pub const DEFAULT_DATABASE_URI: &str = "mongodb://localhost:27017";
pub const DEFAULT_DATABASE_NAME: &str = "grpcgateway_db";

/// Runtime configuration for the `usergate-server` binary.
///
/// Every option can be given as a CLI flag or an environment variable (a
/// `.env` file in the working directory is loaded first). Unset options fall
/// back to the defaults below.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "usergate-server",
    version,
    about = "A gRPC User service with a REST gateway backed by MongoDB"
)]
pub struct CliArgs {
    /// Host both servers bind to. The gateway also dials the RPC server here.
    ///
    /// Environment variable: `HOST`
    #[arg(long, env = "HOST", default_value_t = String::from("localhost"))]
    pub host: String,

    /// Port of the gRPC server.
    ///
    /// Environment variable: `GRPC_PORT`
    #[arg(long, env = "GRPC_PORT", default_value_t = 9090)]
    pub grpc_port: u16,

    /// Port of the HTTP/REST gateway.
    ///
    /// Environment variable: `HTTP_PORT`
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Datastore connection string [default: mongodb://localhost:27017].
    ///
    /// `mongodb://` and `mongodb+srv://` select MongoDB; `memory://` selects
    /// the in-process store, which forgets everything on exit.
    ///
    /// Environment variable: `DATABASE_URI`, or `MONGODB_URI`
    #[arg(long, env = "DATABASE_URI", visible_alias = "mongodb-uri")]
    pub database_uri: Option<String>,

    /// Database holding the `users` collection [default: grpcgateway_db].
    ///
    /// Environment variable: `DATABASE_NAME`, or `MONGODB_DATABASE`
    #[arg(long, env = "DATABASE_NAME", visible_alias = "mongodb-database")]
    pub database_name: Option<String>,

    /// Older name for `DATABASE_URI`, read only when that is unset.
    #[arg(long, env = "MONGODB_URI", hide = true)]
    pub legacy_mongodb_uri: Option<String>,

    /// Older name for `DATABASE_NAME`, read only when that is unset.
    #[arg(long, env = "MONGODB_DATABASE", hide = true)]
    pub legacy_mongodb_database: Option<String>,

    /// Log verbosity: `trace`, `debug`, `info`, `warn` or `error`.
    ///
    /// `RUST_LOG`, when set, takes precedence.
    ///
    /// Environment variable: `LOG_LEVEL`
    #[arg(long, env = "LOG_LEVEL", default_value_t = String::from("info"))]
    pub log_level: String,

    /// Upper bound in seconds for connecting to and pinging the datastore.
    ///
    /// Environment variable: `CONNECT_TIMEOUT_SECS`
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// How long in seconds the gateway keeps retrying to reach the RPC server.
    ///
    /// Environment variable: `DIAL_TIMEOUT_SECS`
    #[arg(long, env = "DIAL_TIMEOUT_SECS", default_value_t = 10)]
    pub dial_timeout_secs: u64,

    /// How long in seconds each server may drain in-flight requests before
    /// it is force-closed.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,
}

/// Datastore settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub uri: String,
    pub name: String,
}

/// Validated, immutable configuration shared by every component.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub grpc_port: u16,
    pub http_port: u16,
    pub database: DatabaseConfig,
    pub log_level: LevelFilter,
    pub connect_timeout: Duration,
    pub dial_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    /// `host:grpc_port`, the RPC listener and the gateway's dial target.
    pub fn grpc_addr(&self) -> String {
        join_host_port(&self.host, self.grpc_port)
    }

    /// `host:http_port`, the gateway listener.
    pub fn http_addr(&self) -> String {
        join_host_port(&self.host, self.http_port)
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = LifecycleError;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let host = args.host.trim().to_string();
        if host.is_empty() {
            return Err(LifecycleError::config("HOST must not be empty"));
        }

        if args.grpc_port != 0 && args.grpc_port == args.http_port {
            return Err(LifecycleError::config(format!(
                "GRPC_PORT and HTTP_PORT must differ (both are {})",
                args.grpc_port
            )));
        }

        let database_uri = args
            .database_uri
            .or(args.legacy_mongodb_uri)
            .unwrap_or_else(|| DEFAULT_DATABASE_URI.to_string());
        if database_uri.trim().is_empty() {
            return Err(LifecycleError::config("DATABASE_URI must not be empty"));
        }

        let database_name = args
            .database_name
            .or(args.legacy_mongodb_database)
            .unwrap_or_else(|| DEFAULT_DATABASE_NAME.to_string());
        if database_name.trim().is_empty() {
            return Err(LifecycleError::config("DATABASE_NAME must not be empty"));
        }

        let log_level = parse_log_level(&args.log_level)?;

        for (name, secs) in [
            ("CONNECT_TIMEOUT_SECS", args.connect_timeout_secs),
            ("DIAL_TIMEOUT_SECS", args.dial_timeout_secs),
            ("SHUTDOWN_TIMEOUT_SECS", args.shutdown_timeout_secs),
        ] {
            if secs == 0 {
                return Err(LifecycleError::config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        Ok(Self {
            host,
            grpc_port: args.grpc_port,
            http_port: args.http_port,
            database: DatabaseConfig {
                uri: database_uri.trim().to_string(),
                name: database_name.trim().to_string(),
            },
            log_level,
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            dial_timeout: Duration::from_secs(args.dial_timeout_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}

/// Accepts the usual level names plus logrus-style `warning`, `fatal` and
/// `panic`.
fn parse_log_level(raw: &str) -> Result<LevelFilter, LifecycleError> {
    let normalized = raw.trim().to_ascii_lowercase();
    let normalized = match normalized.as_str() {
        "warning" => "warn",
        "fatal" | "panic" => "error",
        other => other,
    };
    LevelFilter::from_str(normalized)
        .map_err(|_| LifecycleError::config(format!("LOG_LEVEL {raw:?} is not a log level")))
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
