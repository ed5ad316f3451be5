use clap::Parser;
use usergate_server::server::telemetry::init_telemetry;
use usergate_server::{CliArgs, Coordinator, ServerConfig, os_signals};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry(&config)?;
    log_startup_info(&config);

    let signals = os_signals()?;
    let result = Coordinator::new(config).run(signals).await;
    providers.shutdown();

    let report = result?;
    if report.trigger.is_failure() {
        anyhow::bail!("shut down after failure: {}", report.trigger);
    }
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting usergate with full config: {:#?}", config);
    } else {
        tracing::info!(
            grpc = %config.grpc_addr(),
            http = %config.http_addr(),
            database = %config.database.name,
            "Starting usergate"
        );
    }
}
