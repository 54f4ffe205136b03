use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use partition_dispatcher::{
    config::{Config, LogFormat},
    server::{router, serve, setup_metrics_routes},
    service::DispatcherService,
};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true);

    let log_layer = match format {
        LogFormat::Text => base_layer.with_filter(filter).boxed(),
        LogFormat::Json => base_layer.json().with_filter(filter).boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(config: &Config, service: &DispatcherService) -> Result<JoinHandle<()>> {
    let router = setup_metrics_routes(router(service.controls()))
        .context("Failed to install Prometheus recorder")?;
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    init_tracing(config.log_format);
    info!("Starting partition dispatcher");
    info!("Configuration loaded: {:?}", config);

    let service = DispatcherService::new(config.clone())
        .context("Failed to create partition dispatcher service")?;

    let server_handle = start_server(&config, &service)?;
    info!("Started metrics server on {}", config.bind_address());

    // blocks until ctrl+c and a graceful drain
    service.run().await?;

    server_handle.abort();

    Ok(())
}
