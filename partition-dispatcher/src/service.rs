use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::ClientConfig;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    dispatcher::{
        DispatchLoop, DispatchMode, Dispatcher, DispatcherHandle, OrderedDispatcher,
        UnorderedDispatcher,
    },
    executor::{HttpExecutor, LoggingExecutor},
    kafka::{client::fetch_partition_count, KafkaBrokerClient},
    partition_gate::OperationalControls,
    request::{RequestExecutor, RequestHandler},
    worker_pool::WorkerPool,
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// The partition dispatcher service: one dispatch loop thread plus its worker pool.
pub struct DispatcherService {
    config: Config,
    handler: Arc<RequestHandler>,
    controls: Arc<OperationalControls>,
    shutdown: CancellationToken,
    handle: Option<DispatcherHandle>,
}

impl DispatcherService {
    /// Create a new service from configuration
    pub fn new(config: Config) -> Result<Self> {
        let executor: Arc<dyn RequestExecutor> = match &config.executor_url {
            Some(url) => Arc::new(
                HttpExecutor::new(url.clone(), config.executor_timeout())
                    .with_context(|| format!("Failed to create HTTP executor for '{url}'"))?,
            ),
            None => {
                warn!("EXECUTOR_URL not set, requests will only be logged");
                Arc::new(LoggingExecutor)
            }
        };

        Self::with_executor(config, executor)
    }

    /// Create a service with a custom executor
    pub fn with_executor(config: Config, executor: Arc<dyn RequestExecutor>) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for service with consumer topic '{}' and group '{}'",
                config.kafka_consumer_topic, config.kafka_consumer_group
            )
        })?;

        let handler = RequestHandler::new(executor)
            .with_default_authentication(config.default_authentication())
            .with_missing_credential_policy(config.missing_credential_policy);

        Ok(Self {
            config,
            handler: Arc::new(handler),
            controls: Arc::new(OperationalControls::new()),
            shutdown: CancellationToken::new(),
            handle: None,
        })
    }

    /// Operator controls backing the `/_pause` and `/_resume` routes.
    pub fn controls(&self) -> Arc<OperationalControls> {
        self.controls.clone()
    }

    /// Connect to Kafka and start the dispatch loop thread.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(anyhow::anyhow!("Service already initialized"));
        }

        let consumer_config = self.config.build_consumer_config();
        let pool_size = self
            .pool_size(consumer_config.clone(), METADATA_TIMEOUT)
            .await;
        let runtime = Handle::current();
        let pool = WorkerPool::new(runtime.clone(), pool_size);

        let dispatcher = self.build_dispatcher(consumer_config, pool).with_context(|| {
            format!(
                "Failed to create Kafka consumer for topic '{}' with group '{}'",
                self.config.kafka_consumer_topic, self.config.kafka_consumer_group
            )
        })?;

        let settings = self.config.dispatcher_settings();
        let handle = DispatchLoop::new(dispatcher, runtime, self.shutdown.clone(), &settings)
            .spawn()
            .context("Failed to spawn dispatcher thread")?;

        info!(
            topic = self.config.kafka_consumer_topic,
            group = self.config.kafka_consumer_group,
            mode = ?self.config.dispatch_mode,
            "Initialized dispatcher"
        );

        self.handle = Some(handle);
        Ok(())
    }

    async fn pool_size(&self, consumer_config: ClientConfig, timeout: Duration) -> usize {
        let topic = self.config.kafka_consumer_topic.clone();
        // the metadata request blocks its thread for up to `timeout`
        let fetched = tokio::task::spawn_blocking(move || {
            fetch_partition_count(&consumer_config, &topic, timeout)
        })
        .await;

        let partition_count = match fetched {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                warn!(
                    topic = self.config.kafka_consumer_topic,
                    error = ?e,
                    "Could not fetch partition count, worker pool size is not capped"
                );
                0
            }
            Err(e) => {
                warn!(
                    error = ?e,
                    "Partition count lookup task failed, worker pool size is not capped"
                );
                0
            }
        };

        WorkerPool::effective_size(self.config.worker_pool_size, partition_count)
    }

    fn build_dispatcher(
        &self,
        consumer_config: ClientConfig,
        pool: WorkerPool,
    ) -> Result<Box<dyn Dispatcher>> {
        let settings = self.config.dispatcher_settings();
        let topic = self.config.kafka_consumer_topic.clone();
        let max_poll_records = self.config.kafka_max_poll_records;
        let connect = move |listener| {
            KafkaBrokerClient::new(&consumer_config, &topic, max_poll_records, listener)
        };

        let dispatcher: Box<dyn Dispatcher> = match self.config.dispatch_mode {
            DispatchMode::Ordered => Box::new(OrderedDispatcher::new(
                settings,
                pool,
                self.handler.clone(),
                self.controls.clone(),
                connect,
            )?),
            DispatchMode::Unordered => Box::new(UnorderedDispatcher::new(
                settings,
                pool,
                self.handler.clone(),
                self.controls.clone(),
                connect,
            )?),
        };
        Ok(dispatcher)
    }

    /// Run the service until ctrl+c
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c signal: {e:#}");
            }
        })
        .await
    }

    /// Run the service with a custom shutdown signal (useful for testing)
    pub async fn run_with_shutdown(
        mut self,
        shutdown_signal: impl Future<Output = ()>,
    ) -> Result<()> {
        if self.handle.is_none() {
            self.initialize().await?;
        }

        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow::anyhow!("Dispatcher not initialized"))?;

        info!("Starting partition dispatcher service");

        tokio::select! {
            _ = shutdown_signal => {
                info!("Received shutdown signal, shutting down gracefully...");
            }
            _ = wait_for_exit(&handle) => {
                error!("Dispatcher thread exited before shutdown was requested");
            }
        }

        handle.shutdown();

        // the loop drains revoked partitions on close, then waits for the pool
        let timeout = self.config.shutdown_timeout()
            + Duration::from_millis(self.config.revoke_drain_timeout_ms)
            + Duration::from_millis(self.config.poll_timeout_ms);
        let join = tokio::task::spawn_blocking(move || handle.join());

        match tokio::time::timeout(timeout, join).await {
            Ok(Ok(true)) => info!("Dispatcher stopped normally"),
            Ok(Ok(false)) => error!("Dispatcher thread panicked"),
            Ok(Err(e)) => error!("Dispatcher join task failed: {e:#}"),
            Err(_) => error!("Dispatcher shutdown timed out after {:?}", timeout),
        }

        info!("Partition dispatcher service stopped");
        Ok(())
    }
}

async fn wait_for_exit(handle: &DispatcherHandle) {
    let mut interval = tokio::time::interval(EXIT_CHECK_INTERVAL);
    while !handle.is_finished() {
        interval.tick().await;
    }
}
