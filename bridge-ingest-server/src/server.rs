use std::sync::Arc;

use anyhow::Context;
use bridge_ingest_logic::{
    EventRouter, EvmWatcher, JobQueue, Metrics, ReplayService, SolanaWatcher, StateEngine,
    lock::lock_from_settings,
    queue::{Backpressure, RateLimiter, backend_from_settings},
    store::store_from_settings,
    watcher::{evm::AlloyEvmClient, solana::RpcSolanaClient},
};
use prometheus::Registry;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{metrics_server, settings::Settings};

const SERVICE_NAME: &str = "bridge_ingest";

/// Wired components plus the background tasks driving them.
pub struct Service {
    pub engine: Arc<StateEngine>,
    pub queue: Arc<JobQueue>,
    pub router: Arc<EventRouter>,
    pub replay: ReplayService,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Service {
    /// Builds every component and spawns the queue workers and the
    /// configured watchers. Any configuration or connection error aborts.
    pub async fn start(settings: Settings, registry: &Registry) -> Result<Self, anyhow::Error> {
        let metrics = Arc::new(Metrics::new(registry).context("failed to register metrics")?);

        let store = store_from_settings(&settings.state)
            .await
            .context("failed to open state store")?;
        let lock = lock_from_settings(&settings.locks.backend)
            .await
            .context("failed to connect lock backend")?;
        let backend = backend_from_settings(&settings.queue.backend)
            .await
            .context("failed to open queue backend")?;

        let engine = Arc::new(StateEngine::new(
            store.clone(),
            lock,
            settings.engine,
            settings.confirmations.clone(),
            settings.locks,
            metrics.clone(),
        ));
        let queue = Arc::new(JobQueue::new(
            backend,
            engine.clone(),
            RateLimiter::new(&settings.rate_limits),
            Arc::new(Backpressure::new(&settings.backpressure)),
            settings.queue.clone(),
            metrics.clone(),
        ));
        let router = Arc::new(EventRouter::new(queue.clone(), metrics.clone()));
        let replay = ReplayService::new(router.clone(), settings.replay);

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for worker in 0..settings.queue.worker_count.max(1) {
            tasks.spawn(queue.clone().run(worker, cancel.child_token()));
        }

        if let Some(evm) = settings.evm {
            let client = Arc::new(AlloyEvmClient::new(evm.rpc_url.clone()));
            let watcher = EvmWatcher::new(
                client,
                router.clone(),
                store.clone(),
                evm,
                settings.confirmations.base,
                cancel.child_token(),
                metrics.clone(),
            )
            .context("failed to load evm abi files")?;
            tasks.spawn(Arc::new(watcher).run());
        }

        if let Some(solana) = settings.solana {
            let client = Arc::new(
                RpcSolanaClient::new(
                    solana.rpc_url.clone(),
                    solana.ws_url.clone(),
                    solana.commitment.clone(),
                )
                .context("failed to build solana client")?,
            );
            let watcher = SolanaWatcher::new(
                client,
                router.clone(),
                store,
                solana,
                settings.confirmations.solana,
                cancel.child_token(),
                metrics,
            );
            tasks.spawn(Arc::new(watcher).run());
        }

        if tasks.len() == settings.queue.worker_count.max(1) {
            tracing::warn!("no chain configured, only externally submitted events will be processed");
        }

        Ok(Self {
            engine,
            queue,
            router,
            replay,
            cancel,
            tasks,
        })
    }

    /// Cancels every task and waits for them. A queue tick already running
    /// is completed first.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                tracing::error!(err = ?err, "task failed during shutdown");
            }
        }
        tracing::info!("all tasks stopped");
    }
}

pub async fn run(settings: Settings) -> Result<(), anyhow::Error> {
    blockscout_service_launcher::tracing::init_logs(SERVICE_NAME, &settings.tracing, &settings.jaeger)?;

    let registry = prometheus::default_registry().clone();
    let metrics = settings.metrics.clone();
    let service = Service::start(settings, &registry).await?;
    let metrics_server = if metrics.enabled {
        let server = metrics_server::serve(&metrics, registry)?;
        let handle = server.handle();
        tokio::spawn(async move {
            if let Err(err) = server.await {
                tracing::error!(err = ?err, "metrics server failed");
            }
        });
        Some(handle)
    } else {
        None
    };
    tracing::info!("bridge ingest started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    service.shutdown().await;
    if let Some(handle) = metrics_server {
        handle.stop(true).await;
    }
    Ok(())
}
