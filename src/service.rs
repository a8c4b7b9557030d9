use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use kv_store::{KvStore, RedisStore};
use metrics::{init_provider, sync_stats};
use mirror_utils::{periodic, with_jitter};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tokio::{signal, sync::watch, task::JoinHandle};
use tracing::{error, info, Instrument};

use crate::{
    cache_writer::CacheWriter,
    config::MirrorConfig,
    engine::{ContainerEngine, DockerEngine},
    event_listener::EventListener,
    observer::{BroadcastObserver, LoggingObserver, Observer, Observers},
    reconciler::Reconciler,
    sweeper::Sweeper,
};

const EVENTS_CAPACITY: usize = 1024;

#[allow(dead_code)]
pub struct Service {
    pub config: MirrorConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub store: Arc<dyn KvStore>,
    pub engine: Arc<dyn ContainerEngine>,
    pub metrics: Arc<sync_stats::Metrics>,
    pub events: Arc<BroadcastObserver>,
    pub observer: Arc<dyn Observer>,
    pub writer: Arc<CacheWriter>,
    pub reconciler: Arc<Reconciler>,
    pub sweeper: Arc<Sweeper>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Service {
    pub async fn new(config: MirrorConfig) -> Result<Self> {
        let meter_provider = init_provider(
            config.telemetry.enable_metrics,
            config.telemetry.endpoint.as_ref(),
            config.metrics_interval(),
            &config.host_id,
            env!("CARGO_PKG_VERSION"),
        )
        .context("error initializing the meter provider")?;

        let store = Arc::new(
            RedisStore::connect(&config.store.url)
                .await
                .context("error connecting to the store")?,
        );
        let engine = Arc::new(
            DockerEngine::connect(config.engine.socket.as_deref())
                .context("error connecting to the container engine")?,
        );

        let mut service = Self::with_components(config, store, engine)?;
        service.meter_provider = meter_provider;
        Ok(service)
    }

    pub fn with_components(
        config: MirrorConfig,
        store: Arc<dyn KvStore>,
        engine: Arc<dyn ContainerEngine>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let metrics = Arc::new(sync_stats::Metrics::new());
        let events = Arc::new(BroadcastObserver::new(EVENTS_CAPACITY));
        let logging: Arc<dyn Observer> = Arc::new(LoggingObserver::new(metrics.clone()));
        let broadcast: Arc<dyn Observer> = events.clone();
        let observer: Arc<dyn Observer> = Arc::new(Observers::new(vec![logging, broadcast]));

        let writer = Arc::new(CacheWriter::new(store.clone(), &config, metrics.clone()));
        let reconciler = Arc::new(Reconciler::new(
            engine.clone(),
            writer.clone(),
            observer.clone(),
            metrics.clone(),
            config.reconcile_concurrency,
        ));
        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            config.key_schema(),
            observer.clone(),
            config.reconcile_concurrency,
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            store,
            engine,
            metrics,
            events,
            observer,
            writer,
            reconciler,
            sweeper,
            meter_provider: None,
        })
    }

    pub fn event_listener(&self) -> EventListener {
        EventListener::new(
            self.engine.clone(),
            self.writer.clone(),
            self.observer.clone(),
            self.shutdown_rx.clone(),
        )
    }

    /// Runs until a shutdown signal arrives or [`Service::shutdown`] is
    /// called.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.spawn_tasks();

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown_tx).await;
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        let _ = shutdown_rx.changed().await;
        info!("waiting for synchronisation tasks to stop");
        for task in tasks.drain(..) {
            if let Err(err) = task.await {
                error!("synchronisation task failed: {:?}", err);
            }
        }

        if let Some(provider) = &self.meter_provider {
            if let Err(err) = provider.shutdown() {
                error!("Error shutting down meter provider: {:?}", err);
            }
        }
        Ok(())
    }

    pub fn spawn_tasks(&self) -> Vec<JoinHandle<()>> {
        let host = self.config.host_id.clone();
        let mut tasks = Vec::new();

        let mut listener = self.event_listener();
        tasks.push(tokio::spawn(
            async move { listener.start().await }
                .instrument(tracing::info_span!("event_listener", host = %host)),
        ));

        let reconciler = self.reconciler.clone();
        tasks.push(tokio::spawn(
            run_periodically(
                "reconcile_containers",
                self.config.update_interval(),
                self.shutdown_rx.clone(),
                move || {
                    let reconciler = reconciler.clone();
                    async move { reconciler.run_containers().await }
                },
            )
            .instrument(tracing::info_span!("reconcile_containers", host = %host)),
        ));

        let reconciler = self.reconciler.clone();
        tasks.push(tokio::spawn(
            run_periodically(
                "reconcile_images",
                self.config.image_update_interval(),
                self.shutdown_rx.clone(),
                move || {
                    let reconciler = reconciler.clone();
                    async move { reconciler.run_images().await }
                },
            )
            .instrument(tracing::info_span!("reconcile_images", host = %host)),
        ));

        let sweep_period = with_jitter(self.config.expire_interval(), self.config.sweep_jitter());
        info!(
            sweep_period_secs = sweep_period.as_secs(),
            "expiration sweep scheduled"
        );
        let sweeper = self.sweeper.clone();
        tasks.push(tokio::spawn(
            run_periodically(
                "sweep",
                sweep_period,
                self.shutdown_rx.clone(),
                move || {
                    let sweeper = sweeper.clone();
                    async move { sweeper.run().await }
                },
            )
            .instrument(tracing::info_span!("sweeper", host = %host)),
        ));

        tasks
    }

    pub fn shutdown(&self) {
        if self.shutdown_tx.send(()).is_err() {
            error!("no synchronisation task is listening for shutdown");
        }
    }
}

/// Runs `task` now and then every `period` until shutdown. Each run is
/// spawned, so a slow run overlaps the next one instead of delaying it.
async fn run_periodically<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<()>,
    task: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut ticker = periodic(period);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!(name, "shutdown signal received, stopping timer");
                return;
            }
            _ = ticker.tick() => {
                tokio::spawn(task().in_current_span());
            }
        }
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    info!("signal received, shutting down gracefully");
    if shutdown_tx.send(()).is_err() {
        error!("no synchronisation task is listening for shutdown");
    }
}
