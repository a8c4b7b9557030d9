use std::sync::Arc;

use data_model::{Container, ContainerId, Image};
use futures::{stream, StreamExt};
use metrics::{sync_stats, Timer};
use opentelemetry::KeyValue;
use tracing::info;

use crate::{
    cache_writer::CacheWriter,
    engine::ContainerEngine,
    error::SyncError,
    observer::{Observer, Operation, SyncEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub listed: usize,
    pub written: usize,
    pub failed: usize,
}

impl ReconcileReport {
    fn new(listed: usize, written: usize) -> Self {
        Self {
            listed,
            written,
            failed: listed - written,
        }
    }
}

/// Rewrites the host's full state from the engine's listings.
pub struct Reconciler {
    engine: Arc<dyn ContainerEngine>,
    writer: Arc<CacheWriter>,
    observer: Arc<dyn Observer>,
    metrics: Arc<sync_stats::Metrics>,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        writer: Arc<CacheWriter>,
        observer: Arc<dyn Observer>,
        metrics: Arc<sync_stats::Metrics>,
        concurrency: usize,
    ) -> Self {
        Self {
            engine,
            writer,
            observer,
            metrics,
            concurrency: concurrency.max(1),
        }
    }

    /// Writes every listed container, then makes the host's container set
    /// exactly the listing, whether or not every write succeeded.
    pub async fn reconcile_containers(&self) -> Result<ReconcileReport, SyncError> {
        let _timer = Timer::start_with_labels(
            &self.metrics.reconcile_duration,
            &[KeyValue::new("pass", "containers")],
        );
        let containers = self
            .engine
            .list_containers()
            .await
            .map_err(SyncError::Engine)?;

        let written = stream::iter(containers.iter().cloned())
            .map(|container| self.sync_container(container))
            .buffer_unordered(self.concurrency)
            .filter(|written| futures::future::ready(*written))
            .count()
            .await;

        self.writer.replace_host_container_set(&containers).await?;

        let report = ReconcileReport::new(containers.len(), written);
        self.observer.report(SyncEvent::HostContainersReplaced {
            listed: report.listed,
            written: report.written,
        });
        Ok(report)
    }

    async fn sync_container(&self, container: ContainerId) -> bool {
        let result = async {
            let record = self
                .engine
                .inspect_container(&container)
                .await
                .map_err(SyncError::Engine)?;
            let container = Container::from_record(record)?;
            self.writer.write_container(&container).await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(err) => {
                self.observer.report(SyncEvent::failed(
                    Operation::WriteContainer,
                    Some(container.to_string()),
                    err,
                ));
                false
            }
        }
    }

    /// Rewrites the hash of every image the engine lists.
    pub async fn reconcile_images(&self) -> Result<ReconcileReport, SyncError> {
        let _timer = Timer::start_with_labels(
            &self.metrics.reconcile_duration,
            &[KeyValue::new("pass", "images")],
        );
        let images = self.engine.list_images().await.map_err(SyncError::Engine)?;
        let listed = images.len();

        let written = stream::iter(images)
            .map(|record| self.sync_image(record))
            .buffer_unordered(self.concurrency)
            .filter(|written| futures::future::ready(*written))
            .count()
            .await;

        let report = ReconcileReport::new(listed, written);
        self.observer.report(SyncEvent::ImagesRefreshed {
            listed: report.listed,
            written: report.written,
        });
        Ok(report)
    }

    async fn sync_image(&self, record: serde_json::Value) -> bool {
        let target = record.get("Id").and_then(|id| id.as_str()).map(str::to_string);
        let result = async {
            let image = Image::from_record(record)?;
            self.writer.write_image(&image).await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(err) => {
                self.observer
                    .report(SyncEvent::failed(Operation::WriteImage, target, err));
                false
            }
        }
    }

    /// One container pass, for the timer. Failures are reported, not returned.
    pub async fn run_containers(&self) {
        match self.reconcile_containers().await {
            Ok(report) => info!(
                listed = report.listed,
                failed = report.failed,
                "reconciled containers"
            ),
            Err(err) => self.observer.report(SyncEvent::failed(
                Operation::ReconcileContainers,
                None,
                err,
            )),
        }
    }

    /// One image pass, for the timer. Failures are reported, not returned.
    pub async fn run_images(&self) {
        match self.reconcile_images().await {
            Ok(report) => info!(
                listed = report.listed,
                failed = report.failed,
                "reconciled images"
            ),
            Err(err) => {
                self.observer
                    .report(SyncEvent::failed(Operation::ReconcileImages, None, err))
            }
        }
    }
}
