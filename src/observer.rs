use std::sync::Arc;

use data_model::{ContainerId, ImageId};
use metrics::sync_stats;
use opentelemetry::KeyValue;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    UpsertContainer,
    DeleteContainer,
    ReconcileContainers,
    ReconcileImages,
    WriteContainer,
    WriteImage,
    Sweep,
    EventStream,
}

/// What the synchronisation engine reports as it works.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ContainerUpserted {
        container: ContainerId,
        image: ImageId,
    },
    ContainerDeleted {
        container: ContainerId,
        image: ImageId,
    },
    HostContainersReplaced {
        listed: usize,
        written: usize,
    },
    ImagesRefreshed {
        listed: usize,
        written: usize,
    },
    ContainersSwept {
        removed: usize,
    },
    Failed {
        operation: Operation,
        target: Option<String>,
        error: Arc<SyncError>,
    },
}

impl SyncEvent {
    pub fn failed(operation: Operation, target: Option<String>, error: SyncError) -> Self {
        SyncEvent::Failed {
            operation,
            target,
            error: Arc::new(error),
        }
    }
}

pub trait Observer: Send + Sync {
    fn report(&self, event: SyncEvent);
}

/// Logs every event and keeps the synchronisation counters.
pub struct LoggingObserver {
    metrics: Arc<sync_stats::Metrics>,
}

impl LoggingObserver {
    pub fn new(metrics: Arc<sync_stats::Metrics>) -> Self {
        Self { metrics }
    }
}

impl Observer for LoggingObserver {
    fn report(&self, event: SyncEvent) {
        match event {
            SyncEvent::ContainerUpserted { container, image } => {
                debug!(%container, %image, "container upserted");
                self.metrics.containers_upserted.add(1, &[]);
            }
            SyncEvent::ContainerDeleted { container, image } => {
                debug!(%container, %image, "container deleted");
                self.metrics.containers_deleted.add(1, &[]);
            }
            SyncEvent::HostContainersReplaced { listed, written } => {
                debug!(listed, written, "host container set replaced");
                self.metrics.host_refreshes.add(1, &[]);
            }
            SyncEvent::ImagesRefreshed { listed, written } => {
                debug!(listed, written, "images refreshed");
                self.metrics.images_refreshed.add(written as u64, &[]);
            }
            SyncEvent::ContainersSwept { removed } => {
                if removed > 0 {
                    info!(removed, "pruned expired containers from the global index");
                }
                self.metrics.containers_swept.add(removed as u64, &[]);
            }
            SyncEvent::Failed {
                operation,
                target,
                error,
            } => {
                error!(
                    %operation,
                    target = target.as_deref().unwrap_or_default(),
                    kind = error.kind(),
                    "synchronisation failed: {:#}",
                    error
                );
                self.metrics.sync_errors.add(
                    1,
                    &[
                        KeyValue::new("operation", operation.as_ref().to_string()),
                        KeyValue::new("kind", error.kind()),
                    ],
                );
            }
        }
    }
}

/// Re-publishes events to any number of in-process subscribers. Events sent
/// while nobody is subscribed are dropped.
pub struct BroadcastObserver {
    tx: broadcast::Sender<SyncEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Observer for BroadcastObserver {
    fn report(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

/// Fans one event out to several observers, in order.
pub struct Observers(Vec<Arc<dyn Observer>>);

impl Observers {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self(observers)
    }
}

impl Observer for Observers {
    fn report(&self, event: SyncEvent) {
        for observer in &self.0 {
            observer.report(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_reaches_every_subscriber() {
        let broadcast = Arc::new(BroadcastObserver::new(8));
        let mut rx = broadcast.subscribe();
        let logging: Arc<dyn Observer> =
            Arc::new(LoggingObserver::new(Arc::new(sync_stats::Metrics::new())));
        let fan_out: Arc<dyn Observer> = broadcast.clone();
        let observers = Observers::new(vec![logging, fan_out]);

        observers.report(SyncEvent::ContainersSwept { removed: 2 });
        observers.report(SyncEvent::failed(
            Operation::Sweep,
            None,
            SyncError::Store(kv_store::Error::Rejected {
                key: "p:containers".to_string(),
            }),
        ));

        assert!(matches!(
            rx.recv().await.unwrap(),
            SyncEvent::ContainersSwept { removed: 2 }
        ));
        match rx.recv().await.unwrap() {
            SyncEvent::Failed {
                operation, error, ..
            } => {
                assert_eq!(operation, Operation::Sweep);
                assert_eq!(error.kind(), "store");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        BroadcastObserver::new(1).report(SyncEvent::ContainersSwept { removed: 0 });
    }
}
