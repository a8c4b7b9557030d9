use std::{sync::Arc, time::Duration};

use data_model::{Container, EventAction, LifecycleEvent};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    cache_writer::CacheWriter,
    engine::ContainerEngine,
    error::SyncError,
    observer::{Observer, Operation, SyncEvent},
};

pub const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);

/// Applies one lifecycle event to the store.
pub struct EventHandler {
    engine: Arc<dyn ContainerEngine>,
    writer: Arc<CacheWriter>,
    observer: Arc<dyn Observer>,
}

impl EventHandler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        writer: Arc<CacheWriter>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            engine,
            writer,
            observer,
        }
    }

    /// Handles `event` and reports the outcome. Failures end here; the
    /// listener keeps going.
    pub async fn handle(&self, event: LifecycleEvent) {
        let operation = match event.action {
            EventAction::Destroy => Operation::DeleteContainer,
            EventAction::Start | EventAction::Restart | EventAction::Die => {
                Operation::UpsertContainer
            }
        };
        let result = match event.action {
            EventAction::Destroy => self.delete(&event).await,
            _ => self.upsert(&event).await,
        };
        match result {
            Ok(report) => self.observer.report(report),
            Err(err) => self.observer.report(SyncEvent::failed(
                operation,
                Some(event.container_id.to_string()),
                err,
            )),
        }
    }

    async fn upsert(&self, event: &LifecycleEvent) -> Result<SyncEvent, SyncError> {
        let record = self
            .engine
            .inspect_container(&event.container_id)
            .await
            .map_err(SyncError::Engine)?;
        let container = Container::from_record(record)?;
        self.writer.upsert_container(&container).await?;
        Ok(SyncEvent::ContainerUpserted {
            container: container.id,
            image: container.image,
        })
    }

    async fn delete(&self, event: &LifecycleEvent) -> Result<SyncEvent, SyncError> {
        // A destroyed container can rarely still be inspected; the image
        // written with its record is enough to clean up the indices.
        let image = match self.engine.inspect_container(&event.container_id).await {
            Ok(record) => Container::from_record(record)?.image,
            Err(err) => match self.writer.cached_image(&event.container_id).await? {
                Some(image) => {
                    debug!(
                        container = %event.container_id,
                        "inspect failed on destroy, using the stored image: {:#}", err
                    );
                    image
                }
                None => return Err(SyncError::Engine(err)),
            },
        };
        self.writer
            .delete_container(&event.container_id, &image)
            .await?;
        Ok(SyncEvent::ContainerDeleted {
            container: event.container_id.clone(),
            image,
        })
    }
}

/// Follows the engine's event stream until shutdown, handing every event to
/// its own task.
pub struct EventListener {
    engine: Arc<dyn ContainerEngine>,
    handler: Arc<EventHandler>,
    observer: Arc<dyn Observer>,
    backoff: Duration,
    shutdown_rx: watch::Receiver<()>,
}

impl EventListener {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        writer: Arc<CacheWriter>,
        observer: Arc<dyn Observer>,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        let handler = Arc::new(EventHandler::new(
            engine.clone(),
            writer,
            observer.clone(),
        ));
        Self {
            engine,
            handler,
            observer,
            backoff: RESUBSCRIBE_BACKOFF,
            shutdown_rx,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn start(&mut self) {
        loop {
            match self.engine.events().await {
                Ok(mut events) => {
                    info!("listening for container events");
                    loop {
                        tokio::select! {
                            _ = self.shutdown_rx.changed() => {
                                info!("event listener shutting down");
                                return;
                            }
                            event = events.next() => match event {
                                Some(Ok(event)) => self.dispatch(event),
                                Some(Err(err)) => {
                                    self.report_stream_failure(err);
                                    break;
                                }
                                None => {
                                    warn!("container event stream ended");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => self.report_stream_failure(err),
            }

            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    info!("event listener shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }

    fn dispatch(&self, event: LifecycleEvent) {
        debug!(action = %event.action, container = %event.container_id, "container event");
        let handler = self.handler.clone();
        tokio::spawn(async move { handler.handle(event).await });
    }

    fn report_stream_failure(&self, err: anyhow::Error) {
        self.observer.report(SyncEvent::failed(
            Operation::EventStream,
            None,
            SyncError::Engine(err),
        ));
    }
}
