use std::sync::Arc;

use data_model::{ContainerId, KeySchema};
use futures::{stream, StreamExt, TryStreamExt};
use kv_store::KvStore;
use tracing::debug;

use crate::{
    error::SyncError,
    observer::{Observer, Operation, SyncEvent},
};

/// Prunes ids from the global container set once their record has expired.
///
/// Per-host and per-image sets are left to reconciliation and their own TTLs.
pub struct Sweeper {
    store: Arc<dyn KvStore>,
    keys: KeySchema,
    observer: Arc<dyn Observer>,
    concurrency: usize,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: KeySchema,
        observer: Arc<dyn Observer>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            keys,
            observer,
            concurrency: concurrency.max(1),
        }
    }

    /// Returns how many ids were removed.
    pub async fn sweep(&self) -> Result<usize, SyncError> {
        let containers_key = self.keys.containers();
        let members = self.store.smembers(&containers_key).await?;

        let removed = stream::iter(members)
            .map(|member| self.prune(&containers_key, ContainerId::new(member)))
            .buffer_unordered(self.concurrency)
            .try_fold(0, |removed, pruned| async move {
                Ok(removed + usize::from(pruned))
            })
            .await?;

        self.observer.report(SyncEvent::ContainersSwept { removed });
        Ok(removed)
    }

    async fn prune(&self, containers_key: &str, container: ContainerId) -> Result<bool, SyncError> {
        if self.store.exists(&self.keys.container(&container)).await? {
            return Ok(false);
        }
        let removed = self.store.srem(containers_key, container.get()).await?;
        if removed {
            debug!(%container, "pruned expired container");
        }
        Ok(removed)
    }

    /// One sweep, for the timer. Failures are reported, not returned.
    pub async fn run(&self) {
        if let Err(err) = self.sweep().await {
            self.observer
                .report(SyncEvent::failed(Operation::Sweep, None, err));
        }
    }
}
