use std::{collections::HashMap, sync::Arc, time::Duration};

use data_model::{
    keys::{CONTAINERS_RUNNING_FIELD, HOST_FIELD, IMAGE_FIELD, LAST_UPDATE_FIELD},
    Container,
    ContainerId,
    EncodedRecord,
    HostId,
    HostStatus,
    Image,
    ImageId,
    KeySchema,
    Notification,
};
use kv_store::{KvStore, Transaction};
use metrics::{sync_stats, Timer};
use mirror_utils::get_epoch_time_in_ms;
use serde_json::Value;
use tracing::debug;

use crate::{config::MirrorConfig, error::SyncError, notifier::NotificationPublisher};

/// Writes container and image records, and every index over them, for one
/// host.
///
/// Each operation is a short sequence of atomic batches. A failed batch ends
/// the operation and is returned; batches already applied stay applied.
pub struct CacheWriter {
    store: Arc<dyn KvStore>,
    keys: KeySchema,
    host: HostId,
    ttl: Duration,
    image_ttl: Duration,
    notifier: NotificationPublisher,
    metrics: Arc<sync_stats::Metrics>,
}

impl CacheWriter {
    pub fn new(
        store: Arc<dyn KvStore>,
        config: &MirrorConfig,
        metrics: Arc<sync_stats::Metrics>,
    ) -> Self {
        let notifier = NotificationPublisher::new(store.clone(), config.events_channel());
        Self {
            store,
            keys: config.key_schema(),
            host: config.host(),
            ttl: config.ttl(),
            image_ttl: config.image_ttl(),
            notifier,
            metrics,
        }
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    pub fn keys(&self) -> &KeySchema {
        &self.keys
    }

    pub fn notifier(&self) -> &NotificationPublisher {
        &self.notifier
    }

    async fn exec(&self, txn: Transaction) -> Result<(), SyncError> {
        let _timer = Timer::start(&self.metrics.store_writes);
        self.store.exec(txn).await?;
        Ok(())
    }

    /// Replaces the container's hash and blob and adds it to every index.
    fn container_batch(&self, container: &Container) -> Result<Transaction, SyncError> {
        let mut encoded = EncodedRecord::encode(&container.record)?;
        encoded
            .fields
            .insert(HOST_FIELD.to_string(), self.host.to_string());

        let container_key = self.keys.container(&container.id);
        let json_key = self.keys.container_json(&container.id);
        let host_containers_key = self.keys.host_containers(&self.host);
        let images_key = self.keys.images();
        let image_hosts_key = self.keys.image_hosts(&container.image);
        let image_containers_key = self.keys.image_containers(&container.image);

        let mut txn = Transaction::new();
        txn.del(&container_key)
            .hset_multiple(&container_key, encoded.field_pairs())
            .expire(&container_key, self.ttl)
            .del(&json_key)
            .set(&json_key, encoded.blob)
            .expire(&json_key, self.ttl)
            .sadd(self.keys.containers(), [container.id.get()])
            .sadd(&host_containers_key, [container.id.get()])
            .expire(&host_containers_key, self.ttl)
            .sadd(&images_key, [container.image.get()])
            .expire(&images_key, self.image_ttl)
            .sadd(&image_hosts_key, [self.host.get()])
            .expire(&image_hosts_key, self.image_ttl)
            .sadd(&image_containers_key, [container.id.get()])
            .expire(&image_containers_key, self.image_ttl);
        Ok(txn)
    }

    /// Refreshes the host record, moving its running counter by `delta`.
    async fn refresh_host(&self, delta: i64) -> Result<(), SyncError> {
        let host_key = self.keys.host(&self.host);
        let mut txn = Transaction::new();
        if delta != 0 {
            txn.hincr_by(&host_key, CONTAINERS_RUNNING_FIELD, delta);
        }
        txn.hset(
            &host_key,
            LAST_UPDATE_FIELD,
            get_epoch_time_in_ms().to_string(),
        )
        .expire(&host_key, self.ttl);
        self.exec(txn).await
    }

    /// Upsert driven by a lifecycle event: writes the record, counts it
    /// against its image and host, and announces it.
    pub async fn upsert_container(&self, container: &Container) -> Result<(), SyncError> {
        let image_key = self.keys.image(&container.image);
        let mut txn = self.container_batch(container)?;
        txn.hincr_by(&image_key, CONTAINERS_RUNNING_FIELD, 1)
            .expire(&image_key, self.image_ttl);
        self.exec(txn).await?;

        self.refresh_host(1).await?;
        self.notifier
            .publish(&Notification::new_container(&self.host, &container.id))
            .await?;
        debug!(container = %container.id, image = %container.image, "upserted container");
        Ok(())
    }

    /// Record-only upsert used by reconciliation. Counters are untouched and
    /// nothing is announced; the pass ends with one `refresh_containers`.
    pub async fn write_container(&self, container: &Container) -> Result<(), SyncError> {
        let txn = self.container_batch(container)?;
        self.exec(txn).await
    }

    pub async fn delete_container(
        &self,
        container: &ContainerId,
        image: &ImageId,
    ) -> Result<(), SyncError> {
        let mut txn = Transaction::new();
        txn.del(self.keys.container(container))
            .del(self.keys.container_json(container))
            .srem(self.keys.host_containers(&self.host), [container.get()])
            .srem(self.keys.image_hosts(image), [self.host.get()])
            .srem(self.keys.image_containers(image), [container.get()])
            .hincr_by(self.keys.host(&self.host), CONTAINERS_RUNNING_FIELD, -1);
        self.exec(txn).await?;

        self.refresh_host(0).await?;
        self.notifier
            .publish(&Notification::delete_container(&self.host, container))
            .await?;
        debug!(%container, %image, "deleted container");
        Ok(())
    }

    /// Makes the per-host container set exactly `containers` and registers
    /// the host.
    pub async fn replace_host_container_set(
        &self,
        containers: &[ContainerId],
    ) -> Result<(), SyncError> {
        let host_containers_key = self.keys.host_containers(&self.host);
        let host_key = self.keys.host(&self.host);
        let hosts_key = self.keys.hosts();

        let mut txn = Transaction::new();
        txn.del(&host_containers_key)
            .sadd(&host_containers_key, containers.iter().map(ContainerId::get))
            .expire(&host_containers_key, self.ttl)
            .hset(
                &host_key,
                LAST_UPDATE_FIELD,
                get_epoch_time_in_ms().to_string(),
            )
            .expire(&host_key, self.ttl)
            .sadd(&hosts_key, [self.host.get()])
            .expire(&hosts_key, self.ttl);
        self.exec(txn).await?;

        self.notifier
            .publish(&Notification::refresh_containers(&self.host))
            .await?;
        debug!(containers = containers.len(), "replaced host container set");
        Ok(())
    }

    /// Writes an image's fields over its hash, keeping the running counter.
    pub async fn write_image(&self, image: &Image) -> Result<(), SyncError> {
        let encoded = EncodedRecord::encode(&image.record)?;
        let image_key = self.keys.image(&image.id);
        let images_key = self.keys.images();

        let mut txn = Transaction::new();
        txn.hset_multiple(&image_key, encoded.field_pairs())
            .expire(&image_key, self.image_ttl)
            .sadd(&images_key, [image.id.get()])
            .expire(&images_key, self.image_ttl);
        self.exec(txn).await
    }

    pub async fn container_fields(
        &self,
        container: &ContainerId,
    ) -> Result<HashMap<String, String>, SyncError> {
        Ok(self.store.hgetall(&self.keys.container(container)).await?)
    }

    pub async fn container_blob(&self, container: &ContainerId) -> Result<Option<Value>, SyncError> {
        let Some(blob) = self.store.get(&self.keys.container_json(container)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&blob).map_err(data_model::Error::from)?;
        Ok(Some(record))
    }

    /// Image of a container as last written by this mirror.
    pub async fn cached_image(&self, container: &ContainerId) -> Result<Option<ImageId>, SyncError> {
        let image = self
            .store
            .hget(&self.keys.container(container), IMAGE_FIELD)
            .await?;
        Ok(image.map(ImageId::new))
    }

    pub async fn host_status(&self) -> Result<HostStatus, SyncError> {
        let fields = self.store.hgetall(&self.keys.host(&self.host)).await?;
        Ok(HostStatus::from_fields(&fields))
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        flatten,
        test_objects::tests::{mock_container, mock_image, TEST_HOST, TEST_IMAGE, TEST_PREFIX},
    };
    use futures::StreamExt;
    use kv_store::InMemoryStore;

    use super::*;

    fn test_config() -> MirrorConfig {
        MirrorConfig {
            host_id: TEST_HOST.to_string(),
            key_prefix: TEST_PREFIX.to_string(),
            ..Default::default()
        }
    }

    fn writer(store: Arc<InMemoryStore>) -> CacheWriter {
        CacheWriter::new(store, &test_config(), Arc::new(sync_stats::Metrics::new()))
    }

    async fn members(store: &InMemoryStore, key: &str) -> Vec<String> {
        let mut members = store.smembers(key).await.unwrap();
        members.sort();
        members
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_container_writes_every_index() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());
        let mut notifications = writer.notifier().subscribe().await.unwrap();
        let container = mock_container("c1", TEST_IMAGE);

        writer.upsert_container(&container).await.unwrap();

        assert_eq!(members(&store, "test:containers").await, vec!["c1"]);
        assert_eq!(members(&store, "test:hosts:h1:containers").await, vec!["c1"]);
        assert_eq!(members(&store, "test:images").await, vec![TEST_IMAGE]);
        assert_eq!(members(&store, "test:images:img1:hosts").await, vec!["h1"]);
        assert_eq!(members(&store, "test:images:img1:containers").await, vec!["c1"]);
        assert_eq!(
            store.hget("test:images:img1", "containers_running").await.unwrap(),
            Some("1".to_string())
        );

        let fields = writer.container_fields(&container.id).await.unwrap();
        assert_eq!(fields.get("host").map(String::as_str), Some("h1"));
        assert_eq!(fields.get("state_running").map(String::as_str), Some("true"));
        assert_eq!(
            writer.container_blob(&container.id).await.unwrap(),
            Some(container.record.clone())
        );

        let status = writer.host_status().await.unwrap();
        assert_eq!(status.containers_running, 1);
        assert!(status.last_update.is_some());

        assert_eq!(
            store.ttl("test:containers:c1").await,
            Some(Duration::from_secs(180))
        );
        assert_eq!(
            store.ttl("test:containers:c1:json").await,
            Some(Duration::from_secs(180))
        );
        assert_eq!(
            store.ttl("test:images:img1:containers").await,
            Some(Duration::from_secs(2700))
        );
        assert_eq!(store.ttl("test:containers").await, None);

        assert_eq!(
            notifications.next().await.unwrap().to_string(),
            "new_container:h1:c1"
        );
    }

    #[tokio::test]
    async fn test_upsert_replaces_stale_fields() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());
        store
            .exec({
                let mut txn = Transaction::new();
                txn.hset("test:containers:c1", "legacy_field", "x");
                txn
            })
            .await
            .unwrap();

        let container = mock_container("c1", TEST_IMAGE);
        writer.write_container(&container).await.unwrap();

        let fields = writer.container_fields(&container.id).await.unwrap();
        assert!(!fields.contains_key("legacy_field"));
        let mut expected = flatten(&container.record);
        expected.insert("host".to_string(), "h1".to_string());
        assert_eq!(fields, expected.into_iter().collect::<HashMap<_, _>>());
    }

    #[tokio::test]
    async fn test_write_container_leaves_counters() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());
        writer
            .write_container(&mock_container("c1", TEST_IMAGE))
            .await
            .unwrap();

        assert_eq!(
            store.hget("test:images:img1", "containers_running").await.unwrap(),
            None
        );
        assert_eq!(writer.host_status().await.unwrap(), HostStatus::default());
        assert_eq!(members(&store, "test:containers").await, vec!["c1"]);
    }

    #[tokio::test]
    async fn test_delete_container() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());
        let c1 = mock_container("c1", TEST_IMAGE);
        let c2 = mock_container("c2", TEST_IMAGE);
        writer.upsert_container(&c1).await.unwrap();
        writer.upsert_container(&c2).await.unwrap();
        let mut notifications = writer.notifier().subscribe().await.unwrap();

        writer.delete_container(&c1.id, &c1.image).await.unwrap();

        assert!(!store.exists("test:containers:c1").await.unwrap());
        assert!(!store.exists("test:containers:c1:json").await.unwrap());
        assert_eq!(members(&store, "test:hosts:h1:containers").await, vec!["c2"]);
        assert_eq!(members(&store, "test:images:img1:containers").await, vec!["c2"]);
        assert!(members(&store, "test:images:img1:hosts").await.is_empty());
        assert_eq!(writer.host_status().await.unwrap().containers_running, 1);
        assert_eq!(
            notifications.next().await.unwrap().to_string(),
            "delete_container:h1:c1"
        );
    }

    #[tokio::test]
    async fn test_rejected_record_batch_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());
        let mut notifications = writer.notifier().subscribe().await.unwrap();
        store.reject_writes_to("test:hosts:h1").await;

        let err = writer
            .upsert_container(&mock_container("c1", TEST_IMAGE))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));

        // The per-host set shares the rejected prefix, so the record batch
        // failed as a whole and nothing after it ran.
        assert!(store.keys().await.is_empty());
        store.accept_all_writes().await;
        writer
            .replace_host_container_set(&[ContainerId::from("c9")])
            .await
            .unwrap();
        assert_eq!(
            notifications.next().await.unwrap().to_string(),
            "refresh_containers:h1"
        );
    }

    async fn seed_plain_host_key(store: &InMemoryStore) {
        let mut txn = Transaction::new();
        txn.set("test:hosts:h1", "stale");
        store.exec(txn).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_host_refresh_stops_upsert() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());
        seed_plain_host_key(&store).await;
        let mut notifications = writer.notifier().subscribe().await.unwrap();

        let err = writer
            .upsert_container(&mock_container("c1", TEST_IMAGE))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Store(kv_store::Error::WrongType { .. })
        ));

        // the record batch was applied before the host refresh failed
        assert!(store.exists("test:containers:c1").await.unwrap());
        assert_eq!(members(&store, "test:hosts:h1:containers").await, vec!["c1"]);
        assert_eq!(
            store.get("test:hosts:h1").await.unwrap(),
            Some("stale".to_string())
        );

        // the next message on the topic is ours, so nothing was announced
        writer
            .notifier()
            .publish(&Notification::refresh_containers(writer.host()))
            .await
            .unwrap();
        assert_eq!(
            notifications.next().await.unwrap().to_string(),
            "refresh_containers:h1"
        );
    }

    #[tokio::test]
    async fn test_failed_host_update_stops_delete() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());
        let container = mock_container("c1", TEST_IMAGE);
        writer.write_container(&container).await.unwrap();
        seed_plain_host_key(&store).await;
        let mut notifications = writer.notifier().subscribe().await.unwrap();

        let err = writer
            .delete_container(&container.id, &container.image)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Store(kv_store::Error::WrongType { .. })
        ));
        assert_eq!(
            store.get("test:hosts:h1").await.unwrap(),
            Some("stale".to_string())
        );

        writer
            .notifier()
            .publish(&Notification::refresh_containers(writer.host()))
            .await
            .unwrap();
        assert_eq!(
            notifications.next().await.unwrap().to_string(),
            "refresh_containers:h1"
        );
    }

    #[tokio::test]
    async fn test_notification_round_trips_host_identity() {
        let store = Arc::new(InMemoryStore::new());
        let config = MirrorConfig {
            host_id: "rack1.node7".to_string(),
            ..test_config()
        };
        config.validate().unwrap();
        let writer = CacheWriter::new(store, &config, Arc::new(sync_stats::Metrics::new()));
        let mut notifications = writer.notifier().subscribe().await.unwrap();

        writer
            .upsert_container(&mock_container("c1", TEST_IMAGE))
            .await
            .unwrap();

        let notification = notifications.next().await.unwrap();
        assert_eq!(notification.host, HostId::from("rack1.node7"));
        assert_eq!(notification.container, Some(ContainerId::from("c1")));
        assert_eq!(notification.to_string(), "new_container:rack1.node7:c1");
    }

    #[tokio::test]
    async fn test_replace_host_container_set() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());
        writer
            .replace_host_container_set(&[ContainerId::from("a"), ContainerId::from("b")])
            .await
            .unwrap();
        writer
            .replace_host_container_set(&[ContainerId::from("b"), ContainerId::from("c")])
            .await
            .unwrap();

        assert_eq!(members(&store, "test:hosts:h1:containers").await, vec!["b", "c"]);
        assert_eq!(members(&store, "test:hosts").await, vec!["h1"]);
        assert!(writer.host_status().await.unwrap().last_update.is_some());

        writer.replace_host_container_set(&[]).await.unwrap();
        assert!(!store.exists("test:hosts:h1:containers").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_image_keeps_counter() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());
        writer
            .upsert_container(&mock_container("c1", TEST_IMAGE))
            .await
            .unwrap();

        writer.write_image(&mock_image(TEST_IMAGE)).await.unwrap();

        let fields = store.hgetall("test:images:img1").await.unwrap();
        assert_eq!(fields.get("containers_running").map(String::as_str), Some("1"));
        assert_eq!(fields.get("size").map(String::as_str), Some("1024"));
        assert_eq!(fields.get("labels_maintainer").map(String::as_str), Some("ops"));
        assert_eq!(
            store.ttl("test:images:img1").await,
            Some(Duration::from_secs(2700))
        );
    }

    #[tokio::test]
    async fn test_cached_image() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());
        let container = mock_container("c1", TEST_IMAGE);
        assert_eq!(writer.cached_image(&container.id).await.unwrap(), None);
        writer.write_container(&container).await.unwrap();
        assert_eq!(
            writer.cached_image(&container.id).await.unwrap(),
            Some(ImageId::from(TEST_IMAGE))
        );
    }
}
