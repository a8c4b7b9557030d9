use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{
    keys::{CONTAINERS_RUNNING_FIELD, LAST_UPDATE_FIELD},
    test_objects::tests::{mock_container_record, TEST_HOST, TEST_PREFIX},
    ContainerId,
    EventAction,
    Image,
    LifecycleEvent,
};
use kv_store::{InMemoryStore, KvStore};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::MirrorConfig,
    engine::{ContainerEngine, EventStream},
    observer::SyncEvent,
    service::Service,
};

#[derive(Default)]
struct EngineState {
    containers: BTreeMap<ContainerId, Value>,
    images: Vec<Value>,
    uninspectable: HashSet<ContainerId>,
    listing_fails: bool,
    failed_subscriptions: usize,
}

/// A scripted container engine.
///
/// Containers are added and removed by hand and events are pushed to every
/// open event stream. `None` on the event channel ends the streams, like an
/// engine restart would.
pub struct FakeEngine {
    state: Mutex<EngineState>,
    events: broadcast::Sender<Option<LifecycleEvent>>,
    subscriptions: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(EngineState::default()),
            events,
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub fn run_container(&self, id: &str, image: &str) {
        self.put_container(mock_container_record(id, image, true));
    }

    pub fn stop_container(&self, id: &str, image: &str) {
        self.put_container(mock_container_record(id, image, false));
    }

    pub fn put_container(&self, record: Value) {
        let id = record
            .get("Id")
            .or_else(|| record.get("ID"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(ContainerId::new(id), record);
    }

    pub fn remove_container(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .containers
            .remove(&ContainerId::from(id));
    }

    pub fn add_image(&self, image: Image) {
        self.state.lock().unwrap().images.push(image.record);
    }

    pub fn add_image_record(&self, record: Value) {
        self.state.lock().unwrap().images.push(record);
    }

    /// Inspecting `id` fails even while it is listed.
    pub fn break_inspect(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .uninspectable
            .insert(ContainerId::from(id));
    }

    pub fn break_listing(&self) {
        self.state.lock().unwrap().listing_fails = true;
    }

    /// The next `count` subscriptions to the event stream fail.
    pub fn fail_subscriptions(&self, count: usize) {
        self.state.lock().unwrap().failed_subscriptions = count;
    }

    pub fn emit(&self, action: EventAction, id: &str) {
        let _ = self.events.send(Some(LifecycleEvent {
            action,
            container_id: ContainerId::from(id),
        }));
    }

    pub fn end_event_streams(&self) {
        let _ = self.events.send(None);
    }

    /// Successful subscriptions so far.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub async fn wait_for_subscriptions(&self, count: usize) {
        while self.subscriptions() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_containers(&self) -> Result<Vec<ContainerId>> {
        let state = self.state.lock().unwrap();
        if state.listing_fails {
            return Err(anyhow!("engine listing unavailable"));
        }
        Ok(state.containers.keys().cloned().collect())
    }

    async fn inspect_container(&self, container: &ContainerId) -> Result<Value> {
        let state = self.state.lock().unwrap();
        if state.uninspectable.contains(container) {
            return Err(anyhow!("inspect of {} timed out", container));
        }
        state
            .containers
            .get(container)
            .cloned()
            .ok_or_else(|| anyhow!("no such container: {}", container))
    }

    async fn list_images(&self) -> Result<Vec<Value>> {
        let state = self.state.lock().unwrap();
        if state.listing_fails {
            return Err(anyhow!("engine listing unavailable"));
        }
        Ok(state.images.clone())
    }

    async fn events(&self) -> Result<EventStream> {
        {
            let mut state = self.state.lock().unwrap();
            if state.failed_subscriptions > 0 {
                state.failed_subscriptions -= 1;
                return Err(anyhow!("engine event endpoint unavailable"));
            }
        }
        let mut rx = self.events.subscribe();
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(async_stream::stream! {
            while let Ok(Some(event)) = rx.recv().await {
                yield Ok(event);
            }
        }))
    }
}

pub fn test_config() -> MirrorConfig {
    MirrorConfig {
        host_id: TEST_HOST.to_string(),
        key_prefix: TEST_PREFIX.to_string(),
        update_interval_secs: 60,
        expire_interval_secs: Some(30),
        image_update_interval_secs: 600,
        sweep_jitter_secs: 0,
        reconcile_concurrency: 4,
        ..Default::default()
    }
}

pub struct TestService {
    pub service: Service,
    pub store: Arc<InMemoryStore>,
    pub engine: Arc<FakeEngine>,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: MirrorConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let store = Arc::new(InMemoryStore::new());
        let engine = Arc::new(FakeEngine::new());
        let service = Service::with_components(config, store.clone(), engine.clone())?;

        Ok(Self {
            service,
            store,
            engine,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.service.events.subscribe()
    }

    pub async fn members(&self, key: &str) -> Vec<String> {
        let mut members = self.store.smembers(key).await.unwrap_or_default();
        members.sort();
        members
    }

    /// Every live key with its value, without the fields that change on
    /// every write (timestamps and running counters).
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        let mut snapshot = BTreeMap::new();
        for key in self.store.keys().await {
            let value = if let Ok(fields) = self.store.hgetall(&key).await {
                let fields: BTreeMap<String, String> = fields
                    .into_iter()
                    .filter(|(field, _)| {
                        field != LAST_UPDATE_FIELD && field != CONTAINERS_RUNNING_FIELD
                    })
                    .collect();
                format!("{:?}", fields)
            } else if let Ok(mut members) = self.store.smembers(&key).await {
                members.sort();
                format!("{:?}", members)
            } else {
                format!("{:?}", self.store.get(&key).await.ok().flatten())
            };
            snapshot.insert(key, value);
        }
        snapshot
    }

    pub async fn host_fields(&self) -> HashMap<String, String> {
        self.store
            .hgetall(&self.service.writer.keys().host(self.service.writer.host()))
            .await
            .unwrap_or_default()
    }
}
