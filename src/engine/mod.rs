use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{ContainerId, LifecycleEvent};
use futures::Stream;
use serde_json::Value;

pub mod docker;

pub use docker::DockerEngine;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<LifecycleEvent>> + Send>>;

/// The container engine running on this host.
///
/// Inspected records come back untyped; shaping them into
/// [`data_model::Container`] and [`data_model::Image`] is left to the caller
/// so a malformed record is reported as such rather than as an engine error.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerId>>;

    async fn inspect_container(&self, container: &ContainerId) -> Result<Value>;

    async fn list_images(&self) -> Result<Vec<Value>>;

    /// Container lifecycle events the mirror reacts to. The stream ends or
    /// yields an error when the engine connection drops.
    async fn events(&self) -> Result<EventStream>;
}
