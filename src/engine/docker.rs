use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    models::{EventMessage, EventMessageTypeEnum},
    query_parameters::{
        EventsOptions,
        InspectContainerOptions,
        ListContainersOptions,
        ListImagesOptions,
    },
    Docker as DockerClient,
};
use data_model::{ContainerId, EventAction, LifecycleEvent};
use futures::StreamExt;
use serde_json::Value;
use tracing::trace;

use super::{ContainerEngine, EventStream};

const SOCKET_TIMEOUT_SECS: u64 = 120;

pub struct DockerEngine {
    client: DockerClient,
}

impl DockerEngine {
    pub fn connect(socket: Option<&str>) -> Result<Self> {
        let client = match socket {
            Some(path) => {
                DockerClient::connect_with_socket(path, SOCKET_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => DockerClient::connect_with_local_defaults(),
        }
        .context("Failed to connect to Docker daemon")?;
        Ok(Self { client })
    }

    /// Maps a raw engine event to the lifecycle event the mirror handles, if
    /// it is one.
    fn lifecycle_event(message: EventMessage) -> Option<LifecycleEvent> {
        if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
            return None;
        }
        let action = message.action?.parse::<EventAction>().ok()?;
        let container_id = message.actor?.id?;
        Some(LifecycleEvent {
            action,
            container_id: ContainerId::new(container_id),
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_containers(&self) -> Result<Vec<ContainerId>> {
        let containers = self
            .client
            .list_containers(None::<ListContainersOptions>)
            .await
            .context("Failed to list containers")?;
        Ok(containers
            .into_iter()
            .filter_map(|summary| summary.id)
            .map(ContainerId::new)
            .collect())
    }

    async fn inspect_container(&self, container: &ContainerId) -> Result<Value> {
        let details = self
            .client
            .inspect_container(container.get(), None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("Failed to inspect container {}", container))?;
        serde_json::to_value(details)
            .with_context(|| format!("Failed to serialize container {}", container))
    }

    async fn list_images(&self) -> Result<Vec<Value>> {
        let images = self
            .client
            .list_images(None::<ListImagesOptions>)
            .await
            .context("Failed to list images")?;
        images
            .into_iter()
            .map(|image| serde_json::to_value(image).context("Failed to serialize image"))
            .collect()
    }

    async fn events(&self) -> Result<EventStream> {
        let client = self.client.clone();
        let options = EventsOptions {
            filters: Some(HashMap::from([(
                "type".to_string(),
                vec!["container".to_string()],
            )])),
            ..Default::default()
        };
        let events = async_stream::stream! {
            let mut messages = client.events(Some(options));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(message) => {
                        trace!(action = ?message.action, "engine event");
                        if let Some(event) = Self::lifecycle_event(message) {
                            yield Ok(event);
                        }
                    }
                    Err(err) => {
                        yield Err(anyhow::Error::new(err).context("Docker event stream failed"));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use bollard::models::EventActor;

    use super::*;

    fn message(typ: EventMessageTypeEnum, action: &str, id: &str) -> EventMessage {
        EventMessage {
            typ: Some(typ),
            action: Some(action.to_string()),
            actor: Some(EventActor {
                id: Some(id.to_string()),
                attributes: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_lifecycle_event_mapping() {
        let event =
            DockerEngine::lifecycle_event(message(EventMessageTypeEnum::CONTAINER, "die", "c1"))
                .unwrap();
        assert_eq!(event.action, EventAction::Die);
        assert_eq!(event.container_id.get(), "c1");

        assert!(DockerEngine::lifecycle_event(message(
            EventMessageTypeEnum::CONTAINER,
            "exec_start: sh",
            "c1"
        ))
        .is_none());
        assert!(DockerEngine::lifecycle_event(message(
            EventMessageTypeEnum::IMAGE,
            "destroy",
            "sha256:abc"
        ))
        .is_none());
    }
}
