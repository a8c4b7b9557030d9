use crate::{ContainerId, HostId, ImageId};

pub const LAST_UPDATE_FIELD: &str = "last_update";
pub const CONTAINERS_RUNNING_FIELD: &str = "containers_running";
/// Injected into every container hash so readers know which host owns it.
pub const HOST_FIELD: &str = "host";
/// Flattened name of the inspected record's `Image` field.
pub const IMAGE_FIELD: &str = "image";

const KEY_SEPARATOR: char = ':';

/// Namespacing for every key the mirror writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    prefix: String,
}

impl KeySchema {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push(KEY_SEPARATOR);
            key.push_str(part);
        }
        key
    }

    pub fn hosts(&self) -> String {
        self.key(&["hosts"])
    }

    pub fn host(&self, host: &HostId) -> String {
        self.key(&["hosts", host.get()])
    }

    pub fn host_containers(&self, host: &HostId) -> String {
        self.key(&["hosts", host.get(), "containers"])
    }

    pub fn containers(&self) -> String {
        self.key(&["containers"])
    }

    pub fn container(&self, container: &ContainerId) -> String {
        self.key(&["containers", container.get()])
    }

    pub fn container_json(&self, container: &ContainerId) -> String {
        self.key(&["containers", container.get(), "json"])
    }

    pub fn images(&self) -> String {
        self.key(&["images"])
    }

    pub fn image(&self, image: &ImageId) -> String {
        self.key(&["images", image.get()])
    }

    pub fn image_hosts(&self, image: &ImageId) -> String {
        self.key(&["images", image.get(), "hosts"])
    }

    pub fn image_containers(&self, image: &ImageId) -> String {
        self.key(&["images", image.get(), "containers"])
    }

    /// Default pub/sub channel for change notifications.
    pub fn events_channel(&self) -> String {
        self.key(&["events"])
    }
}
