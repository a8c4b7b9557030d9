pub mod codec;
pub mod keys;
pub mod test_objects;

use std::{
    collections::HashMap,
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use codec::{flatten, EncodedRecord};
pub use keys::KeySchema;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("record is missing the string field {}", field)]
    MissingField { field: &'static str },

    #[error("record is not an object")]
    NotAnObject,

    #[error("failed to encode record blob. error: {}", source)]
    BlobEncodeFailed {
        #[from]
        source: serde_json::Error,
    },

    #[error("malformed notification: {}", message)]
    MalformedNotification { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HostId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ImageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

fn string_field<'a>(record: &'a Value, field: &'static str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

/// A container as reported by the engine's inspect call.
///
/// `record` is the complete inspected document; the id and image are lifted
/// out of it so the writer never has to look them up again.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: ContainerId,
    pub image: ImageId,
    pub record: Value,
}

impl Container {
    /// Builds a container from an inspected record. Engines disagree on the
    /// spelling of the id field (`Id` vs `ID`); the record is normalised so
    /// that `Id` is always present.
    pub fn from_record(mut record: Value) -> Result<Self, Error> {
        let Some(object) = record.as_object_mut() else {
            return Err(Error::NotAnObject);
        };
        let id = match object.get("Id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = object
                    .get("ID")
                    .and_then(Value::as_str)
                    .ok_or(Error::MissingField { field: "Id" })?
                    .to_string();
                object.insert("Id".to_string(), Value::String(id.clone()));
                id
            }
        };
        let image = string_field(&record, "Image")
            .ok_or(Error::MissingField { field: "Image" })?
            .to_string();

        Ok(Self {
            id: ContainerId::new(id),
            image: ImageId::new(image),
            record,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub id: ImageId,
    pub record: Value,
}

impl Image {
    pub fn from_record(record: Value) -> Result<Self, Error> {
        if !record.is_object() {
            return Err(Error::NotAnObject);
        }
        let id = string_field(&record, "Id")
            .ok_or(Error::MissingField { field: "Id" })?
            .to_string();
        Ok(Self {
            id: ImageId::new(id),
            record,
        })
    }
}

/// The bookkeeping hash kept per host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStatus {
    pub last_update: Option<u64>,
    pub containers_running: i64,
}

impl HostStatus {
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            last_update: fields
                .get(keys::LAST_UPDATE_FIELD)
                .and_then(|v| v.parse().ok()),
            containers_running: fields
                .get(keys::CONTAINERS_RUNNING_FIELD)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        }
    }
}

/// Container lifecycle actions the mirror reacts to. Any other engine action
/// fails to parse and is ignored by the listener.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum EventAction {
    Start,
    Restart,
    Die,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub action: EventAction,
    pub container_id: ContainerId,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum NotificationKind {
    NewContainer,
    DeleteContainer,
    RefreshContainers,
}

/// A change event published on the shared topic.
///
/// On the wire it is `kind:host` or `kind:host:container`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub host: HostId,
    pub container: Option<ContainerId>,
}

impl Notification {
    pub fn new_container(host: &HostId, container: &ContainerId) -> Self {
        Self {
            kind: NotificationKind::NewContainer,
            host: host.clone(),
            container: Some(container.clone()),
        }
    }

    pub fn delete_container(host: &HostId, container: &ContainerId) -> Self {
        Self {
            kind: NotificationKind::DeleteContainer,
            host: host.clone(),
            container: Some(container.clone()),
        }
    }

    pub fn refresh_containers(host: &HostId) -> Self {
        Self {
            kind: NotificationKind::RefreshContainers,
            host: host.clone(),
            container: None,
        }
    }
}

impl Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.host)?;
        if let Some(container) = &self.container {
            write!(f, ":{}", container)?;
        }
        Ok(())
    }
}

impl FromStr for Notification {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || Error::MalformedNotification {
            message: s.to_string(),
        };
        let mut parts = s.splitn(3, ':');
        let kind = parts
            .next()
            .and_then(|kind| NotificationKind::from_str(kind).ok())
            .ok_or_else(malformed)?;
        let host = parts
            .next()
            .filter(|host| !host.is_empty())
            .ok_or_else(malformed)?;
        let container = parts.next().map(ContainerId::from);
        if kind == NotificationKind::RefreshContainers && container.is_some() {
            return Err(malformed());
        }
        Ok(Self {
            kind,
            host: HostId::from(host),
            container,
        })
    }
}
