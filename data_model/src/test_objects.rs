pub mod tests {
    use serde_json::{json, Value};

    use crate::{Container, Image};

    pub const TEST_HOST: &str = "h1";
    pub const TEST_PREFIX: &str = "test";
    pub const TEST_IMAGE: &str = "img1";

    /// An inspected container document in the shape the Docker engine
    /// returns, trimmed to the fields the tests look at.
    pub fn mock_container_record(id: &str, image: &str, running: bool) -> Value {
        json!({
            "Id": id,
            "Image": image,
            "Name": format!("/{}", id),
            "RestartCount": 0,
            "State": {
                "Status": if running { "running" } else { "exited" },
                "Running": running,
                "ExitCode": if running { 0 } else { 137 },
                "Health": {"Status": "healthy", "FailingStreak": 0},
            },
            "Config": {
                "Hostname": id,
                "Labels": {"app": "web"},
                "Env": ["PATH=/usr/bin"],
            },
            "HostConfig": {"NetworkMode": "bridge", "Privileged": false},
        })
    }

    pub fn mock_container(id: &str, image: &str) -> Container {
        Container::from_record(mock_container_record(id, image, true))
            .expect("mock container record is well formed")
    }

    pub fn mock_stopped_container(id: &str, image: &str) -> Container {
        Container::from_record(mock_container_record(id, image, false))
            .expect("mock container record is well formed")
    }

    pub fn mock_image(id: &str) -> Image {
        Image::from_record(json!({
            "Id": id,
            "RepoTags": [format!("{}:latest", id)],
            "Size": 1024,
            "Labels": {"maintainer": "ops"},
        }))
        .expect("mock image record is well formed")
    }
}
