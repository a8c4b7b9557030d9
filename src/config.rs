use std::{fmt::Debug, time::Duration};

use anyhow::Result;
use data_model::{HostId, KeySchema};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

const STORE_SCHEMES: [&str; 4] = ["redis", "rediss", "redis+unix", "unix"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Docker socket path. The local defaults (`DOCKER_HOST` or the
    /// platform socket) are used when unset.
    pub socket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    // OTLP collector endpoint, the exporter default when unset.
    pub endpoint: Option<String>,
    pub metrics_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_tracing: false,
            enable_metrics: false,
            endpoint: None,
            metrics_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub host_id: String,
    pub key_prefix: String,
    pub update_interval_secs: u64,
    pub expire_interval_secs: Option<u64>,
    pub ttl_secs: Option<u64>,
    pub image_update_interval_secs: u64,
    pub image_ttl_secs: Option<u64>,
    pub sweep_jitter_secs: u64,
    pub reconcile_concurrency: usize,
    pub events_channel: Option<String>,
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub structured_logging: bool,
    pub telemetry: TelemetryConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        MirrorConfig {
            host_id: "docker".to_string(),
            key_prefix: "docker".to_string(),
            update_interval_secs: 120,
            expire_interval_secs: None,
            ttl_secs: None,
            image_update_interval_secs: 1800,
            image_ttl_secs: None,
            sweep_jitter_secs: 120,
            reconcile_concurrency: 16,
            events_channel: None,
            store: StoreConfig::default(),
            engine: EngineConfig::default(),
            structured_logging: false,
            telemetry: TelemetryConfig::default(),
        }
    }
}

fn one_and_a_half(secs: u64) -> u64 {
    secs + secs / 2
}

impl MirrorConfig {
    pub fn from_path(path: &str) -> Result<MirrorConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: MirrorConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_id.trim().is_empty() {
            return Err(anyhow::anyhow!("host_id must not be empty"));
        }
        if self.host_id.contains(':') {
            return Err(anyhow::anyhow!(
                "host_id must not contain ':', it separates key and notification segments: {}",
                self.host_id
            ));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(anyhow::anyhow!("key_prefix must not be empty"));
        }
        for (name, secs) in [
            ("update_interval_secs", self.update_interval_secs),
            ("expire_interval_secs", self.expire_interval().as_secs()),
            ("image_update_interval_secs", self.image_update_interval_secs),
            ("telemetry.metrics_interval_secs", self.telemetry.metrics_interval_secs),
        ] {
            if secs == 0 {
                return Err(anyhow::anyhow!("{} must be greater than zero", name));
            }
        }
        if self.reconcile_concurrency == 0 {
            return Err(anyhow::anyhow!(
                "reconcile_concurrency must be greater than zero"
            ));
        }
        if self.ttl() < self.update_interval() {
            return Err(anyhow::anyhow!(
                "ttl_secs ({}) is shorter than update_interval_secs ({}), records would expire between refreshes",
                self.ttl().as_secs(),
                self.update_interval_secs
            ));
        }
        if self.image_ttl() < self.image_update_interval() {
            return Err(anyhow::anyhow!(
                "image_ttl_secs ({}) is shorter than image_update_interval_secs ({})",
                self.image_ttl().as_secs(),
                self.image_update_interval_secs
            ));
        }
        let url = url::Url::parse(&self.store.url)
            .map_err(|e| anyhow::anyhow!("invalid store url {}: {}", self.store.url, e))?;
        if !STORE_SCHEMES.contains(&url.scheme()) {
            return Err(anyhow::anyhow!(
                "unsupported store url scheme: {}",
                url.scheme()
            ));
        }
        if matches!(&self.events_channel, Some(channel) if channel.is_empty()) {
            return Err(anyhow::anyhow!("events_channel must not be empty"));
        }
        Ok(())
    }

    pub fn host(&self) -> HostId {
        HostId::from(self.host_id.as_str())
    }

    pub fn key_schema(&self) -> KeySchema {
        KeySchema::new(self.key_prefix.clone())
    }

    pub fn events_channel(&self) -> String {
        self.events_channel
            .clone()
            .unwrap_or_else(|| self.key_schema().events_channel())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn expire_interval(&self) -> Duration {
        Duration::from_secs(
            self.expire_interval_secs
                .unwrap_or(self.update_interval_secs),
        )
    }

    /// Lifetime of container records, host records and per-host sets.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(
            self.ttl_secs
                .unwrap_or_else(|| one_and_a_half(self.update_interval_secs)),
        )
    }

    pub fn image_update_interval(&self) -> Duration {
        Duration::from_secs(self.image_update_interval_secs)
    }

    /// Lifetime of image records and the per-image sets.
    pub fn image_ttl(&self) -> Duration {
        Duration::from_secs(
            self.image_ttl_secs
                .unwrap_or_else(|| one_and_a_half(self.image_update_interval_secs)),
        )
    }

    pub fn sweep_jitter(&self) -> Duration {
        Duration::from_secs(self.sweep_jitter_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.metrics_interval_secs)
    }
}
