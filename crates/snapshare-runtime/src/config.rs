//! Configuration
//!
//! Everything is serde-(de)serializable. Durations are humantime strings
//! such as `"250ms"` or `"3s"`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snapshare_core::{ShareError, ShareResult, SERVICE_TAG};
use snapshare_transport::UdpConfig;
use snapshare_wire::MAX_FRAGMENTED_PAYLOAD;

/// Node configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Tag used when the caller does not name one
    pub service_tag: String,
    /// Overrides the detected device name
    pub device_name: Option<String>,
    /// Driver timer resolution
    #[serde(with = "duration_str")]
    pub tick_interval: Duration,
    /// Beacon and probe period
    #[serde(with = "duration_str")]
    pub advertise_interval: Duration,
    /// A discovered peer is lost after this long without a beacon
    #[serde(with = "duration_str")]
    pub peer_ttl: Duration,
    /// Retransmission period for handshake and reliable data
    #[serde(with = "duration_str")]
    pub retry_interval: Duration,
    /// Reliable retransmissions before the link is declared lost
    pub max_retries: u32,
    /// Handshake retransmissions before giving up
    pub handshake_retries: u32,
    #[serde(with = "duration_str")]
    pub keepalive_interval: Duration,
    /// Silence after which a connected peer is lost
    #[serde(with = "duration_str")]
    pub link_timeout: Duration,
    /// Unacknowledged reliable fragments per link
    pub max_in_flight: usize,
    pub max_payload_size: usize,
    /// Inbound datagram and command queue depth
    pub packet_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            service_tag: SERVICE_TAG.to_owned(),
            device_name: None,
            tick_interval: Duration::from_millis(10),
            advertise_interval: Duration::from_secs(1),
            peer_ttl: Duration::from_secs(3),
            retry_interval: Duration::from_millis(200),
            max_retries: 8,
            handshake_retries: 10,
            keepalive_interval: Duration::from_secs(1),
            link_timeout: Duration::from_secs(5),
            max_in_flight: 64,
            max_payload_size: 16 * 1024 * 1024,
            packet_buffer: 1024,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> ShareResult<()> {
        validate_service_tag(&self.service_tag)?;

        let intervals = [
            ("tick_interval", self.tick_interval),
            ("advertise_interval", self.advertise_interval),
            ("peer_ttl", self.peer_ttl),
            ("retry_interval", self.retry_interval),
            ("keepalive_interval", self.keepalive_interval),
            ("link_timeout", self.link_timeout),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ShareError::Config(format!("{} must be non-zero", name)));
        }
        if self.max_in_flight == 0 || self.packet_buffer == 0 {
            return Err(ShareError::Config(
                "max_in_flight and packet_buffer must be non-zero".into(),
            ));
        }
        if self.max_payload_size > MAX_FRAGMENTED_PAYLOAD {
            return Err(ShareError::Config(format!(
                "max_payload_size {} exceeds {}",
                self.max_payload_size, MAX_FRAGMENTED_PAYLOAD
            )));
        }
        Ok(())
    }
}

/// Service tags travel as short strings
pub fn validate_service_tag(tag: &str) -> ShareResult<()> {
    if tag.is_empty() || tag.len() > u8::MAX as usize {
        return Err(ShareError::Config(format!(
            "Service tag must be 1..=255 bytes, got {}",
            tag.len()
        )));
    }
    Ok(())
}

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_owned(),
            format: LogFormat::Pretty,
        }
    }
}

/// Complete application configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    pub node: NodeConfig,
    pub udp: UdpConfig,
    pub logging: LoggingConfig,
}

impl ShareConfig {
    /// Load from an optional JSON file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> ShareResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => ShareConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.node.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ShareResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ShareError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> ShareResult<Self> {
        serde_json::from_str(text).map_err(|e| ShareError::Config(e.to_string()))
    }

    /// Apply `SNAPSHARE_DEVICE_NAME`, `SNAPSHARE_BIND` and `SNAPSHARE_LOG`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ShareResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("SNAPSHARE_DEVICE_NAME").filter(|n| !n.trim().is_empty()) {
            self.node.device_name = Some(name.trim().to_owned());
        }
        if let Some(bind) = lookup("SNAPSHARE_BIND") {
            self.udp.bind_addr = bind
                .parse::<SocketAddr>()
                .map_err(|e| ShareError::Config(format!("SNAPSHARE_BIND {:?}: {}", bind, e)))?;
        }
        if let Some(filter) = lookup("SNAPSHARE_LOG") {
            self.logging.filter = filter;
        }
        Ok(())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
