use std::time::Duration;

use feedline_codec::{PROTOCOL_V5, PROTOCOL_V6};
use serde::{Deserialize, Serialize};

/// Tunables shared by every session a node runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Base pacing interval. Drives autoshift and retry backoff.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Silence after which a session is considered dead.
    #[serde(with = "humantime_serde")]
    pub inactive_timeout: Duration,
    /// Oldest product a requester asks for or accepts.
    #[serde(with = "humantime_serde")]
    pub max_latency: Duration,
    /// Pause before an accepted feeder starts sending.
    #[serde(with = "humantime_serde")]
    pub upstream_startup_delay: Duration,
    /// Largest product a primary feeder sends as one message.
    pub max_hereis_bytes: u32,
    /// Chunk size for two-phase delivery.
    pub chunk_size: u32,
    /// Reclassification rounds before a requester gives up, and before a
    /// server refuses to negotiate further on one connection.
    pub max_reclass_rounds: u32,
    /// Chunk restarts tolerated per product.
    pub max_restarts: u32,
    /// Versions this node speaks, preferred first.
    pub protocol_versions: Vec<u32>,
    /// Terminate a redundant feeder to the same downstream instead of
    /// narrowing the new one.
    pub anti_dos: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            inactive_timeout: Duration::from_secs(120),
            max_latency: Duration::from_secs(3600),
            upstream_startup_delay: Duration::from_secs(1),
            max_hereis_bytes: 16 * 1024,
            chunk_size: 8 * 1024,
            max_reclass_rounds: 8,
            max_restarts: 3,
            protocol_versions: vec![PROTOCOL_V6, PROTOCOL_V5],
            anti_dos: true,
        }
    }
}

impl NodeConfig {
    /// Idle gap after which a feeder sends a no-op to keep the
    /// downstream's activity timer from firing.
    pub fn keepalive_interval(&self) -> Duration {
        let half = self.inactive_timeout / 2;
        half.saturating_sub(self.interval * 2).max(self.interval)
    }

    /// Wait bound for a single call's reply.
    pub fn rpc_timeout(&self) -> Duration {
        self.inactive_timeout
    }

    /// Lowest and highest served protocol versions.
    pub fn version_range(&self) -> (u32, u32) {
        let low = self.protocol_versions.iter().copied().min().unwrap_or(PROTOCOL_V6);
        let high = self.protocol_versions.iter().copied().max().unwrap_or(PROTOCOL_V6);
        (low, high)
    }

    pub fn supports_version(&self, version: u32) -> bool {
        self.protocol_versions.contains(&version)
    }

    /// Versions a requester tries: the preferred one plus at most one fallback.
    pub fn request_versions(&self) -> &[u32] {
        let n = self.protocol_versions.len().min(2);
        &self.protocol_versions[..n]
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::NodeConfig;

    #[test]
    fn keepalive_has_a_floor_of_one_interval() {
        let config = NodeConfig::default();
        assert_eq!(config.keepalive_interval(), Duration::from_secs(30));

        let roomy = NodeConfig {
            inactive_timeout: Duration::from_secs(600),
            ..NodeConfig::default()
        };
        assert_eq!(roomy.keepalive_interval(), Duration::from_secs(240));
    }

    #[test]
    fn request_versions_allow_one_fallback() {
        let config = NodeConfig {
            protocol_versions: vec![7, 6, 5],
            ..NodeConfig::default()
        };
        assert_eq!(config.request_versions(), &[7, 6]);
        assert_eq!(config.version_range(), (5, 7));
        assert!(!config.supports_version(4));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: NodeConfig = toml_from("interval = \"10s\"\nanti_dos = false\n");
        assert_eq!(config.interval, Duration::from_secs(10));
        assert!(!config.anti_dos);
        assert_eq!(config.inactive_timeout, Duration::from_secs(120));
    }

    fn toml_from(text: &str) -> NodeConfig {
        toml::from_str(text).expect("parse")
    }
}
