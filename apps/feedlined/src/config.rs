use config::{Config, ConfigError, Environment, File};
use feedline_node::config::NodeConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Conventional port of the product-distribution service.
pub const DEFAULT_PORT: u16 = 388;

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    pub listen: String,
    pub port: u16,
    /// Rule table with feedtype, allow, accept and request declarations.
    pub rules_path: PathBuf,
    /// Store snapshot loaded at startup and written periodically.
    pub store_path: PathBuf,
    /// Where requesters keep the last product received per subscription.
    pub state_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub max_products: usize,
    pub max_store_bytes: usize,
    pub max_product_size: u32,
    #[serde(default)]
    pub node: NodeConfig,
}

impl DaemonConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("listen", "0.0.0.0")?
            .set_default("port", i64::from(DEFAULT_PORT))?
            .set_default("rules_path", "etc/feedline.toml")?
            .set_default("store_path", "data/products.cbor")?
            .set_default("state_dir", "data/state")?
            .set_default("snapshot_interval", "5m")?
            .set_default("connect_timeout", "30s")?
            .set_default("max_products", 100_000)?
            .set_default("max_store_bytes", 512_i64 * 1024 * 1024)?
            .set_default("max_product_size", 64_i64 * 1024 * 1024)?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FEEDLINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
