//! Configuration management for the shipping controller.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::props::{self, Props};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub shipping: ShippingConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Identifier written into every manifest this cluster uploads
    pub id: String,

    /// Suffix appended to backup keys so several sites can share a bucket
    #[serde(default)]
    pub site_suffix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShippingConfig {
    /// Cluster-wide default for concurrent source shipments per node.
    /// Unset or negative means unlimited, 0 disables shipping.
    #[serde(default)]
    pub max_concurrent_per_node: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Create a default configuration with a fresh cluster id
    pub fn default() -> Self {
        Config {
            cluster: ClusterConfig {
                id: uuid::Uuid::new_v4().to_string(),
                site_suffix: None,
            },
            shipping: ShippingConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Apply overrides from the process environment (and a `.env` file, if present)
    pub fn apply_env_overrides(mut self) -> Self {
        let _ = dotenvy::dotenv();

        if let Ok(id) = std::env::var("SHIPPING_CLUSTER_ID") {
            if !id.is_empty() {
                self.cluster.id = id;
            }
        }
        if let Some(max) = std::env::var("SHIPPING_MAX_CONCURRENT_PER_NODE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.shipping.max_concurrent_per_node = Some(max);
        }
        if let Ok(suffix) = std::env::var("SHIPPING_SITE_SUFFIX") {
            self.cluster.site_suffix = if suffix.is_empty() { None } else { Some(suffix) };
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log.level = level;
        }
        self
    }

    /// Controller-level properties seeded from this config. Node properties take precedence.
    pub fn controller_props(&self) -> Props {
        let mut ctrl = Props::default();
        if let Some(max) = self.shipping.max_concurrent_per_node {
            ctrl.set(
                props::KEY_MAX_CONCURRENT_BACKUPS_PER_NODE,
                props::NAMESPC_BACKUP_SHIPPING,
                max.to_string(),
            );
        }
        if let Some(suffix) = &self.cluster.site_suffix {
            ctrl.set(props::KEY_SITE_SUFFIX, props::NAMESPC_BACKUP_SHIPPING, suffix.clone());
        }
        ctrl
    }
}
