use anyhow::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

const ENV_PREFIX: &str = "TELEMUX";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendConfig {
    Sqlite3,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub workspace_dir: PathBuf,
    pub store_backend: StoreBackendConfig,
    pub http_addr: String,
    pub mqtt_enabled: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_topic: String,
    pub mqtt_client_id: String,
    // Records per category replayed to a freshly connected subscriber.
    pub replay_limit: usize,
    pub max_inflight_cycles: usize,
    pub write_timeout_ms: u64,
    pub subscriber_queue_capacity: usize,
    pub subscriber_send_timeout_ms: u64,
}

fn default_workspace_dir() -> PathBuf {
    let base_dir = dirs::home_dir()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    base_dir.join(".telemux")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            store_backend: StoreBackendConfig::Sqlite3,
            http_addr: "0.0.0.0:3000".to_string(),
            mqtt_enabled: false,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_topic: "telemetry/#".to_string(),
            mqtt_client_id: "telemuxd".to_string(),
            replay_limit: 10,
            max_inflight_cycles: 256,
            write_timeout_ms: 5_000,
            subscriber_queue_capacity: 64,
            subscriber_send_timeout_ms: 2_000,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Loads defaults, then `<workspace>/config.toml`, then `TELEMUX_*`
    /// environment variables. An explicit workspace replaces the default
    /// home-directory location for both the config file and the data.
    pub fn load_from(workspace_override: Option<PathBuf>) -> Result<Self> {
        let defaults = Self::default();
        let workspace_dir = workspace_override.unwrap_or(defaults.workspace_dir);
        let config_path = crate::paths::config_file(&workspace_dir);

        let mut builder = Config::builder()
            .set_default("workspace_dir", workspace_dir.to_string_lossy().as_ref())?
            .set_default("store_backend", "sqlite3")?
            .set_default("http_addr", defaults.http_addr)?
            .set_default("mqtt_enabled", defaults.mqtt_enabled)?
            .set_default("mqtt_host", defaults.mqtt_host)?
            .set_default("mqtt_port", defaults.mqtt_port as u64)?
            .set_default("mqtt_topic", defaults.mqtt_topic)?
            .set_default("mqtt_client_id", defaults.mqtt_client_id)?
            .set_default("replay_limit", defaults.replay_limit as u64)?
            .set_default("max_inflight_cycles", defaults.max_inflight_cycles as u64)?
            .set_default("write_timeout_ms", defaults.write_timeout_ms)?
            .set_default(
                "subscriber_queue_capacity",
                defaults.subscriber_queue_capacity as u64,
            )?
            .set_default(
                "subscriber_send_timeout_ms",
                defaults.subscriber_send_timeout_ms,
            )?;

        if config_path.exists() {
            builder = builder.add_source(File::from(config_path));
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX));

        let config = builder.build()?;
        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_inflight_cycles == 0 {
            anyhow::bail!("max_inflight_cycles must be at least 1");
        }
        if self.subscriber_queue_capacity == 0 {
            anyhow::bail!("subscriber_queue_capacity must be at least 1");
        }
        if self.write_timeout_ms == 0 {
            anyhow::bail!("write_timeout_ms must be positive");
        }
        Ok(())
    }
}
