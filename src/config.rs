use std::env;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tokio::fs;
use tracing::warn;

use crate::normalize::coerce_int;

pub const SUPPORTED_ENGINE: &str = "sqlite";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_engine: String,
    pub db_path: String,
    pub static_dir: String,
    pub default_source: String,
    pub max_body_bytes: i64,
    pub request_timeout_seconds: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            db_engine: SUPPORTED_ENGINE.to_string(),
            db_path: "./scanledger.db".to_string(),
            static_dir: "./static".to_string(),
            default_source: "web-serial".to_string(),
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 15,
        }
    }
}

impl AppConfig {
    pub async fn load() -> Result<Self> {
        let path = env::var("SCANLEDGER_CONFIG").unwrap_or_else(|_| "./config.toml".to_string());
        let file_path = Path::new(&path);
        let base_dir = file_path.parent();
        if !file_path.exists() {
            warn!("config.toml not found, using defaults");
            let mut config = AppConfig::default();
            config.apply_env_overrides();
            config.resolve_paths(base_dir);
            config.normalize();
            config.validate()?;
            return Ok(config);
        }
        let content = fs::read_to_string(file_path).await?;
        let mut config: AppConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.resolve_paths(base_dir);
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn normalize(&mut self) {
        self.bind_addr = self.bind_addr.trim().to_string();
        self.db_engine = self.db_engine.trim().to_lowercase();
        self.db_path = self.db_path.trim().to_string();
        self.static_dir = self.static_dir.trim().to_string();
        self.default_source = self.default_source.trim().to_string();
    }

    fn resolve_paths(&mut self, base_dir: Option<&Path>) {
        let Some(base) = base_dir else {
            return;
        };
        self.db_path = resolve_path(base, &self.db_path);
        self.static_dir = resolve_path(base, &self.static_dir);
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|err| anyhow!("invalid bind_addr: {}", err))?;
        if self.db_engine != SUPPORTED_ENGINE {
            return Err(anyhow!(
                "unsupported db_engine '{}': only {} is supported",
                self.db_engine,
                SUPPORTED_ENGINE
            ));
        }
        if self.db_path.is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.max_body_bytes <= 0 {
            return Err(anyhow!("max_body_bytes must be greater than 0"));
        }
        if self.request_timeout_seconds <= 0 {
            return Err(anyhow!("request_timeout_seconds must be greater than 0"));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(value) = env_first(&["SCANLEDGER_BIND_ADDR"]) {
            self.bind_addr = value;
        }
        if let Some(value) = env_first(&["SCANLEDGER_DB_ENGINE", "DB_CONNECTION"]) {
            self.db_engine = value;
        }
        if let Some(value) = env_first(&["SCANLEDGER_DB_PATH", "DB_DATABASE"]) {
            self.db_path = value;
        }
        if let Some(value) = env_first(&["SCANLEDGER_STATIC_DIR"]) {
            self.static_dir = value;
        }
        if let Some(value) = env_first(&["SCANLEDGER_DEFAULT_SOURCE"]) {
            self.default_source = value;
        }
        if let Some(value) = env_first(&["SCANLEDGER_MAX_BODY_BYTES"]) {
            self.max_body_bytes = coerce_int(Some(&value), self.max_body_bytes);
        }
        if let Some(value) = env_first(&["SCANLEDGER_REQUEST_TIMEOUT_SECONDS"]) {
            self.request_timeout_seconds =
                coerce_int(Some(&value), self.request_timeout_seconds);
        }
    }
}

// Unprefixed names are fallback aliases kept from the old deployment.
fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    })
}

fn resolve_path(base: &Path, value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return trimmed.to_string();
    }
    let path = Path::new(trimmed);
    if path.is_absolute() {
        trimmed.to_string()
    } else {
        base.join(path).to_string_lossy().to_string()
    }
}
