//! Console configuration
//!
//! Handles:
//! - Backend endpoints and default node
//! - Session tuning (poll cadence, log retention, stream retry)
//! - Cross-platform storage (TOML under the OS config dir)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
    /// WebSocket base; derived from `base_url` when not set.
    pub ws_url: Option<String>,
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub poll_interval_secs: u64,
    pub log_retention: usize,
    pub stream_retry_max: u32,
    pub stream_retry_base_ms: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                base_url: "http://localhost:8000".to_string(),
                ws_url: None,
                node: "local".to_string(),
            },
            session: SessionConfig {
                poll_interval_secs: 5,
                log_retention: 1000,
                stream_retry_max: 5,
                stream_retry_base_ms: 500,
            },
        }
    }
}

impl ServerConfig {
    /// WebSocket base URL, swapping the http scheme when no explicit
    /// `ws_url` is configured.
    pub fn ws_base(&self) -> String {
        match &self.ws_url {
            Some(ws) => ws.trim_end_matches('/').to_string(),
            None => {
                let base = self.base_url.trim_end_matches('/');
                if let Some(rest) = base.strip_prefix("https://") {
                    format!("wss://{}", rest)
                } else if let Some(rest) = base.strip_prefix("http://") {
                    format!("ws://{}", rest)
                } else {
                    format!("ws://{}", base)
                }
            }
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn stream_retry_base(&self) -> Duration {
        Duration::from_millis(self.stream_retry_base_ms.max(1))
    }
}

impl ConsoleConfig {
    /// Load config from the `DOCKWATCH_CONFIG` path or the OS-specific
    /// location, falling back to defaults when the file is missing.
    pub async fn load() -> Result<Self> {
        let path = match std::env::var("DOCKWATCH_CONFIG") {
            Ok(p) => PathBuf::from(p),
            Err(_) => Self::config_file_path()?,
        };
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: ConsoleConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("dockwatch");
        path.push("config.toml");
        Ok(path)
    }
}
