use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub http_app_host: String,
    pub store_url: String,
    pub static_files: String,
    pub template_file: String,
    pub report_url: Option<String>,
    pub log_file: String,
    pub refresh_interval_secs: u64,
    pub max_concurrency: usize,
    pub check_timeout_ms: u64,
    pub max_retries: u32,
    pub cache_max_age_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_app_host: "0.0.0.0:8080".into(),
            store_url: "redis://127.0.0.1:6379".into(),
            static_files: "./scripts".into(),
            template_file: "./templates/index.html".into(),
            report_url: None,
            log_file: "mcapi.log".into(),
            refresh_interval_secs: 60,
            max_concurrency: 1000,
            check_timeout_ms: 3500,
            max_retries: 1,
            cache_max_age_secs: 300,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn write_default(path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(&Config::default())?;
        std::fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if self.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be greater than zero");
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be greater than zero");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.http_app_host
            .parse()
            .with_context(|| format!("Invalid http_app_host {:?}", self.http_app_host))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}
