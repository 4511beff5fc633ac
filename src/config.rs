use std::{fs, path::Path, str::FromStr};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::{matcher::MatchStrategy, storage::StorageBackend};

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_STORAGE_PATH: &str = "./mocks/db.json";
pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;

/// Engine operating mode. `proxy` forwards and records, `mock` replays from
/// storage only, `intercept` forwards with response transforms applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Proxy,
    Mock,
    Intercept,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Mock => "mock",
            Self::Intercept => "intercept",
        }
    }

    /// Whether this mode sends traffic upstream and therefore needs a target.
    pub fn requires_target(self) -> bool {
        matches!(self, Self::Proxy | Self::Intercept)
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proxy" => Ok(Self::Proxy),
            "mock" => Ok(Self::Mock),
            "intercept" => Ok(Self::Intercept),
            other => {
                anyhow::bail!("invalid mode `{other}`; expected one of proxy, mock, intercept")
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub target: Option<TargetConfig>,
    pub storage: StorageConfig,
    pub cors: CorsConfig,
    pub chaos: ChaosSection,
    pub matching: MatchingConfig,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub mode: Mode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            mode: Mode::Mock,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default = "default_upstream_timeout_ms", rename = "timeout")]
    pub timeout_ms: u64,
}

fn default_upstream_timeout_ms() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT_MS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub backend: StorageBackend,
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Journal,
            path: DEFAULT_STORAGE_PATH.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChaosSection {
    pub enabled: bool,
    pub latency: Option<ChaosLatencySection>,
    pub error_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChaosLatencySection {
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MatchingConfig {
    pub strategy: MatchStrategy,
    pub ignore_headers: Option<Vec<String>>,
    pub ignore_query_params: Option<Vec<String>>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            strategy: MatchStrategy::Smart,
            ignore_headers: None,
            ignore_query_params: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        yaml.parse()
    }

    /// Startup-time coherence checks; failures abort before binding.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.mode.requires_target() && self.target.is_none() {
            anyhow::bail!(
                "mode `{}` requires a target upstream URL",
                self.server.mode.as_str()
            );
        }
        if let Some(target) = self.target.as_ref() {
            let uri: hyper::Uri = target
                .url
                .parse()
                .with_context(|| format!("parse target.url `{}`", target.url))?;
            if uri.authority().is_none() {
                anyhow::bail!("target.url `{}` has no authority", target.url);
            }
        }
        if let Some(latency) = self.chaos.latency.as_ref()
            && latency.min > latency.max
        {
            anyhow::bail!(
                "invalid chaos.latency: min {} exceeds max {}",
                latency.min,
                latency.max
            );
        }
        if let Some(rate) = self.chaos.error_rate
            && !(0.0..=100.0).contains(&rate)
        {
            anyhow::bail!("invalid chaos.errorRate {rate}: expected 0..=100");
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = serde_yaml::from_str(s).context("parse config YAML")?;
        Ok(config)
    }
}
