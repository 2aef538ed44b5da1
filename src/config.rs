//! TOML configuration parsing.
//!
//! Every section has defaults so a missing file can be replaced with
//! [`Config::minimal`]. A handful of environment variables (`PORT`,
//! `DATA_DIR`, `SIMULATED_LATENCY_MS`, `SIMULATED_FAILURE_RATE`,
//! `LIBRARY_API_BASE_URL`) override the file after parsing.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Upper bound the catalog provider accepts for a single page of results.
pub const MAX_PROVIDER_RESULTS: usize = 40;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3001".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Request timeout for the provider. `None` keeps the transport default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_results: default_max_results(),
            timeout_secs: None,
        }
    }
}

fn default_endpoint() -> String {
    "https://www.googleapis.com/books/v1/volumes".to_string()
}
fn default_max_results() -> usize {
    7
}

/// Resilience-testing knobs. Not meant for production traffic.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SimulationConfig {
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub failure_rate: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            local_dir: default_local_dir(),
        }
    }
}

fn default_api_base_url() -> String {
    "http://localhost:3001/api".to_string()
}
fn default_local_dir() -> PathBuf {
    PathBuf::from("./data/local")
}

impl Config {
    /// Configuration with every default applied and no environment overrides.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// API base URL without trailing slashes.
    pub fn api_base_url(&self) -> String {
        self.client.api_base_url.trim_end_matches('/').to_string()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;

    Ok(config)
}

/// Applies the environment overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("PORT") {
        let port: u16 = port
            .trim()
            .parse()
            .with_context(|| format!("PORT must be a port number, got '{}'", port))?;
        let host = config
            .server
            .bind
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        config.server.bind = format!("{}:{}", host, port);
    }

    if let Some(dir) = lookup("DATA_DIR") {
        if !dir.trim().is_empty() {
            config.data.dir = PathBuf::from(dir.trim());
        }
    }

    if let Some(latency) = lookup("SIMULATED_LATENCY_MS") {
        config.simulation.latency_ms = latency
            .trim()
            .parse()
            .with_context(|| format!("SIMULATED_LATENCY_MS must be an integer, got '{}'", latency))?;
    }

    if let Some(rate) = lookup("SIMULATED_FAILURE_RATE") {
        config.simulation.failure_rate = rate
            .trim()
            .parse()
            .with_context(|| format!("SIMULATED_FAILURE_RATE must be a number, got '{}'", rate))?;
    }

    if let Some(url) = lookup("LIBRARY_API_BASE_URL") {
        if !url.trim().is_empty() {
            config.client.api_base_url = url.trim().to_string();
        }
    }

    Ok(())
}

pub fn validate(config: &Config) -> Result<()> {
    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    if config.catalog.max_results == 0 || config.catalog.max_results > MAX_PROVIDER_RESULTS {
        anyhow::bail!(
            "catalog.max_results must be in 1..={}",
            MAX_PROVIDER_RESULTS
        );
    }

    if !(0.0..=1.0).contains(&config.simulation.failure_rate) {
        anyhow::bail!("simulation.failure_rate must be in [0.0, 1.0]");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:3001");
        assert_eq!(config.catalog.max_results, 7);
        assert!(config.catalog.timeout_secs.is_none());
        assert_eq!(config.simulation.failure_rate, 0.0);
        assert_eq!(config.api_base_url(), "http://localhost:3001/api");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::minimal();
        let env: HashMap<&str, &str> = [
            ("PORT", "4100"),
            ("DATA_DIR", "/tmp/bookmemo"),
            ("SIMULATED_FAILURE_RATE", "0.25"),
            ("LIBRARY_API_BASE_URL", "http://api.local/api/"),
        ]
        .into_iter()
        .collect();

        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:4100");
        assert_eq!(config.data.dir, PathBuf::from("/tmp/bookmemo"));
        assert_eq!(config.simulation.failure_rate, 0.25);
        assert_eq!(config.api_base_url(), "http://api.local/api");
    }

    #[test]
    fn test_bad_port_is_rejected() {
        let mut config = Config::minimal();
        let result = apply_env_overrides(&mut config, |k| {
            (k == "PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = Config::minimal();
        config.catalog.max_results = 0;
        assert!(validate(&config).is_err());

        config.catalog.max_results = 41;
        assert!(validate(&config).is_err());

        config.catalog.max_results = 40;
        config.simulation.failure_rate = 1.5;
        assert!(validate(&config).is_err());

        config.simulation.failure_rate = 1.0;
        assert!(validate(&config).is_ok());
    }
}
