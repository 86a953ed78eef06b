use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broker configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// data-dir: /var/lib/broker/data
/// staleness-threshold-secs: 120
/// refresh-interval-secs: 120
/// resource-weight: 0.70
/// cost-weight: 0.30
/// acquire-retries: 5
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "staleness-threshold-secs")]
    pub staleness_threshold_secs: Option<u64>,
    #[serde(default, alias = "refresh-interval-secs")]
    pub refresh_interval_secs: Option<u64>,
    #[serde(default, alias = "resource-weight")]
    pub resource_weight: Option<f64>,
    #[serde(default, alias = "cost-weight")]
    pub cost_weight: Option<f64>,
    #[serde(default, alias = "acquire-retries")]
    pub acquire_retries: Option<u32>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Resolved broker settings, after merging CLI flags, the config file,
/// and defaults. Injected into the controllers at construction.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Advertisement age beyond which the cluster stops receiving work.
    pub staleness_threshold: Duration,
    /// How often advertisement status is recomputed. Clamped to the
    /// staleness threshold so an expiry is never observed late.
    pub refresh_interval: Duration,
    pub resource_weight: f64,
    pub cost_weight: f64,
    /// Version-conflict retries per capacity acquisition.
    pub acquire_retries: u32,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(600),
            refresh_interval: Duration::from_secs(300),
            resource_weight: 0.70,
            cost_weight: 0.30,
            acquire_retries: 5,
        }
    }
}

impl BrokerSettings {
    /// Merge a parsed config file over the defaults.
    pub fn from_file(file: &BrokerConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            staleness_threshold: file
                .staleness_threshold_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.staleness_threshold),
            refresh_interval: file
                .refresh_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_interval),
            resource_weight: file.resource_weight.unwrap_or(defaults.resource_weight),
            cost_weight: file.cost_weight.unwrap_or(defaults.cost_weight),
            acquire_retries: file.acquire_retries.unwrap_or(defaults.acquire_retries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = BrokerSettings::default();
        assert_eq!(s.staleness_threshold, Duration::from_secs(600));
        assert_eq!(s.refresh_interval, Duration::from_secs(300));
        assert_eq!(s.resource_weight, 0.70);
        assert_eq!(s.cost_weight, 0.30);
    }

    #[test]
    fn file_overrides() {
        let file: BrokerConfigFile = serde_yaml::from_str(
            "staleness-threshold-secs: 120\nresource-weight: 0.5\ncost-weight: 0.5\n",
        )
        .unwrap();
        let s = BrokerSettings::from_file(&file);
        assert_eq!(s.staleness_threshold, Duration::from_secs(120));
        assert_eq!(s.resource_weight, 0.5);
        // Untouched fields keep defaults.
        assert_eq!(s.acquire_retries, 5);
    }
}
