use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::geocode::{
    EchoGeocoder, GeocodeError, NominatimGeocoder, ReverseGeocoder, DEFAULT_MIN_DISTANCE_M,
    DEFAULT_NOMINATIM_URL,
};
use crate::location::{Accuracy, Backoff, TrackingOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracking: TrackingConfig,
    pub geocode: GeocodeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub accuracy: Accuracy,
    pub cold_start_accuracy: Accuracy,
    #[serde(deserialize_with = "deserialize_duration")]
    pub time_interval: Duration,
    pub distance_interval_m: f64,
    pub backoff: BackoffConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        let options = TrackingOptions::default();
        Self {
            accuracy: options.accuracy,
            cold_start_accuracy: options.cold_start_accuracy,
            time_interval: options.time_interval,
            distance_interval_m: options.distance_interval_m,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub base: Duration,
    pub multiplier: f64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        let backoff = Backoff::default();
        Self {
            base: backoff.base,
            multiplier: backoff.multiplier,
            max: backoff.max,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeocodeConfig {
    pub min_distance_m: f64,
    pub provider: GeocodeProvider,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            min_distance_m: DEFAULT_MIN_DISTANCE_M,
            provider: GeocodeProvider::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeocodeProvider {
    Echo {
        #[serde(default, deserialize_with = "deserialize_duration")]
        latency: Duration,
    },
    Nominatim {
        #[serde(default = "default_nominatim_url")]
        base_url: String,
        #[serde(default = "default_user_agent")]
        user_agent: String,
    },
}

impl Default for GeocodeProvider {
    fn default() -> Self {
        GeocodeProvider::Echo {
            latency: Duration::ZERO,
        }
    }
}

fn default_nominatim_url() -> String {
    DEFAULT_NOMINATIM_URL.to_string()
}

fn default_user_agent() -> String {
    format!("ride-sync/{}", env!("CARGO_PKG_VERSION"))
}

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let backoff = &self.tracking.backoff;
        if backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier must be >= 1, got {}",
                backoff.multiplier
            )));
        }
        if backoff.base > backoff.max {
            return Err(ConfigError::Invalid(
                "backoff base exceeds backoff max".to_string(),
            ));
        }
        if self.geocode.min_distance_m < 0.0 {
            return Err(ConfigError::Invalid(
                "geocode min_distance_m must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

impl TrackingConfig {
    pub fn options(&self) -> TrackingOptions {
        TrackingOptions {
            accuracy: self.accuracy,
            cold_start_accuracy: self.cold_start_accuracy,
            time_interval: self.time_interval,
            distance_interval_m: self.distance_interval_m,
            backoff: Backoff {
                base: self.backoff.base,
                multiplier: self.backoff.multiplier,
                max: self.backoff.max,
            },
        }
    }
}

impl GeocodeConfig {
    pub fn build_geocoder(&self) -> Result<Arc<dyn ReverseGeocoder>, GeocodeError> {
        Ok(match &self.provider {
            GeocodeProvider::Echo { latency } => Arc::new(EchoGeocoder::new(*latency)),
            GeocodeProvider::Nominatim {
                base_url,
                user_agent,
            } => Arc::new(NominatimGeocoder::new(base_url, user_agent)?),
        })
    }
}
