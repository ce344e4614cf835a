use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::analysis::aggregation::AggregationPolicy;
use crate::analysis::arima::ArimaOrder;
use crate::data::{
    CurrencyConversion, NormalizeOptions, DEFAULT_EUR_RATE, DEFAULT_METHOD, MAX_PRICE_PRECISION,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub path: Option<PathBuf>,
    pub method: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            path: None,
            method: DEFAULT_METHOD.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationSettings {
    /// Target currency code; `None` keeps prices in USD.
    pub currency: Option<String>,
    pub rate: f64,
    pub price_precision: Option<u32>,
}

impl Default for NormalizationSettings {
    fn default() -> Self {
        Self {
            currency: Some("EUR".to_string()),
            rate: DEFAULT_EUR_RATE,
            price_precision: Some(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    /// Collision policy when merging transactions that share a date.
    pub duplicate_policy: AggregationPolicy,
    /// Policy for the daily series fed to stationarity and forecasting.
    pub series_policy: AggregationPolicy,
    /// Policy for the daily prices averaged into monthly seasonality.
    pub seasonality_policy: AggregationPolicy,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            duplicate_policy: AggregationPolicy::Mean,
            series_policy: AggregationPolicy::Median,
            seasonality_policy: AggregationPolicy::Mean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub significance: f64,
    pub test_fraction: f64,
    pub split_seed: u64,
    pub top_n: usize,
    pub price_band: (f64, f64),
    pub premium_threshold: f64,
    pub iqr_multiplier: f64,
    pub variability_quantile: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            significance: 0.05,
            test_fraction: 0.2,
            split_seed: 42,
            top_n: 5,
            price_band: (100.0, 200.0),
            premium_threshold: 305.0,
            iqr_multiplier: 1.5,
            variability_quantile: 0.75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastSettings {
    pub order: ArimaOrder,
    pub steps: usize,
    pub adf_max_lag: Option<usize>,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            order: ArimaOrder::default(),
            steps: 30,
            adf_max_lag: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub directory: PathBuf,
    pub export: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output"),
            export: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceSettings,
    pub normalization: NormalizationSettings,
    pub aggregation: AggregationSettings,
    pub analysis: AnalysisSettings,
    pub forecast: ForecastSettings,
    pub output: OutputSettings,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Load `path` if it exists, otherwise fall back to the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.source.method.trim().is_empty() {
            return invalid("source.method must not be empty".to_string());
        }
        let rate = self.normalization.rate;
        if self.normalization.currency.is_some() && !(rate.is_finite() && rate > 0.0) {
            return invalid(format!("normalization.rate must be positive, got {rate}"));
        }
        if let Some(precision) = self.normalization.price_precision {
            if precision > MAX_PRICE_PRECISION {
                return invalid(format!(
                    "normalization.price_precision must not exceed {MAX_PRICE_PRECISION}: {precision}"
                ));
            }
        }
        let fraction = self.analysis.test_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return invalid(format!(
                "analysis.test_fraction must lie in (0, 1), got {fraction}"
            ));
        }
        for (name, q) in [
            ("analysis.significance", self.analysis.significance),
            ("analysis.variability_quantile", self.analysis.variability_quantile),
        ] {
            if !(0.0..=1.0).contains(&q) {
                return invalid(format!("{name} must lie in [0, 1], got {q}"));
            }
        }
        let (low, high) = self.analysis.price_band;
        if low > high {
            return invalid(format!("analysis.price_band is reversed: {low} > {high}"));
        }
        let k = self.analysis.iqr_multiplier;
        if k.is_nan() || k < 0.0 {
            return invalid("analysis.iqr_multiplier must be non-negative".to_string());
        }
        Ok(())
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            method_filter: self.source.method.clone(),
            currency: self
                .normalization
                .currency
                .as_ref()
                .map(|code| CurrencyConversion {
                    code: code.clone(),
                    rate: self.normalization.rate,
                }),
            price_precision: self.normalization.price_precision,
            days_since_start: true,
        }
    }
}
