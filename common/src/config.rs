use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Scan and signal-generation settings.
///
/// Treated as an immutable value once a run starts; scanner and engine both
/// call [`AnalysisConfig::validate`] before doing any work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Sector codes bounding the universe
    pub sectors: Vec<String>,
    /// Minimum confidence (0-100] a signal needs to leave the scanner
    pub confidence_threshold: f64,
    /// Worker threads used by the scanner
    pub max_concurrent_workers: usize,
    /// Largest fraction of cash a single entry may use, (0-1]
    pub max_position_size: f64,
    /// Work items dispatched per scanner batch
    pub batch_size: usize,
    /// Memoize strategy evaluations across scans
    pub enable_caching: bool,
    /// Lifetime of memoized evaluations
    pub cache_ttl_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sectors: vec!["BK0917".to_string()],
            confidence_threshold: 80.0,
            max_concurrent_workers: 8,
            max_position_size: 0.1,
            batch_size: 30,
            enable_caching: true,
            cache_ttl_secs: 300,
        }
    }
}

impl AnalysisConfig {
    /// Create a validated config for the given sectors
    pub fn new(sectors: Vec<String>) -> Result<Self> {
        Self::default().with_sectors(sectors).validated()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sectors.is_empty() {
            return Err(EngineError::Configuration(
                "at least one sector is required".to_string(),
            ));
        }
        if !(self.confidence_threshold > 0.0 && self.confidence_threshold <= 100.0) {
            return Err(EngineError::Configuration(format!(
                "confidence threshold must be in (0, 100], got {}",
                self.confidence_threshold
            )));
        }
        if !(self.max_position_size > 0.0 && self.max_position_size <= 1.0) {
            return Err(EngineError::Configuration(format!(
                "max position size must be in (0, 1], got {}",
                self.max_position_size
            )));
        }
        if self.max_concurrent_workers == 0 {
            return Err(EngineError::Configuration(
                "max concurrent workers must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Configuration(
                "batch size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    pub fn with_sectors(mut self, sectors: Vec<String>) -> Self {
        self.sectors = sectors;
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_max_position_size(mut self, size: f64) -> Self {
        self.max_position_size = size;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.max_concurrent_workers = workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn without_caching(mut self) -> Self {
        self.enable_caching = false;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Portfolio simulation settings for backtests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    /// Flat cost deducted from proceeds when a position is closed
    pub transaction_cost: f64,
    /// Annual risk-free rate used by the Sharpe ratio
    pub risk_free_rate: f64,
    /// Consecutive days without data tolerated before a data-quality warning
    pub max_gap_days: usize,
    /// Quantities are rounded down to a multiple of this
    pub lot_size: f64,
    /// Commission as a fraction of traded value, paid on entry and exit
    pub commission_rate: f64,
    /// Tax as a fraction of sale value, paid on exit only
    pub stamp_tax_rate: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            transaction_cost: 0.0,
            risk_free_rate: 0.03,
            max_gap_days: 5,
            lot_size: 1.0,
            commission_rate: 0.0,
            stamp_tax_rate: 0.0,
        }
    }
}

const MAX_FEE_RATE: f64 = 0.1;

impl BacktestConfig {
    /// A-share market costs: 100-share lots, 0.03% commission each way and
    /// 0.1% stamp tax on sales
    pub fn a_share() -> Self {
        Self {
            lot_size: 100.0,
            commission_rate: 0.0003,
            stamp_tax_rate: 0.001,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.initial_capital > 0.0 && self.initial_capital.is_finite()) {
            return Err(EngineError::Configuration(format!(
                "initial capital must be positive, got {}",
                self.initial_capital
            )));
        }
        if !(self.transaction_cost >= 0.0 && self.transaction_cost.is_finite()) {
            return Err(EngineError::Configuration(format!(
                "transaction cost must be non-negative, got {}",
                self.transaction_cost
            )));
        }
        if !(self.lot_size >= 1.0) {
            return Err(EngineError::Configuration(format!(
                "lot size must be at least 1, got {}",
                self.lot_size
            )));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(EngineError::Configuration(
                "risk-free rate must be finite".to_string(),
            ));
        }
        for (name, rate) in [
            ("commission rate", self.commission_rate),
            ("stamp tax rate", self.stamp_tax_rate),
        ] {
            if !(0.0..=MAX_FEE_RATE).contains(&rate) {
                return Err(EngineError::Configuration(format!(
                    "{} must be within [0, {}], got {}",
                    name, MAX_FEE_RATE, rate
                )));
            }
        }
        Ok(())
    }

    pub fn with_capital(mut self, capital: f64) -> Self {
        self.initial_capital = capital;
        self
    }

    pub fn with_transaction_cost(mut self, cost: f64) -> Self {
        self.transaction_cost = cost;
        self
    }

    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.risk_free_rate = rate;
        self
    }

    pub fn with_max_gap_days(mut self, days: usize) -> Self {
        self.max_gap_days = days;
        self
    }

    pub fn with_lot_size(mut self, lot_size: f64) -> Self {
        self.lot_size = lot_size;
        self
    }

    pub fn with_commission_rate(mut self, rate: f64) -> Self {
        self.commission_rate = rate;
        self
    }

    pub fn with_stamp_tax_rate(mut self, rate: f64) -> Self {
        self.stamp_tax_rate = rate;
        self
    }
}

/// Retry settings for data-provider calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts, used by tests and synthetic runs
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            ..Default::default()
        }
    }

    /// Delay before the given retry (1-based): base * 2^(attempt - 1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Everything a run needs, loadable from a single JSON file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub analysis: AnalysisConfig,
    pub backtest: BacktestConfig,
    pub retry: RetryPolicy,
}

impl EngineSettings {
    /// Load settings from a JSON file; missing fields take their defaults
    pub fn load_json(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let settings: EngineSettings = serde_json::from_reader(BufReader::new(file))?;
        Ok(settings)
    }

    /// Apply `SCAN_*` environment overrides on top of the loaded values
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SCAN_BATCH_SIZE") {
            self.analysis.batch_size = parse_env("SCAN_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("SCAN_WORKERS") {
            self.analysis.max_concurrent_workers = parse_env("SCAN_WORKERS", &v)?;
        }
        if let Some(v) = lookup("SCAN_CONFIDENCE_THRESHOLD") {
            self.analysis.confidence_threshold = parse_env("SCAN_CONFIDENCE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("SCAN_CACHE_TTL") {
            self.analysis.cache_ttl_secs = parse_env("SCAN_CACHE_TTL", &v)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()?;
        self.backtest.validate()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Configuration(format!("invalid value for {}: {}", key, value)))
}
