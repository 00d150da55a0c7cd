//! The two entry points callers use: market scans and backtests.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use common::{AnalysisConfig, BacktestResult, EngineSettings, Result, RetryPolicy, ScanResult};

use crate::cancel::CancellationToken;
use crate::data::DataProvider;
use crate::engine::BacktestEngine;
use crate::notify::SignalNotifier;
use crate::registry::StrategyRegistry;
use crate::repository::PortfolioRepository;
use crate::scanner::MarketScanner;

pub struct MarketService<P: DataProvider> {
    provider: Arc<P>,
    registry: StrategyRegistry,
    scanner: MarketScanner<P>,
    repository: Option<Arc<dyn PortfolioRepository>>,
}

impl<P: DataProvider> MarketService<P> {
    pub fn new(provider: Arc<P>, registry: StrategyRegistry, retry: RetryPolicy) -> Self {
        let scanner = MarketScanner::new(Arc::clone(&provider)).with_retry_policy(retry);
        Self {
            provider,
            registry,
            scanner,
            repository: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn SignalNotifier>) -> Self {
        self.scanner = self.scanner.with_notifier(notifier);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn PortfolioRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Scans evaluate snapshots up to `as_of` instead of the current time
    pub fn with_scan_as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.scanner = self.scanner.with_as_of(as_of);
        self
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn scanner(&self) -> &MarketScanner<P> {
        &self.scanner
    }

    /// Ordered, deduplicated signals for the given sectors
    pub fn scan_market(&self, sectors: &[String], config: &AnalysisConfig) -> Result<ScanResult> {
        self.scan_market_cancellable(sectors, config, &CancellationToken::new())
    }

    pub fn scan_market_cancellable(
        &self,
        sectors: &[String],
        config: &AnalysisConfig,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        self.scanner.scan(sectors, &self.registry, config, cancel)
    }

    pub fn run_backtest(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        settings: &EngineSettings,
    ) -> Result<BacktestResult> {
        self.run_backtest_cancellable(start, end, settings, &CancellationToken::new())
    }

    pub fn run_backtest_cancellable(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        settings: &EngineSettings,
        cancel: &CancellationToken,
    ) -> Result<BacktestResult> {
        let mut engine =
            BacktestEngine::new(Arc::clone(&self.provider), self.registry.clone(), settings);
        if let Some(repository) = &self.repository {
            engine = engine.with_repository(Arc::clone(repository));
        }
        engine.run(start, end, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticUniverse;
    use crate::repository::InMemoryRepository;

    fn service() -> MarketService<crate::data::InMemoryProvider> {
        let provider = SyntheticUniverse::new(
            vec!["S1".to_string(), "S2".to_string()],
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            90,
        )
        .with_symbols_per_sector(6)
        .build();
        MarketService::new(Arc::new(provider), StrategyRegistry::all(), RetryPolicy::immediate())
    }

    #[test]
    fn test_scan_market_is_repeatable() {
        let service = service();
        let sectors = vec!["S1".to_string(), "S2".to_string()];
        let config = AnalysisConfig::default()
            .with_sectors(sectors.clone())
            .with_confidence_threshold(50.0);

        let first = service.scan_market(&sectors, &config).unwrap();
        let second = service.scan_market(&sectors, &config).unwrap();

        assert_eq!(first.signals, second.signals);
        assert!(first.signals.iter().all(|s| s.confidence >= 50.0));
    }

    #[test]
    fn test_run_backtest_saves_portfolio() {
        let repository = Arc::new(InMemoryRepository::new());
        let service = service().with_repository(repository.clone());
        let mut settings = EngineSettings::default();
        settings.analysis = settings.analysis.with_sectors(vec!["S1".to_string()]);
        settings.retry = RetryPolicy::immediate();

        let result = service
            .run_backtest(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 29).unwrap(),
                &settings,
            )
            .unwrap();

        assert!(result.portfolio_id.is_some());
        assert_eq!(repository.len(), 1);
        assert_eq!(result.equity_curve.len(), 65);
    }
}
