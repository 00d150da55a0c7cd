use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use common::{
    AnalysisConfig, BacktestConfig, BacktestResult, Diagnostic, EngineError, EngineSettings,
    Result, RetryPolicy, TradingSignal,
};
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::data::{trading_days, with_retry, DataProvider, SnapshotWindow};
use crate::metrics::{drawdown_curve, RiskMetricsCalculator};
use crate::portfolio::{PortfolioSimulator, SignalOutcome};
use crate::registry::StrategyRegistry;
use crate::repository::PortfolioRepository;
use crate::strategies::evaluate_guarded;

/// Chronological, single-threaded replay of the registered strategies over a
/// date range
pub struct BacktestEngine<P: DataProvider> {
    provider: Arc<P>,
    registry: StrategyRegistry,
    analysis: AnalysisConfig,
    backtest: BacktestConfig,
    retry: RetryPolicy,
    repository: Option<Arc<dyn PortfolioRepository>>,
}

/// Mutable state of one run, owned exclusively by it
struct RunState {
    portfolio: PortfolioSimulator,
    /// symbol -> sector
    universe: BTreeMap<String, String>,
    equity_curve: Vec<(DateTime<Utc>, f64)>,
    diagnostics: Vec<Diagnostic>,
    total_signals: usize,
    /// (first day, last day, length) of the current run of days without data
    gap_streak: Option<(NaiveDate, NaiveDate, usize)>,
    cancelled: bool,
}

impl<P: DataProvider> BacktestEngine<P> {
    pub fn new(provider: Arc<P>, registry: StrategyRegistry, settings: &EngineSettings) -> Self {
        Self {
            provider,
            registry,
            analysis: settings.analysis.clone(),
            backtest: settings.backtest.clone(),
            retry: settings.retry.clone(),
            repository: None,
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn PortfolioRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Run the backtest over every trading day in `[start, end]`
    pub fn run(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<BacktestResult> {
        let started = Instant::now();

        self.validate(start, end)?;
        let mut state = self.initialize()?;

        info!(
            %start,
            %end,
            symbols = state.universe.len(),
            strategies = self.registry.len(),
            capital = self.backtest.initial_capital,
            "Starting backtest"
        );

        self.iterate(&mut state, start, end, cancel)?;
        let result = self.finalize(state, start, end, started);

        info!(
            trades = result.trades.len(),
            final_equity = result.final_equity,
            total_return = result.metrics.total_return,
            sharpe = result.metrics.sharpe_ratio,
            cancelled = result.cancelled,
            elapsed_ms = result.execution_time_ms,
            "Backtest complete"
        );

        Ok(result)
    }

    fn validate(&self, start: NaiveDate, end: NaiveDate) -> Result<()> {
        self.analysis.validate()?;
        self.backtest.validate()?;

        if start >= end {
            return Err(EngineError::Configuration(format!(
                "start date {} must be before end date {}",
                start, end
            )));
        }
        if self.registry.is_empty() {
            return Err(EngineError::Configuration(
                "no strategies registered".to_string(),
            ));
        }

        let (first, last) = self.provider.available_range().ok_or_else(|| {
            EngineError::Configuration("data provider has no data".to_string())
        })?;
        if start < first || end > last {
            return Err(EngineError::Configuration(format!(
                "range {} to {} is outside available data {} to {}",
                start, end, first, last
            )));
        }
        Ok(())
    }

    fn initialize(&self) -> Result<RunState> {
        let mut universe = BTreeMap::new();
        let mut diagnostics = Vec::new();

        for sector in &self.analysis.sectors {
            match with_retry(&self.retry, "list_symbols", || self.provider.list_symbols(sector)) {
                Ok(symbols) => {
                    for symbol in symbols {
                        universe.entry(symbol).or_insert_with(|| sector.clone());
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(sector = %sector, error = %e, "Sector listing failed, skipping");
                    diagnostics.push(Diagnostic::SkippedItem {
                        symbol: sector.clone(),
                        strategy: None,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if universe.is_empty() {
            return Err(EngineError::Configuration(format!(
                "no symbols found in sectors {:?}",
                self.analysis.sectors
            )));
        }

        Ok(RunState {
            portfolio: PortfolioSimulator::new(&self.backtest, self.analysis.max_position_size),
            universe,
            equity_curve: Vec::new(),
            diagnostics,
            total_signals: 0,
            gap_streak: None,
            cancelled: false,
        })
    }

    fn iterate(
        &self,
        state: &mut RunState,
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for day in trading_days(start, Some(end)) {
            if cancel.is_cancelled() {
                info!(%day, "Backtest cancelled");
                state.cancelled = true;
                break;
            }
            self.step(state, day)?;
        }
        self.close_gap_streak(state);
        Ok(())
    }

    /// Simulate one trading day
    fn step(&self, state: &mut RunState, day: NaiveDate) -> Result<()> {
        let windows = self.windows_for(state, day)?;
        if windows.is_empty() {
            debug!(%day, "No data, treating as holiday");
            state.diagnostics.push(Diagnostic::DataGap { date: day });
            state.gap_streak = Some(match state.gap_streak {
                Some((first, _, len)) => (first, day, len + 1),
                None => (day, day, 1),
            });
            return Ok(());
        }
        self.close_gap_streak(state);

        let mut signals = self.collect_signals(state, &windows)?;
        let threshold = self.analysis.confidence_threshold;
        signals.retain(|s| s.is_exit() || (s.is_entry() && s.confidence >= threshold));
        signals.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.symbol.cmp(&b.symbol))
                .then_with(|| a.strategy.cmp(&b.strategy))
        });
        self.apply_signals(state, day, &windows, &signals);

        let closes: BTreeMap<String, f64> = windows
            .iter()
            .filter_map(|(symbol, w)| w.latest().map(|b| (symbol.clone(), b.close)))
            .collect();
        state.portfolio.mark_to_market(&closes);

        let exits = self.position_exits(state, &windows);
        self.apply_signals(state, day, &windows, &exits);

        if let Err(e) = state.portfolio.verify_invariants() {
            error!(%day, error = %e, "Portfolio invariant violated");
            return Err(invariant_on(day, e));
        }
        state.diagnostics.extend(state.portfolio.take_diagnostics());

        let timestamp = windows
            .values()
            .filter_map(|w| w.latest().map(|b| b.timestamp))
            .max()
            .unwrap_or_else(|| end_of_day(day));
        state.equity_curve.push((timestamp, state.portfolio.equity()));

        Ok(())
    }

    /// Execute signals at the day's closes, in the given order
    fn apply_signals(
        &self,
        state: &mut RunState,
        day: NaiveDate,
        windows: &BTreeMap<String, SnapshotWindow>,
        signals: &[TradingSignal],
    ) {
        state.total_signals += signals.len();

        for signal in signals {
            let Some(price) = windows
                .get(&signal.symbol)
                .and_then(|w| w.latest())
                .map(|b| b.close)
            else {
                continue;
            };
            match state.portfolio.apply_signal(signal, price) {
                SignalOutcome::Opened { quantity, .. } => {
                    debug!(%day, signal = %signal.id, quantity, price, "Entry filled")
                }
                SignalOutcome::Closed(trade) => {
                    debug!(%day, signal = %signal.id, pnl = trade.pnl, "Exit filled")
                }
                SignalOutcome::Ignored(reason) => {
                    debug!(%day, signal = %signal.id, reason, "Signal ignored")
                }
                SignalOutcome::Rejected(_) => {}
            }
        }
    }

    /// Take-profit / stop-loss exits for open positions with a bar today.
    /// Positions are visited by symbol; the first strategy (in kind order)
    /// whose targets are reached closes the position.
    fn position_exits(
        &self,
        state: &mut RunState,
        windows: &BTreeMap<String, SnapshotWindow>,
    ) -> Vec<TradingSignal> {
        let mut exits = Vec::new();

        for (symbol, position) in state.portfolio.positions() {
            let Some(bar) = windows.get(symbol).and_then(|w| w.latest()) else {
                continue;
            };
            for strategy in self.registry.iter() {
                match strategy.exit_on_pnl(position, bar) {
                    Ok(Some(signal)) => {
                        debug!(symbol = %symbol, strategy = %strategy.kind(), reason = %signal.reason, "Exit target reached");
                        exits.push(signal);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(symbol = %symbol, strategy = %strategy.kind(), error = %e, "Exit check failed");
                        state.diagnostics.push(Diagnostic::SkippedItem {
                            symbol: symbol.clone(),
                            strategy: Some(strategy.kind()),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        exits
    }

    /// Windows of the symbols that have a bar on `day`
    fn windows_for(&self, state: &mut RunState, day: NaiveDate) -> Result<BTreeMap<String, SnapshotWindow>> {
        let as_of = end_of_day(day);
        let lookback = self.registry.max_lookback().max(1);
        let mut windows = BTreeMap::new();

        for symbol in state.universe.keys() {
            let fetched = with_retry(&self.retry, "get_snapshot_window", || {
                self.provider.get_snapshot_window(symbol, as_of, lookback)
            });
            match fetched {
                Ok(window) => {
                    if window.latest().map(|b| b.trading_date()) == Some(day) {
                        windows.insert(symbol.clone(), window);
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(%day, symbol = %symbol, error = %e, "Snapshot fetch failed, skipping symbol for the day");
                    state.diagnostics.push(Diagnostic::SkippedItem {
                        symbol: symbol.clone(),
                        strategy: None,
                        reason: format!("{}: {}", day, e),
                    });
                }
            }
        }
        Ok(windows)
    }

    fn collect_signals(
        &self,
        state: &mut RunState,
        windows: &BTreeMap<String, SnapshotWindow>,
    ) -> Result<Vec<TradingSignal>> {
        let mut signals = Vec::new();

        for (symbol, window) in windows {
            for strategy in self.registry.iter() {
                match evaluate_guarded(strategy.as_ref(), window, &self.analysis) {
                    Ok(Some(signal)) if signal.symbol != *symbol => {
                        warn!(signal = %signal.id, item = %symbol, "Signal outside the universe, dropping");
                        state.diagnostics.push(Diagnostic::OutOfUniverse {
                            signal_id: signal.id,
                            symbol: signal.symbol,
                        });
                    }
                    Ok(Some(signal)) => signals.push(signal),
                    Ok(None) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(symbol = %symbol, strategy = %strategy.kind(), error = %e, "Strategy evaluation failed");
                        state.diagnostics.push(Diagnostic::SkippedItem {
                            symbol: symbol.clone(),
                            strategy: Some(strategy.kind()),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        Ok(signals)
    }

    fn close_gap_streak(&self, state: &mut RunState) {
        if let Some((from, to, len)) = state.gap_streak.take() {
            if len > self.backtest.max_gap_days {
                warn!(%from, %to, days = len, "Long run of days without data");
                state.diagnostics.push(Diagnostic::DataQualityWarning {
                    from,
                    to,
                    consecutive_days: len,
                });
            }
        }
    }

    fn finalize(
        &self,
        mut state: RunState,
        start: NaiveDate,
        end: NaiveDate,
        started: Instant,
    ) -> BacktestResult {
        if let Some((timestamp, equity)) = state.equity_curve.last_mut() {
            let liquidated = state.portfolio.liquidate_all(*timestamp, "end of backtest");
            if !liquidated.is_empty() {
                debug!(positions = liquidated.len(), "Liquidated open positions");
            }
            *equity = state.portfolio.equity();
        }
        state.diagnostics.extend(state.portfolio.take_diagnostics());

        let trades = state.portfolio.trades().to_vec();
        let metrics = RiskMetricsCalculator::new(self.backtest.risk_free_rate)
            .calculate(&state.equity_curve, &trades);
        let drawdown_curve = drawdown_curve(&state.equity_curve);

        let mut portfolio_id = None;
        if let Some(repository) = &self.repository {
            let as_of = state
                .equity_curve
                .last()
                .map(|(ts, _)| *ts)
                .unwrap_or_else(|| end_of_day(end));
            match repository.save(&state.portfolio.snapshot(as_of)) {
                Ok(id) => portfolio_id = Some(id),
                Err(e) => {
                    warn!(error = %e, "Saving portfolio failed");
                    state.diagnostics.push(Diagnostic::RepositoryFailed {
                        reason: e.to_string(),
                    });
                }
            }
        }

        BacktestResult {
            metrics,
            equity_curve: state.equity_curve,
            drawdown_curve,
            trades,
            start_date: start,
            end_date: end,
            initial_capital: state.portfolio.initial_capital(),
            final_equity: state.portfolio.equity(),
            total_signals: state.total_signals,
            rejected_signals: state.portfolio.rejected_count(),
            diagnostics: state.diagnostics,
            cancelled: state.cancelled,
            portfolio_id,
            execution_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Attach the simulated day to an invariant violation
fn invariant_on(day: NaiveDate, err: EngineError) -> EngineError {
    match err {
        EngineError::SimulationInvariant(message) => {
            EngineError::SimulationInvariant(format!("{} on {}", message, day))
        }
        other => other,
    }
}

fn end_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN))
        .and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{flat_series, generate_series_with_moves, InMemoryProvider, SyntheticUniverse};
    use crate::repository::InMemoryRepository;
    use crate::strategies::{ExitTargets, Strategy};
    use approx::assert_relative_eq;
    use common::{MarketSnapshot, PortfolioSnapshot, SignalDirection, StrategyKind};
    use std::collections::HashMap;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    /// Fires a fixed (direction, confidence) per trading date
    struct Scripted {
        script: Vec<(NaiveDate, SignalDirection, f64)>,
    }

    impl Strategy for Scripted {
        fn kind(&self) -> StrategyKind {
            StrategyKind::Momentum
        }

        fn min_lookback(&self) -> usize {
            1
        }

        fn evaluate(&self, window: &SnapshotWindow, _: &AnalysisConfig) -> Result<Option<TradingSignal>> {
            let latest = window.latest().unwrap();
            self.script
                .iter()
                .find(|(d, _, _)| *d == latest.trading_date())
                .map(|(_, direction, confidence)| {
                    TradingSignal::new(self.kind(), latest, *direction, *confidence)
                })
                .transpose()
        }
    }

    fn scripted(script: Vec<(NaiveDate, SignalDirection, f64)>) -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(Scripted { script }));
        registry
    }

    fn settings(max_position: f64) -> EngineSettings {
        let mut settings = EngineSettings::default();
        settings.analysis = AnalysisConfig::default()
            .with_sectors(vec!["S1".to_string()])
            .with_max_position_size(max_position);
        settings.retry = RetryPolicy::immediate();
        settings
    }

    fn single_symbol(bars: Vec<MarketSnapshot>) -> Arc<InMemoryProvider> {
        Arc::new(InMemoryProvider::new().with_series("S1", "X", bars))
    }

    #[test]
    fn test_enter_then_exit_round_trip() {
        let provider = single_symbol(generate_series_with_moves("X", "S1", monday(), 2, 100.0, &[(1, 0.1, 1.0)]));
        let registry = scripted(vec![
            (date(1), SignalDirection::Enter, 90.0),
            (date(2), SignalDirection::Exit, 40.0),
        ]);
        let engine = BacktestEngine::new(provider, registry, &settings(0.5));

        let result = engine.run(date(1), date(2), &CancellationToken::new()).unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.equity_curve.len(), 2);
        let trade = &result.trades[0];
        assert_eq!(trade.quantity, 500.0);
        assert_relative_eq!(trade.pnl, 5_000.0, epsilon = 1e-6);
        assert_eq!(result.metrics.win_rate, 1.0);
        assert_relative_eq!(result.final_equity, 105_000.0, epsilon = 1e-6);
        assert_relative_eq!(result.metrics.total_return, 0.05, epsilon = 1e-9);
        assert_eq!(result.total_signals, 2);
        assert!(!result.cancelled);
    }

    /// Enters each listed symbol on one date with its own confidence
    struct PerSymbolEntries {
        day: NaiveDate,
        confidence: HashMap<&'static str, f64>,
    }

    impl Strategy for PerSymbolEntries {
        fn kind(&self) -> StrategyKind {
            StrategyKind::Sentiment
        }

        fn min_lookback(&self) -> usize {
            1
        }

        fn evaluate(&self, window: &SnapshotWindow, _: &AnalysisConfig) -> Result<Option<TradingSignal>> {
            let latest = window.latest().unwrap();
            match self.confidence.get(window.symbol()) {
                Some(confidence) if latest.trading_date() == self.day => {
                    TradingSignal::new(self.kind(), latest, SignalDirection::Enter, *confidence).map(Some)
                }
                _ => Ok(None),
            }
        }
    }

    /// Never signals; only applies exit targets to open positions
    struct TargetsOnly(ExitTargets);

    impl Strategy for TargetsOnly {
        fn kind(&self) -> StrategyKind {
            StrategyKind::Volume
        }

        fn min_lookback(&self) -> usize {
            1
        }

        fn evaluate(&self, _: &SnapshotWindow, _: &AnalysisConfig) -> Result<Option<TradingSignal>> {
            Ok(None)
        }

        fn exit_targets(&self) -> Option<ExitTargets> {
            Some(self.0)
        }
    }

    /// Two symbols at 100 competing for 1_000 of cash on Jan 2
    fn competing_entries(a: f64, b: f64) -> BacktestResult {
        let provider = Arc::new(
            InMemoryProvider::new()
                .with_series("S1", "A", flat_series("A", "S1", monday(), 5, 100.0))
                .with_series("S1", "B", flat_series("B", "S1", monday(), 5, 100.0)),
        );
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(PerSymbolEntries {
            day: date(2),
            confidence: [("A", a), ("B", b)].into_iter().collect(),
        }));
        let mut settings = settings(1.0);
        settings.backtest = settings.backtest.with_capital(1_000.0);

        BacktestEngine::new(provider, registry, &settings)
            .run(date(1), date(5), &CancellationToken::new())
            .unwrap()
    }

    fn rejected_symbols(result: &BacktestResult) -> Vec<&str> {
        result
            .diagnostics
            .iter()
            .filter_map(|d| match d {
                Diagnostic::RejectedSignal { symbol, .. } => Some(symbol.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_higher_confidence_entry_fills_first() {
        let result = competing_entries(82.0, 90.0);

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].symbol, "B");
        assert_eq!(result.trades[0].quantity, 10.0);
        assert_eq!(rejected_symbols(&result), vec!["A"]);
        assert_eq!(result.rejected_signals, 1);
    }

    #[test]
    fn test_equal_confidence_entries_fill_by_symbol() {
        let result = competing_entries(85.0, 85.0);

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].symbol, "A");
        assert_eq!(rejected_symbols(&result), vec!["B"]);
    }

    #[test]
    fn test_stop_loss_closes_position() {
        // Entry at 100 on Jan 1, close 94 on Jan 3
        let provider = single_symbol(generate_series_with_moves("X", "S1", monday(), 5, 100.0, &[(2, -0.06, 1.0)]));
        let mut registry = scripted(vec![(date(1), SignalDirection::Enter, 90.0)]);
        registry.register(Arc::new(TargetsOnly(ExitTargets::new(10.0, 5.0))));
        let engine = BacktestEngine::new(provider, registry, &settings(0.5));

        let result = engine.run(date(1), date(5), &CancellationToken::new()).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_date.date_naive(), date(3));
        assert_relative_eq!(trade.exit_price, 94.0, epsilon = 1e-9);
        assert!(trade.exit_reason.starts_with("stop loss"));
        assert_relative_eq!(trade.pnl, -500.0 * 6.0, epsilon = 1e-6);
        assert_eq!(result.total_signals, 2);
    }

    #[test]
    fn test_flat_market_never_trades() {
        let mut provider = InMemoryProvider::new();
        for symbol in ["A", "B", "C"] {
            provider.insert_series("S1", symbol, flat_series(symbol, "S1", monday(), 60, 25.0));
        }
        let mut settings = settings(0.5);
        settings.analysis.confidence_threshold = 1.0;
        settings.backtest = settings
            .backtest
            .with_transaction_cost(3.0)
            .with_risk_free_rate(0.02);
        let end = trading_days(monday(), None).nth(59).unwrap();

        let result = BacktestEngine::new(Arc::new(provider), StrategyRegistry::all(), &settings)
            .run(date(1), end, &CancellationToken::new())
            .unwrap();

        assert!(result.trades.is_empty());
        assert_eq!(result.total_signals, 0);
        assert_eq!(result.equity_curve.len(), 60);
        assert_eq!(result.metrics.total_return, 0.0);
        assert_eq!(result.metrics.sharpe_ratio, 0.0);
        assert_eq!(result.final_equity, 100_000.0);
    }

    #[test]
    fn test_invariant_error_names_the_day() {
        let err = invariant_on(date(4), EngineError::SimulationInvariant("cash went negative".to_string()));
        assert!(matches!(
            err,
            EngineError::SimulationInvariant(ref message) if message == "cash went negative on 2024-01-04"
        ));

        let other = invariant_on(date(4), EngineError::Configuration("bad".to_string()));
        assert!(matches!(other, EngineError::Configuration(_)));
    }

    #[test]
    fn test_low_confidence_entries_are_gated() {
        let provider = single_symbol(flat_series("X", "S1", monday(), 5, 10.0));
        let registry = scripted(vec![(date(2), SignalDirection::Enter, 79.0)]);
        let engine = BacktestEngine::new(provider, registry, &settings(0.5));

        let result = engine.run(date(1), date(5), &CancellationToken::new()).unwrap();
        assert!(result.trades.is_empty());
        assert_eq!(result.total_signals, 0);
        assert_eq!(result.final_equity, 100_000.0);
    }

    #[test]
    fn test_open_positions_are_liquidated_at_the_end() {
        let provider = single_symbol(generate_series_with_moves("X", "S1", monday(), 5, 50.0, &[(4, -0.1, 1.0)]));
        let registry = scripted(vec![(date(1), SignalDirection::Enter, 95.0)]);
        let engine = BacktestEngine::new(provider, registry, &settings(0.2));

        let result = engine.run(date(1), date(5), &CancellationToken::new()).unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_reason, "end of backtest");
        assert_relative_eq!(result.trades[0].exit_price, 45.0, epsilon = 1e-9);
        let (_, last_equity) = *result.equity_curve.last().unwrap();
        assert_relative_eq!(last_equity, result.final_equity);
        assert_relative_eq!(result.final_equity, 100_000.0 - 400.0 * 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_weekends_and_holidays_are_gaps() {
        // Jan 1-5 and Jan 15-19; the week of Jan 8 is missing
        let mut bars = flat_series("X", "S1", monday(), 5, 10.0);
        bars.extend(flat_series("X", "S1", date(15), 5, 10.0));
        let provider = single_symbol(bars);
        let mut settings = settings(0.5);
        settings.backtest = settings.backtest.with_max_gap_days(3);
        let engine = BacktestEngine::new(provider, scripted(vec![]), &settings);

        let result = engine.run(date(1), date(19), &CancellationToken::new()).unwrap();

        assert_eq!(result.equity_curve.len(), 10);
        let gaps = result
            .diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::DataGap { .. }))
            .count();
        assert_eq!(gaps, 5);
        let warnings: Vec<&Diagnostic> = result
            .diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::DataQualityWarning { .. }))
            .collect();
        assert_eq!(
            warnings,
            vec![&Diagnostic::DataQualityWarning {
                from: date(8),
                to: date(12),
                consecutive_days: 5
            }]
        );
    }

    #[test]
    fn test_invalid_ranges_are_configuration_errors() {
        let provider = single_symbol(flat_series("X", "S1", monday(), 5, 10.0));
        let engine = BacktestEngine::new(provider, scripted(vec![]), &settings(0.5));
        let cancel = CancellationToken::new();

        assert!(matches!(
            engine.run(date(3), date(3), &cancel),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            engine.run(date(1), date(20), &cancel),
            Err(EngineError::Configuration(_))
        ));

        let empty = BacktestEngine::new(Arc::new(InMemoryProvider::new()), scripted(vec![]), &settings(0.5));
        assert!(matches!(
            empty.run(date(1), date(5), &cancel),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_cancelled_run_returns_partial_result() {
        let provider = single_symbol(flat_series("X", "S1", monday(), 5, 10.0));
        let engine = BacktestEngine::new(provider, scripted(vec![]), &settings(0.5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine.run(date(1), date(5), &cancel).unwrap();
        assert!(result.cancelled);
        assert!(result.equity_curve.is_empty());
        assert_eq!(result.final_equity, 100_000.0);
    }

    #[test]
    fn test_portfolio_is_saved() {
        let provider = single_symbol(flat_series("X", "S1", monday(), 5, 10.0));
        let repository = Arc::new(InMemoryRepository::new());
        let engine = BacktestEngine::new(provider, scripted(vec![]), &settings(0.5))
            .with_repository(repository.clone());

        let result = engine.run(date(1), date(5), &CancellationToken::new()).unwrap();
        let id = result.portfolio_id.unwrap();
        assert_eq!(repository.load(&id).unwrap().cash, 100_000.0);
    }

    struct BrokenRepository;

    impl PortfolioRepository for BrokenRepository {
        fn save(&self, _: &PortfolioSnapshot) -> Result<String> {
            Err(EngineError::Repository("disk full".to_string()))
        }

        fn load(&self, id: &str) -> Result<PortfolioSnapshot> {
            Err(EngineError::Repository(format!("no portfolio {}", id)))
        }
    }

    #[test]
    fn test_repository_failure_is_a_diagnostic() {
        let provider = single_symbol(flat_series("X", "S1", monday(), 5, 10.0));
        let engine = BacktestEngine::new(provider, scripted(vec![]), &settings(0.5))
            .with_repository(Arc::new(BrokenRepository));

        let result = engine.run(date(1), date(5), &CancellationToken::new()).unwrap();
        assert!(result.portfolio_id.is_none());
        assert!(result
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::RepositoryFailed { .. })));
    }

    #[test]
    fn test_synthetic_run_is_deterministic_and_consistent() {
        let provider = Arc::new(
            SyntheticUniverse::new(vec!["S1".to_string()], monday(), 130)
                .with_symbols_per_sector(8)
                .build(),
        );
        let mut settings = settings(0.2);
        settings.analysis.confidence_threshold = 75.0;
        settings.backtest.transaction_cost = 5.0;

        let run = || {
            BacktestEngine::new(Arc::clone(&provider), StrategyRegistry::all(), &settings)
                .run(date(1), NaiveDate::from_ymd_opt(2024, 6, 28).unwrap(), &CancellationToken::new())
                .unwrap()
        };
        let first = run();
        let second = run();

        assert_eq!(first.equity_curve, second.equity_curve);
        assert_eq!(first.trades, second.trades);
        assert!(first.equity_curve.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(first.metrics.max_drawdown >= 0.0 && first.metrics.max_drawdown <= 1.0);

        let realized: f64 = first.trades.iter().map(|t| t.pnl).sum();
        assert_relative_eq!(first.final_equity, 100_000.0 + realized, epsilon = 1e-6);
    }
}
