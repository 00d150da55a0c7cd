//! Signal-generating strategies.
//!
//! Strategies are pure functions of a [`SnapshotWindow`] and an
//! [`AnalysisConfig`]: the same window always yields the same signal, which is
//! what lets the scanner memoize evaluations in [`EvaluationCache`].

pub mod cache;
pub mod momentum;
pub mod sentiment;
pub mod t_plus_one;
pub mod volume;

pub use cache::{CacheKey, CacheStats, EvaluationCache};
pub use momentum::MomentumStrategy;
pub use sentiment::SentimentStrategy;
pub use t_plus_one::TPlusOneStrategy;
pub use volume::VolumeStrategy;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use common::{
    AnalysisConfig, EngineError, MarketSnapshot, Position, Result, SignalDirection, StrategyKind,
    TradingSignal,
};
use tracing::debug;

use crate::data::SnapshotWindow;

pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Bars needed before `evaluate` is meaningful
    fn min_lookback(&self) -> usize;

    /// Inspect the window ending at "now" and optionally emit a signal for
    /// the window's symbol
    fn evaluate(
        &self,
        window: &SnapshotWindow,
        config: &AnalysisConfig,
    ) -> Result<Option<TradingSignal>>;

    /// Take-profit and stop-loss bounds applied to open positions
    fn exit_targets(&self) -> Option<ExitTargets> {
        None
    }

    /// Exit signal for an open position whose close at `bar` has reached one
    /// of this strategy's exit targets
    fn exit_on_pnl(
        &self,
        position: &Position,
        bar: &MarketSnapshot,
    ) -> Result<Option<TradingSignal>> {
        let Some(targets) = self.exit_targets() else {
            return Ok(None);
        };
        if position.symbol != bar.symbol || !(position.avg_entry_price > 0.0) {
            return Ok(None);
        }

        let change = (bar.close / position.avg_entry_price - 1.0) * 100.0;
        let Some(target) = targets.breached_by(change) else {
            return Ok(None);
        };

        let signal = TradingSignal::new(self.kind(), bar, SignalDirection::Exit, PNL_EXIT_CONFIDENCE)?
            .with_reason(format!(
                "{} at {:+.1}% from entry {:.2}",
                target, change, position.avg_entry_price
            ));
        Ok(Some(signal))
    }
}

const PNL_EXIT_CONFIDENCE: f64 = 80.0;

/// Exit bounds in percent of the average entry price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitTargets {
    pub take_profit_pct: f64,
    /// Positive number: 5.0 exits at -5%
    pub stop_loss_pct: f64,
}

impl ExitTargets {
    pub const fn new(take_profit_pct: f64, stop_loss_pct: f64) -> Self {
        Self {
            take_profit_pct,
            stop_loss_pct,
        }
    }

    /// Name of the bound a change (percent) reaches, if any
    pub fn breached_by(&self, change_pct: f64) -> Option<&'static str> {
        if change_pct >= self.take_profit_pct {
            Some("take profit")
        } else if change_pct <= -self.stop_loss_pct {
            Some("stop loss")
        } else {
            None
        }
    }
}

/// Create a strategy by kind
pub fn create_strategy(kind: StrategyKind) -> Arc<dyn Strategy> {
    match kind {
        StrategyKind::Momentum => Arc::new(MomentumStrategy),
        StrategyKind::Volume => Arc::new(VolumeStrategy),
        StrategyKind::Sentiment => Arc::new(SentimentStrategy),
        StrategyKind::TPlusOne => Arc::new(TPlusOneStrategy),
    }
}

pub fn create_all_strategies() -> Vec<Arc<dyn Strategy>> {
    StrategyKind::ALL.iter().map(|k| create_strategy(*k)).collect()
}

/// Suggested capital fraction: max position size scaled by confidence and a
/// per-strategy factor
pub(crate) fn position_size(config: &AnalysisConfig, confidence: f64, factor: f64) -> f64 {
    (config.max_position_size * confidence / 100.0 * factor).clamp(0.0, 1.0)
}

/// Evaluate a strategy with the window-length check and panic isolation the
/// scanner and engine both rely on. A short window yields no signal; a panic
/// becomes a [`EngineError::StrategyEvaluation`] for that item only.
pub fn evaluate_guarded(
    strategy: &dyn Strategy,
    window: &SnapshotWindow,
    config: &AnalysisConfig,
) -> Result<Option<TradingSignal>> {
    if window.len() < strategy.min_lookback() {
        debug!(
            symbol = window.symbol(),
            strategy = %strategy.kind(),
            bars = window.len(),
            needed = strategy.min_lookback(),
            "Window shorter than lookback, skipping"
        );
        return Ok(None);
    }

    match panic::catch_unwind(AssertUnwindSafe(|| strategy.evaluate(window, config))) {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "strategy panicked".to_string());
            Err(EngineError::StrategyEvaluation {
                strategy: strategy.kind().to_string(),
                symbol: window.symbol().to_string(),
                reason,
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::NaiveDate;
    use common::MarketSnapshot;

    use crate::data::{generate_series_with_moves, SnapshotWindow};

    pub fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    pub fn window_with_moves(days: usize, moves: &[(usize, f64, f64)]) -> SnapshotWindow {
        let bars: Vec<MarketSnapshot> =
            generate_series_with_moves("X", "S1", monday(), days, 100.0, moves);
        SnapshotWindow::from_vec("X", bars)
    }

    pub fn window_from_closes(closes: &[f64]) -> SnapshotWindow {
        let moves: Vec<(usize, f64, f64)> = closes
            .windows(2)
            .enumerate()
            .map(|(i, w)| (i + 1, w[1] / w[0] - 1.0, 1.0))
            .collect();
        let bars = generate_series_with_moves("X", "S1", monday(), closes.len(), closes[0], &moves);
        SnapshotWindow::from_vec("X", bars)
    }
}
