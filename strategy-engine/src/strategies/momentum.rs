use common::{AnalysisConfig, Result, SignalDirection, StrategyKind, TradingSignal};

use super::{position_size, ExitTargets, Strategy};
use crate::data::SnapshotWindow;
use crate::indicators::{latest_sma, mean};

const LOOKBACK: usize = 6;
const MIN_CHANGE_PCT: f64 = 5.0;
const VOLUME_MULTIPLE: f64 = 2.0;
const EXIT_CONFIDENCE: f64 = 85.0;
const SIZE_FACTOR: f64 = 0.8;

/// Momentum breakout: a strong up day on at least twice the recent volume.
/// Exits once price slips below its short SMA on a down day.
#[derive(Debug, Clone, Copy, Default)]
pub struct MomentumStrategy;

impl Strategy for MomentumStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Momentum
    }

    fn min_lookback(&self) -> usize {
        LOOKBACK
    }

    fn exit_targets(&self) -> Option<ExitTargets> {
        Some(ExitTargets::new(12.0, 8.0))
    }

    fn evaluate(
        &self,
        window: &SnapshotWindow,
        config: &AnalysisConfig,
    ) -> Result<Option<TradingSignal>> {
        let Some(change) = window.day_change_pct() else {
            return Ok(None);
        };

        if let Some(signal) = self.check_exit(window, change)? {
            return Ok(Some(signal));
        }

        self.check_entry(window, change, config)
    }
}

impl MomentumStrategy {
    fn check_entry(
        &self,
        window: &SnapshotWindow,
        change: f64,
        config: &AnalysisConfig,
    ) -> Result<Option<TradingSignal>> {
        let Some(latest) = window.latest() else {
            return Ok(None);
        };
        let volumes = window.volumes();
        let recent = &volumes[volumes.len().saturating_sub(LOOKBACK)..];
        let prior = recent.split_last().map_or(&[][..], |(_, prior)| prior);
        let Some(avg_volume) = mean(prior) else {
            return Ok(None);
        };

        if change <= MIN_CHANGE_PCT || (latest.volume as f64) <= avg_volume * VOLUME_MULTIPLE {
            return Ok(None);
        }

        let confidence = (60.0 + 4.0 * change).min(95.0);
        let signal = TradingSignal::new(self.kind(), latest, SignalDirection::Enter, confidence)?
            .with_position_size(position_size(config, confidence, SIZE_FACTOR))?
            .with_reason(format!(
                "Up {:.1}% on {:.1}x average volume",
                change,
                latest.volume as f64 / avg_volume.max(1.0)
            ));
        Ok(Some(signal))
    }

    fn check_exit(&self, window: &SnapshotWindow, change: f64) -> Result<Option<TradingSignal>> {
        let Some(latest) = window.latest() else {
            return Ok(None);
        };
        let closes: Vec<f64> = window.tail(LOOKBACK).iter().map(|b| b.close).collect();
        let Some(sma) = latest_sma(&closes, LOOKBACK) else {
            return Ok(None);
        };

        if change >= 0.0 || latest.close >= sma {
            return Ok(None);
        }

        let signal = TradingSignal::new(self.kind(), latest, SignalDirection::Exit, EXIT_CONFIDENCE)?
            .with_reason(format!(
                "Close {:.2} below SMA({}) {:.2} after a down day",
                latest.close, LOOKBACK, sma
            ));
        Ok(Some(signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_breakout_on_volume_enters() {
        let window = window_with_moves(6, &[(5, 0.06, 3.0)]);
        let signal = MomentumStrategy
            .evaluate(&window, &AnalysisConfig::default())
            .unwrap()
            .unwrap();

        assert_eq!(signal.direction, SignalDirection::Enter);
        assert_relative_eq!(signal.confidence, 84.0, epsilon = 1e-9);
        assert_relative_eq!(signal.position_size, 0.1 * 0.84 * 0.8, epsilon = 1e-9);
        assert_eq!(signal.symbol, "X");
    }

    #[test]
    fn test_breakout_without_volume_is_ignored() {
        let window = window_with_moves(6, &[(5, 0.06, 1.5)]);
        let result = MomentumStrategy.evaluate(&window, &AnalysisConfig::default()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_confidence_is_capped() {
        let window = window_with_moves(6, &[(5, 0.20, 4.0)]);
        let signal = MomentumStrategy
            .evaluate(&window, &AnalysisConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(signal.confidence, 95.0);
    }

    #[test]
    fn test_down_day_below_sma_exits() {
        let window = window_with_moves(6, &[(5, -0.01, 1.0)]);
        let signal = MomentumStrategy
            .evaluate(&window, &AnalysisConfig::default())
            .unwrap()
            .unwrap();

        assert_eq!(signal.direction, SignalDirection::Exit);
        assert_eq!(signal.confidence, EXIT_CONFIDENCE);
    }

    #[test]
    fn test_quiet_market_emits_nothing() {
        let window = window_with_moves(10, &[]);
        assert!(MomentumStrategy
            .evaluate(&window, &AnalysisConfig::default())
            .unwrap()
            .is_none());
    }
}
