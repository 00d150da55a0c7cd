use common::{AnalysisConfig, Result, SignalDirection, StrategyKind, TradingSignal};

use super::{position_size, Strategy};
use crate::data::SnapshotWindow;
use crate::indicators::latest_rsi;

const RSI_PERIOD: usize = 14;
const ENTER_SCORE: f64 = 80.0;
const EXIT_SCORE: f64 = 30.0;
const MIN_CHANGE_PCT: f64 = 1.0;

/// Market sentiment read from RSI(14): ride strong optimism, leave on
/// capitulation
#[derive(Debug, Clone, Copy, Default)]
pub struct SentimentStrategy;

impl Strategy for SentimentStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sentiment
    }

    fn min_lookback(&self) -> usize {
        RSI_PERIOD + 1
    }

    fn evaluate(
        &self,
        window: &SnapshotWindow,
        config: &AnalysisConfig,
    ) -> Result<Option<TradingSignal>> {
        let (Some(latest), Some(change)) = (window.latest(), window.day_change_pct()) else {
            return Ok(None);
        };
        let closes: Vec<f64> = window.tail(RSI_PERIOD + 1).iter().map(|b| b.close).collect();
        let Some(score) = latest_rsi(&closes, RSI_PERIOD) else {
            return Ok(None);
        };

        // Exit first
        if score < EXIT_SCORE {
            let signal =
                TradingSignal::new(self.kind(), latest, SignalDirection::Exit, 100.0 - score)?
                    .with_reason(format!("Sentiment score {:.1} signals capitulation", score));
            return Ok(Some(signal));
        }

        if score > ENTER_SCORE && change > MIN_CHANGE_PCT {
            let confidence = score * 0.9;
            let signal = TradingSignal::new(self.kind(), latest, SignalDirection::Enter, confidence)?
                .with_position_size(position_size(config, confidence, 1.0))?
                .with_reason(format!(
                    "Sentiment score {:.1}, price {:+.1}%",
                    score, change
                ));
            return Ok(Some(signal));
        }

        Ok(None)
    }
}
