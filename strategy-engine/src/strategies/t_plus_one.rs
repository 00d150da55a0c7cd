use common::{AnalysisConfig, MarketSnapshot, Result, SignalDirection, StrategyKind, TradingSignal};

use super::{position_size, ExitTargets, Strategy};
use crate::data::SnapshotWindow;

const DIP_PCT: f64 = -2.0;
const ENTRY_CONFIDENCE: f64 = 82.0;
const EXIT_CONFIDENCE: f64 = 85.0;

/// Buy a late-session dip at the close and sell it the next session
#[derive(Debug, Clone, Copy, Default)]
pub struct TPlusOneStrategy;

impl Strategy for TPlusOneStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TPlusOne
    }

    fn min_lookback(&self) -> usize {
        3
    }

    fn exit_targets(&self) -> Option<ExitTargets> {
        Some(ExitTargets::new(8.0, 5.0))
    }

    fn evaluate(
        &self,
        window: &SnapshotWindow,
        config: &AnalysisConfig,
    ) -> Result<Option<TradingSignal>> {
        let (Some(today), Some(yesterday), Some(before)) =
            (window.back(0), window.back(1), window.back(2))
        else {
            return Ok(None);
        };

        if change_pct(before, yesterday) < DIP_PCT {
            let signal =
                TradingSignal::new(self.kind(), today, SignalDirection::Exit, EXIT_CONFIDENCE)?
                    .with_reason("Next session after a dip entry");
            return Ok(Some(signal));
        }

        let change = change_pct(yesterday, today);
        if change < DIP_PCT {
            let signal =
                TradingSignal::new(self.kind(), today, SignalDirection::Enter, ENTRY_CONFIDENCE)?
                    .with_position_size(position_size(config, ENTRY_CONFIDENCE, 1.0))?
                    .with_reason(format!("Closing dip of {:.1}%", change));
            return Ok(Some(signal));
        }

        Ok(None)
    }
}

fn change_pct(prev: &MarketSnapshot, cur: &MarketSnapshot) -> f64 {
    if prev.close > 0.0 {
        (cur.close / prev.close - 1.0) * 100.0
    } else {
        0.0
    }
}
