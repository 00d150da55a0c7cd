use common::{AnalysisConfig, Result, SignalDirection, StrategyKind, TradingSignal};

use super::{position_size, ExitTargets, Strategy};
use crate::data::SnapshotWindow;
use crate::indicators::mean;

const LOOKBACK: usize = 6;
const MIN_VOLUME_RATIO: f64 = 3.0;
const SIZE_FACTOR: f64 = 0.7;

/// Volume surge: follow the direction of a day trading at more than three
/// times its recent average volume
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeStrategy;

impl Strategy for VolumeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Volume
    }

    fn min_lookback(&self) -> usize {
        LOOKBACK
    }

    fn exit_targets(&self) -> Option<ExitTargets> {
        Some(ExitTargets::new(15.0, 10.0))
    }

    fn evaluate(
        &self,
        window: &SnapshotWindow,
        config: &AnalysisConfig,
    ) -> Result<Option<TradingSignal>> {
        let (Some(latest), Some(change)) = (window.latest(), window.day_change_pct()) else {
            return Ok(None);
        };

        let volumes = window.volumes();
        let recent = &volumes[volumes.len().saturating_sub(LOOKBACK)..];
        let prior = recent.split_last().map_or(&[][..], |(_, prior)| prior);
        let avg_volume = match mean(prior) {
            Some(avg) if avg > 0.0 => avg,
            _ => return Ok(None),
        };

        let ratio = latest.volume as f64 / avg_volume;
        if ratio <= MIN_VOLUME_RATIO {
            return Ok(None);
        }

        let direction = if change > 0.0 {
            SignalDirection::Enter
        } else if change < 0.0 {
            SignalDirection::Exit
        } else {
            return Ok(None);
        };

        let confidence = (ratio * 10.0).min(90.0);
        let mut signal = TradingSignal::new(self.kind(), latest, direction, confidence)?
            .with_reason(format!("Volume {:.1}x average, price {:+.1}%", ratio, change));
        if direction == SignalDirection::Enter {
            signal = signal.with_position_size(position_size(config, confidence, SIZE_FACTOR))?;
        }
        Ok(Some(signal))
    }
}
