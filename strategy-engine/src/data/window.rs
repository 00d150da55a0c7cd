use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::MarketSnapshot;

/// Read-only view over a symbol's history up to "now".
///
/// Cloning is cheap (the bars are shared) and iteration can be restarted any
/// number of times. Nothing after the window's end is reachable, so a strategy
/// holding a window cannot look forward.
#[derive(Debug, Clone)]
pub struct SnapshotWindow {
    symbol: String,
    bars: Arc<[MarketSnapshot]>,
    start: usize,
    end: usize,
}

impl SnapshotWindow {
    /// Build a window over all of `bars`, which must be sorted oldest first
    pub fn new(symbol: impl Into<String>, bars: Arc<[MarketSnapshot]>) -> Self {
        let end = bars.len();
        Self {
            symbol: symbol.into(),
            bars,
            start: 0,
            end,
        }
    }

    pub fn from_vec(symbol: impl Into<String>, mut bars: Vec<MarketSnapshot>) -> Self {
        bars.sort_by_key(|b| b.timestamp);
        Self::new(symbol, bars.into())
    }

    pub fn empty(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Arc::from(Vec::new()))
    }

    /// Narrow to at most `lookback` bars ending at or before `as_of`
    pub fn as_of(&self, as_of: DateTime<Utc>, lookback: usize) -> Self {
        let visible = self.as_slice();
        let cut = visible.partition_point(|b| b.timestamp <= as_of);
        let end = self.start + cut;
        let start = end.saturating_sub(lookback).max(self.start);
        Self {
            symbol: self.symbol.clone(),
            bars: Arc::clone(&self.bars),
            start,
            end,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn as_slice(&self) -> &[MarketSnapshot] {
        &self.bars[self.start..self.end]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MarketSnapshot> {
        self.as_slice().iter()
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current ("now") snapshot
    pub fn latest(&self) -> Option<&MarketSnapshot> {
        self.as_slice().last()
    }

    /// The snapshot `n` bars before the latest
    pub fn back(&self, n: usize) -> Option<&MarketSnapshot> {
        let slice = self.as_slice();
        slice.len().checked_sub(n + 1).map(|i| &slice[i])
    }

    /// The last `n` bars (or fewer if the window is shorter)
    pub fn tail(&self, n: usize) -> &[MarketSnapshot] {
        let slice = self.as_slice();
        &slice[slice.len().saturating_sub(n)..]
    }

    pub fn closes(&self) -> Vec<f64> {
        self.iter().map(|b| b.close).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.iter().map(|b| b.volume as f64).collect()
    }

    /// Close-to-close change of the latest bar, in percent
    pub fn day_change_pct(&self) -> Option<f64> {
        let latest = self.latest()?;
        match self.back(1) {
            Some(prev) if prev.close > 0.0 => Some((latest.close / prev.close - 1.0) * 100.0),
            Some(_) => None,
            None => Some(latest.change_pct()),
        }
    }
}

impl<'a> IntoIterator for &'a SnapshotWindow {
    type Item = &'a MarketSnapshot;
    type IntoIter = std::slice::Iter<'a, MarketSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn bars(n: usize) -> Vec<MarketSnapshot> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 15, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64;
                MarketSnapshot::new(
                    "X",
                    "S1",
                    start + Duration::days(i as i64),
                    close - 0.5,
                    close + 1.0,
                    close - 1.0,
                    close,
                    1_000,
                )
            })
            .collect()
    }

    #[test]
    fn test_as_of_hides_future_bars() {
        let window = SnapshotWindow::from_vec("X", bars(10));
        let as_of = Utc.with_ymd_and_hms(2024, 1, 4, 23, 0, 0).unwrap();
        let view = window.as_of(as_of, 100);

        assert_eq!(view.len(), 4);
        assert_eq!(view.latest().unwrap().close, 103.0);
        assert!(view.iter().all(|b| b.timestamp <= as_of));
    }

    #[test]
    fn test_lookback_limits_length() {
        let window = SnapshotWindow::from_vec("X", bars(10));
        let as_of = Utc.with_ymd_and_hms(2024, 1, 8, 23, 0, 0).unwrap();
        let view = window.as_of(as_of, 3);

        assert_eq!(view.len(), 3);
        assert_eq!(view.closes(), vec![105.0, 106.0, 107.0]);
    }

    #[test]
    fn test_nested_views_never_widen() {
        let window = SnapshotWindow::from_vec("X", bars(10));
        let narrow = window.as_of(Utc.with_ymd_and_hms(2024, 1, 3, 23, 0, 0).unwrap(), 10);
        let wide = narrow.as_of(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(), 10);

        assert_eq!(wide.len(), 3);
    }

    #[test]
    fn test_iteration_is_restartable() {
        let window = SnapshotWindow::from_vec("X", bars(5));
        let first: Vec<f64> = window.iter().map(|b| b.close).collect();
        let second: Vec<f64> = (&window).into_iter().map(|b| b.close).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_back_and_day_change() {
        let window = SnapshotWindow::from_vec("X", bars(3));
        assert_eq!(window.back(0).unwrap().close, 102.0);
        assert_eq!(window.back(2).unwrap().close, 100.0);
        assert!(window.back(3).is_none());

        let change = window.day_change_pct().unwrap();
        assert!((change - (102.0 / 101.0 - 1.0) * 100.0).abs() < 1e-9);
        assert!(SnapshotWindow::empty("X").day_change_pct().is_none());
    }
}
