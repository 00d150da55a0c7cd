use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use common::{EngineError, MarketSnapshot, Result};

use super::{DataProvider, SnapshotWindow};

/// Provider backed by fully loaded series, used for file data, synthetic
/// data and tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    sectors: BTreeMap<String, Vec<String>>,
    series: HashMap<String, SnapshotWindow>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a symbol's series under a sector. Bars are sorted by timestamp.
    pub fn insert_series(&mut self, sector: &str, symbol: &str, bars: Vec<MarketSnapshot>) {
        let symbols = self.sectors.entry(sector.to_string()).or_default();
        if !symbols.iter().any(|s| s == symbol) {
            symbols.push(symbol.to_string());
            symbols.sort();
        }
        self.series
            .insert(symbol.to_string(), SnapshotWindow::from_vec(symbol, bars));
    }

    pub fn with_series(mut self, sector: &str, symbol: &str, bars: Vec<MarketSnapshot>) -> Self {
        self.insert_series(sector, symbol, bars);
        self
    }

    pub fn sectors(&self) -> impl Iterator<Item = &str> {
        self.sectors.keys().map(|s| s.as_str())
    }

    pub fn symbol_count(&self) -> usize {
        self.series.len()
    }
}

impl DataProvider for InMemoryProvider {
    fn list_symbols(&self, sector: &str) -> Result<Vec<String>> {
        Ok(self.sectors.get(sector).cloned().unwrap_or_default())
    }

    fn get_snapshot_window(
        &self,
        symbol: &str,
        as_of: DateTime<Utc>,
        lookback: usize,
    ) -> Result<SnapshotWindow> {
        self.series
            .get(symbol)
            .map(|series| series.as_of(as_of, lookback))
            .ok_or_else(|| EngineError::DataLoadError(format!("Unknown symbol: {}", symbol)))
    }

    fn available_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        let mut range: Option<(NaiveDate, NaiveDate)> = None;
        for series in self.series.values() {
            let (Some(first), Some(last)) = (series.as_slice().first(), series.latest()) else {
                continue;
            };
            let (lo, hi) = (first.trading_date(), last.trading_date());
            range = Some(match range {
                Some((a, b)) => (a.min(lo), b.max(hi)),
                None => (lo, hi),
            });
        }
        range
    }
}

impl<P: DataProvider + ?Sized> DataProvider for Arc<P> {
    fn list_symbols(&self, sector: &str) -> Result<Vec<String>> {
        (**self).list_symbols(sector)
    }

    fn get_snapshot_window(
        &self,
        symbol: &str,
        as_of: DateTime<Utc>,
        lookback: usize,
    ) -> Result<SnapshotWindow> {
        (**self).get_snapshot_window(symbol, as_of, lookback)
    }

    fn available_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        (**self).available_range()
    }
}
