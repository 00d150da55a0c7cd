pub mod loader;
pub mod memory;
pub mod retry;
pub mod synthetic;
pub mod window;

pub use loader::{load_csv, load_json, load_universe};
pub use memory::InMemoryProvider;
pub use retry::with_retry;
pub use synthetic::{
    flat_series, generate_series_with_moves, generate_synthetic_series, session_close,
    SyntheticUniverse,
};
pub use window::SnapshotWindow;

use std::path::Path;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use common::{EngineError, MarketSnapshot, Result};

/// Source of market snapshots.
///
/// Implementations must be safe to call from several scanner workers at once.
/// Transient failures are reported as [`EngineError::DataUnavailable`] and are
/// retried by callers through [`with_retry`].
pub trait DataProvider: Send + Sync {
    /// Symbols that make up a sector basket
    fn list_symbols(&self, sector: &str) -> Result<Vec<String>>;

    /// Up to `lookback` snapshots of `symbol` ending at or before `as_of`,
    /// oldest first
    fn get_snapshot_window(
        &self,
        symbol: &str,
        as_of: DateTime<Utc>,
        lookback: usize,
    ) -> Result<SnapshotWindow>;

    /// First and last trading dates the provider can serve
    fn available_range(&self) -> Option<(NaiveDate, NaiveDate)>;
}

/// Weekdays are trading days; exchange holidays show up as data gaps
pub fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Trading days from `start` up to and including `end` (unbounded when `None`)
pub fn trading_days(start: NaiveDate, end: Option<NaiveDate>) -> impl Iterator<Item = NaiveDate> {
    start
        .iter_days()
        .take_while(move |d| end.map_or(true, |end| *d <= end))
        .filter(|d| is_trading_day(*d))
}

/// Load snapshots from file, detecting format from extension
pub fn load_file(path: &Path, symbol: &str, sector: &str) -> Result<Vec<MarketSnapshot>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "csv" => load_csv(path, symbol, sector),
        "json" => load_json(path),
        _ => Err(EngineError::DataLoadError(format!(
            "Unsupported file format: {}",
            ext
        ))),
    }
}
