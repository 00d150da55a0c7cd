use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use common::{EngineError, MarketSnapshot, Result};
use tracing::{debug, info};

use super::{load_file, InMemoryProvider};

/// Load snapshots from a CSV file.
///
/// Expected columns: timestamp, open, high, low, close, volume
pub fn load_csv(path: &Path, symbol: &str, sector: &str) -> Result<Vec<MarketSnapshot>> {
    let file = File::open(path).map_err(|e| EngineError::DataLoadError(e.to_string()))?;
    let reader = BufReader::new(file);
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let mut bars = Vec::new();

    for result in csv_reader.records() {
        let record = result.map_err(|e| EngineError::CsvError(e.to_string()))?;

        if record.len() < 6 {
            continue;
        }

        let timestamp = parse_timestamp(&record[0])?;
        let open = parse_price(&record[1], "open")?;
        let high = parse_price(&record[2], "high")?;
        let low = parse_price(&record[3], "low")?;
        let close = parse_price(&record[4], "close")?;
        let volume: u64 = record[5]
            .trim()
            .parse::<f64>()
            .map(|v| v.max(0.0) as u64)
            .map_err(|_| EngineError::CsvError(format!("Invalid volume: {}", &record[5])))?;

        bars.push(MarketSnapshot::new(
            symbol, sector, timestamp, open, high, low, close, volume,
        ));
    }

    Ok(bars)
}

/// Load snapshots from a JSON array of `MarketSnapshot`
pub fn load_json(path: &Path) -> Result<Vec<MarketSnapshot>> {
    let file = File::open(path).map_err(|e| EngineError::DataLoadError(e.to_string()))?;
    let reader = BufReader::new(file);
    let bars: Vec<MarketSnapshot> = serde_json::from_reader(reader)?;
    Ok(bars)
}

/// Load a universe laid out as `<dir>/<sector>/<symbol>.csv|json`
pub fn load_universe(dir: &Path) -> Result<InMemoryProvider> {
    let mut provider = InMemoryProvider::new();

    let mut sector_dirs: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    sector_dirs.sort();

    for sector_dir in sector_dirs {
        let Some(sector) = sector_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let mut files: Vec<_> = fs::read_dir(&sector_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        for path in files {
            let Some(symbol) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let bars = load_file(&path, symbol, sector)?;
            debug!(sector, symbol, bars = bars.len(), "Loaded series");
            provider.insert_series(sector, symbol, bars);
        }
    }

    info!(
        dir = %dir.display(),
        symbols = provider.symbol_count(),
        "Loaded market data universe"
    );
    Ok(provider)
}

fn parse_price(s: &str, field: &str) -> Result<f64> {
    s.trim()
        .parse()
        .map_err(|_| EngineError::CsvError(format!("Invalid {} price: {}", field, s)))
}

/// Parse timestamp from various formats
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let datetime_formats = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"];
    for fmt in &datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }

    // Daily bars without a time are stamped at the session close
    let date_formats = ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];
    for fmt in &date_formats {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(super::session_close(date));
        }
    }

    if let Ok(ts) = s.parse::<i64>() {
        if let Some(dt) = DateTime::from_timestamp(ts, 0) {
            return Ok(dt);
        }
    }

    Err(EngineError::CsvError(format!(
        "Unable to parse timestamp: {}",
        s
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataProvider;
    use chrono::{Datelike, Timelike};
    use std::io::Write;

    #[test]
    fn test_parse_timestamp_iso() {
        let ts = parse_timestamp("2024-01-15T09:30:00Z").unwrap();
        assert_eq!(ts.year(), 2024);
        assert_eq!(ts.month(), 1);
        assert_eq!(ts.day(), 15);
    }

    #[test]
    fn test_parse_timestamp_date_only_is_session_close() {
        let ts = parse_timestamp("2024-01-15").unwrap();
        assert_eq!(ts.day(), 15);
        assert_eq!(ts.hour(), 15);

        let compact = parse_timestamp("20240115").unwrap();
        assert_eq!(compact, ts);
    }

    #[test]
    fn test_parse_timestamp_unix() {
        let ts = parse_timestamp("1705312200").unwrap();
        assert!(ts.year() >= 2024);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_load_universe_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sector_dir = dir.path().join("S1");
        fs::create_dir(&sector_dir).unwrap();

        let mut file = File::create(sector_dir.join("X.csv")).unwrap();
        writeln!(file, "date,open,high,low,close,volume").unwrap();
        writeln!(file, "2024-01-02,10.0,10.5,9.8,10.2,120000").unwrap();
        writeln!(file, "2024-01-03,10.2,10.9,10.1,10.8,150000").unwrap();

        let provider = load_universe(dir.path()).unwrap();
        assert_eq!(provider.list_symbols("S1").unwrap(), vec!["X"]);

        let window = provider
            .get_snapshot_window("X", Utc::now(), 10)
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window.latest().unwrap().close, 10.8);
        assert_eq!(window.latest().unwrap().sector, "S1");
    }

    #[test]
    fn test_bad_price_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Y.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "date,open,high,low,close,volume").unwrap();
        writeln!(file, "2024-01-02,abc,10.5,9.8,10.2,120000").unwrap();

        let err = load_csv(&path, "Y", "S1").unwrap_err();
        assert!(matches!(err, EngineError::CsvError(_)));
    }
}
