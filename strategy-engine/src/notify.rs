use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use common::{EngineError, Result, TradingSignal};
use tracing::info;

/// Receives each final scan signal
pub trait SignalNotifier: Send + Sync {
    fn notify(&self, signal: &TradingSignal) -> Result<()>;
}

/// Emits signals as structured log events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl SignalNotifier for LogNotifier {
    fn notify(&self, signal: &TradingSignal) -> Result<()> {
        info!(
            id = %signal.id,
            symbol = %signal.symbol,
            direction = ?signal.direction,
            confidence = signal.confidence,
            strategy = %signal.strategy,
            price = signal.price,
            reason = %signal.reason,
            "Trading signal"
        );
        Ok(())
    }
}

/// Appends each signal as one JSON line
#[derive(Debug)]
pub struct JsonLinesNotifier {
    file: Mutex<File>,
}

impl JsonLinesNotifier {
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl SignalNotifier for JsonLinesNotifier {
    fn notify(&self, signal: &TradingSignal) -> Result<()> {
        let line = serde_json::to_string(signal)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| EngineError::Notification("notifier lock poisoned".to_string()))?;
        writeln!(file, "{}", line).map_err(|e| EngineError::Notification(e.to_string()))
    }
}
