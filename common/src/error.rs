use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    #[error("Strategy {strategy} failed on {symbol}: {reason}")]
    StrategyEvaluation {
        strategy: String,
        symbol: String,
        reason: String,
    },

    #[error("Simulation invariant violated: {0}")]
    SimulationInvariant(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Data loading error: {0}")]
    DataLoadError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV parse error: {0}")]
    CsvError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl EngineError {
    pub fn data_unavailable(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataUnavailable {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    /// Transient provider failures are worth retrying; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DataUnavailable { .. })
    }

    /// Errors that must abort a whole scan or backtest run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::SimulationInvariant(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
