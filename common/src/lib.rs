pub mod config;
pub mod error;
pub mod types;

pub use config::{AnalysisConfig, BacktestConfig, EngineSettings, RetryPolicy};
pub use error::{EngineError, Result};
pub use types::*;
