pub mod cancel;
pub mod data;
pub mod engine;
pub mod indicators;
pub mod metrics;
pub mod notify;
pub mod portfolio;
pub mod registry;
pub mod repository;
pub mod scanner;
pub mod service;
pub mod strategies;

pub use cancel::CancellationToken;
pub use data::{
    load_file, load_universe, DataProvider, InMemoryProvider, SnapshotWindow, SyntheticUniverse,
};
pub use engine::BacktestEngine;
pub use metrics::{drawdown_curve, RiskMetricsCalculator};
pub use notify::{JsonLinesNotifier, LogNotifier, SignalNotifier};
pub use portfolio::{PortfolioSimulator, SignalOutcome};
pub use registry::StrategyRegistry;
pub use repository::{InMemoryRepository, JsonFileRepository, PortfolioRepository};
pub use scanner::MarketScanner;
pub use service::MarketService;
pub use strategies::{
    create_all_strategies, create_strategy, EvaluationCache, ExitTargets, Strategy,
};

// Re-export common types
pub use common::{
    AnalysisConfig, BacktestConfig, BacktestResult, Diagnostic, EngineError, EngineSettings,
    MarketSnapshot, PortfolioSnapshot, Position, Result, RetryPolicy, RiskMetrics, ScanResult,
    SignalDirection, StrategyKind, TradeRecord, TradingSignal,
};
