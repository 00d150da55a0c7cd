use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// OHLCV snapshot of one symbol at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub sector: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl MarketSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        sector: impl Into<String>,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            sector: sector.into(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Intraday change from open to close, in percent
    pub fn change_pct(&self) -> f64 {
        if self.open == 0.0 {
            0.0
        } else {
            (self.close / self.open - 1.0) * 100.0
        }
    }

    pub fn trading_date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Strategy variants known to the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Momentum,
    Volume,
    Sentiment,
    TPlusOne,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Momentum,
        StrategyKind::Volume,
        StrategyKind::Sentiment,
        StrategyKind::TPlusOne,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Momentum => "momentum",
            StrategyKind::Volume => "volume",
            StrategyKind::Sentiment => "sentiment",
            StrategyKind::TPlusOne => "t_plus_one",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "momentum" => Ok(StrategyKind::Momentum),
            "volume" => Ok(StrategyKind::Volume),
            "sentiment" => Ok(StrategyKind::Sentiment),
            "t_plus_one" | "t+1" | "tplusone" => Ok(StrategyKind::TPlusOne),
            other => Err(EngineError::Configuration(format!(
                "Unknown strategy: {}",
                other
            ))),
        }
    }
}

/// Signal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    Enter,
    Exit,
    Hold,
}

/// Trading signal emitted by a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub id: String,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub direction: SignalDirection,
    /// 0-100
    pub confidence: f64,
    pub strategy: StrategyKind,
    /// Suggested fraction of capital, 0-1
    pub position_size: f64,
    pub price: f64,
    pub reason: String,
}

impl TradingSignal {
    /// Build a signal for the given snapshot. Confidence must lie in [0, 100].
    pub fn new(
        strategy: StrategyKind,
        snapshot: &MarketSnapshot,
        direction: SignalDirection,
        confidence: f64,
    ) -> Result<Self> {
        if !confidence.is_finite() || !(0.0..=100.0).contains(&confidence) {
            return Err(EngineError::InvalidSignal(format!(
                "confidence {} outside [0, 100]",
                confidence
            )));
        }
        if !(snapshot.close > 0.0) {
            return Err(EngineError::InvalidSignal(format!(
                "non-positive price {} for {}",
                snapshot.close, snapshot.symbol
            )));
        }

        Ok(Self {
            id: format!(
                "{}-{}-{}",
                strategy,
                snapshot.symbol,
                snapshot.timestamp.format("%Y%m%d%H%M%S")
            ),
            symbol: snapshot.symbol.clone(),
            timestamp: snapshot.timestamp,
            direction,
            confidence,
            strategy,
            position_size: 0.0,
            price: snapshot.close,
            reason: String::new(),
        })
    }

    pub fn with_position_size(mut self, position_size: f64) -> Result<Self> {
        if !position_size.is_finite() || !(0.0..=1.0).contains(&position_size) {
            return Err(EngineError::InvalidSignal(format!(
                "position size {} outside [0, 1]",
                position_size
            )));
        }
        self.position_size = position_size;
        Ok(self)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn is_entry(&self) -> bool {
        self.direction == SignalDirection::Enter
    }

    pub fn is_exit(&self) -> bool {
        self.direction == SignalDirection::Exit
    }
}

/// Open position information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub entry_date: DateTime<Utc>,
    pub current_price: f64,
    pub signal_id: String,
    /// Commission paid when the position was opened
    #[serde(default)]
    pub entry_commission: f64,
}

impl Position {
    pub fn market_value(&self) -> f64 {
        self.quantity * self.current_price
    }

    pub fn unrealized_pnl(&self) -> f64 {
        (self.current_price - self.avg_entry_price) * self.quantity
    }

    pub fn unrealized_pnl_pct(&self) -> f64 {
        let cost = self.avg_entry_price * self.quantity;
        if cost == 0.0 {
            0.0
        } else {
            (self.unrealized_pnl() / cost) * 100.0
        }
    }
}

/// Closed trade record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub entry_date: DateTime<Utc>,
    pub exit_date: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub transaction_cost: f64,
    /// Realized P&L after transaction cost
    pub pnl: f64,
    pub pnl_pct: f64,
    pub holding_days: i64,
    pub signal_id: String,
    pub exit_reason: String,
}

impl TradeRecord {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }
}

/// Risk and performance statistics of one backtest run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Fraction, e.g. 0.12 for +12%
    pub total_return: f64,
    pub annualized_volatility: f64,
    /// Fraction of the running peak, in [0, 1]
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    /// Fraction of trades with positive P&L
    pub win_rate: f64,
    pub trade_count: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub profit_factor: f64,
    /// Average winning trade over average losing trade
    pub profit_loss_ratio: f64,
    /// Net profit over the largest peak-to-trough loss in currency
    pub recovery_factor: f64,
    pub max_consecutive_losses: usize,
    pub avg_holding_days: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
}

/// Non-fatal problem recorded during a scan or backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    SkippedItem {
        symbol: String,
        strategy: Option<StrategyKind>,
        reason: String,
    },
    DataGap {
        date: NaiveDate,
    },
    DataQualityWarning {
        from: NaiveDate,
        to: NaiveDate,
        consecutive_days: usize,
    },
    RejectedSignal {
        signal_id: String,
        symbol: String,
        reason: String,
    },
    OutOfUniverse {
        signal_id: String,
        symbol: String,
    },
    NotificationFailed {
        signal_id: String,
        reason: String,
    },
    RepositoryFailed {
        reason: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::SkippedItem {
                symbol,
                strategy: Some(strategy),
                reason,
            } => write!(f, "skipped {} / {}: {}", symbol, strategy, reason),
            Diagnostic::SkippedItem { symbol, reason, .. } => {
                write!(f, "skipped {}: {}", symbol, reason)
            }
            Diagnostic::DataGap { date } => write!(f, "no data on {}", date),
            Diagnostic::DataQualityWarning {
                from,
                to,
                consecutive_days,
            } => write!(
                f,
                "{} consecutive days without data ({} to {})",
                consecutive_days, from, to
            ),
            Diagnostic::RejectedSignal {
                signal_id, reason, ..
            } => write!(f, "rejected {}: {}", signal_id, reason),
            Diagnostic::OutOfUniverse { signal_id, symbol } => {
                write!(f, "dropped {}: {} is outside the universe", signal_id, symbol)
            }
            Diagnostic::NotificationFailed { signal_id, reason } => {
                write!(f, "notification for {} failed: {}", signal_id, reason)
            }
            Diagnostic::RepositoryFailed { reason } => {
                write!(f, "portfolio save failed: {}", reason)
            }
        }
    }
}

/// Scan output: ordered signals plus non-fatal diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub signals: Vec<TradingSignal>,
    pub diagnostics: Vec<Diagnostic>,
    pub items_evaluated: usize,
    pub cancelled: bool,
}

/// Serializable portfolio state handed to a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub cash: f64,
    pub positions: BTreeMap<String, Position>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_equity: f64,
    pub as_of: DateTime<Utc>,
}

/// Backtest result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub metrics: RiskMetrics,
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    pub drawdown_curve: Vec<(DateTime<Utc>, f64)>,
    pub trades: Vec<TradeRecord>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_signals: usize,
    pub rejected_signals: usize,
    pub diagnostics: Vec<Diagnostic>,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portfolio_id: Option<String>,
    pub execution_time_ms: u64,
}
