use chrono::{DateTime, Utc};
use common::{RiskMetrics, TradeRecord};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Risk statistics from an equity curve and closed trades.
///
/// Ratios are fractions (0.12 = 12%). Undefined ratios (zero volatility, no
/// downside, no losing trades) are reported as 0.
#[derive(Debug, Clone, Copy)]
pub struct RiskMetricsCalculator {
    risk_free_rate: f64,
}

impl RiskMetricsCalculator {
    pub fn new(risk_free_rate: f64) -> Self {
        Self { risk_free_rate }
    }

    pub fn calculate(
        &self,
        equity_curve: &[(DateTime<Utc>, f64)],
        trades: &[TradeRecord],
    ) -> RiskMetrics {
        let trade_stats = trade_stats(trades);
        let mut metrics = RiskMetrics {
            trade_count: trades.len(),
            winning_trades: trade_stats.winning,
            losing_trades: trade_stats.losing,
            win_rate: trade_stats.win_rate,
            profit_factor: trade_stats.profit_factor,
            profit_loss_ratio: trade_stats.profit_loss_ratio,
            max_consecutive_losses: trade_stats.max_consecutive_losses,
            avg_holding_days: trade_stats.avg_holding_days,
            best_trade: trade_stats.best,
            worst_trade: trade_stats.worst,
            ..RiskMetrics::default()
        };

        let (Some((_, first)), Some((_, last))) = (equity_curve.first(), equity_curve.last())
        else {
            return metrics;
        };
        if *first <= 0.0 {
            return metrics;
        }

        let returns = daily_returns(equity_curve);
        metrics.total_return = last / first - 1.0;
        metrics.annualized_volatility = annualized_volatility(&returns);
        metrics.max_drawdown = max_drawdown(equity_curve);
        metrics.sharpe_ratio = self.sharpe_ratio(&returns, metrics.annualized_volatility);
        metrics.sortino_ratio = self.sortino_ratio(&returns);

        let annual_return = annualized_return(metrics.total_return, returns.len());
        metrics.calmar_ratio = if metrics.max_drawdown > 0.0 {
            annual_return / metrics.max_drawdown
        } else {
            0.0
        };

        let worst_loss = max_drawdown_amount(equity_curve);
        metrics.recovery_factor = if worst_loss > 0.0 {
            (last - first) / worst_loss
        } else {
            0.0
        };

        metrics
    }

    fn sharpe_ratio(&self, returns: &[f64], volatility: f64) -> f64 {
        if returns.is_empty() || volatility == 0.0 {
            return 0.0;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        (mean * TRADING_DAYS_PER_YEAR - self.risk_free_rate) / volatility
    }

    /// Sortino ratio (uses only downside deviation)
    fn sortino_ratio(&self, returns: &[f64]) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let daily_risk_free = self.risk_free_rate / TRADING_DAYS_PER_YEAR;

        let downside: f64 = returns
            .iter()
            .filter(|&&r| r < daily_risk_free)
            .map(|&r| (r - daily_risk_free).powi(2))
            .sum();
        let downside_deviation = (downside / n).sqrt() * TRADING_DAYS_PER_YEAR.sqrt();

        if downside_deviation == 0.0 {
            return 0.0;
        }
        (mean * TRADING_DAYS_PER_YEAR - self.risk_free_rate) / downside_deviation
    }
}

/// Drawdown from the running peak at every sample, as a fraction
pub fn drawdown_curve(equity_curve: &[(DateTime<Utc>, f64)]) -> Vec<(DateTime<Utc>, f64)> {
    let mut peak = f64::MIN;
    equity_curve
        .iter()
        .map(|(ts, equity)| {
            peak = peak.max(*equity);
            let drawdown = if peak > 0.0 {
                (peak - equity) / peak
            } else {
                0.0
            };
            (*ts, drawdown)
        })
        .collect()
}

fn daily_returns(equity_curve: &[(DateTime<Utc>, f64)]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .map(|w| {
            let prev = w[0].1;
            if prev != 0.0 {
                w[1].1 / prev - 1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Sample standard deviation of daily returns, annualized
fn annualized_volatility(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt()
}

fn max_drawdown(equity_curve: &[(DateTime<Utc>, f64)]) -> f64 {
    drawdown_curve(equity_curve)
        .into_iter()
        .map(|(_, dd)| dd)
        .fold(0.0, f64::max)
        .clamp(0.0, 1.0)
}

/// Largest peak-to-trough loss in currency
fn max_drawdown_amount(equity_curve: &[(DateTime<Utc>, f64)]) -> f64 {
    let mut peak = f64::MIN;
    equity_curve.iter().fold(0.0, |worst, (_, equity)| {
        peak = peak.max(*equity);
        worst.max(peak - equity)
    })
}

fn annualized_return(total_return: f64, periods: usize) -> f64 {
    if periods == 0 || total_return <= -1.0 {
        return 0.0;
    }
    (1.0 + total_return).powf(TRADING_DAYS_PER_YEAR / periods as f64) - 1.0
}

#[derive(Debug, Default)]
struct TradeStats {
    winning: usize,
    losing: usize,
    win_rate: f64,
    profit_factor: f64,
    profit_loss_ratio: f64,
    max_consecutive_losses: usize,
    avg_holding_days: f64,
    best: f64,
    worst: f64,
}

fn trade_stats(trades: &[TradeRecord]) -> TradeStats {
    if trades.is_empty() {
        return TradeStats::default();
    }

    let mut stats = TradeStats {
        best: f64::MIN,
        worst: f64::MAX,
        ..TradeStats::default()
    };
    let mut total_wins = 0.0;
    let mut total_losses = 0.0;
    let mut total_days = 0i64;
    let mut streak = 0;

    for trade in trades {
        if trade.pnl > 0.0 {
            stats.winning += 1;
            total_wins += trade.pnl;
            streak = 0;
        } else if trade.pnl < 0.0 {
            stats.losing += 1;
            total_losses += trade.pnl.abs();
            streak += 1;
            stats.max_consecutive_losses = stats.max_consecutive_losses.max(streak);
        }

        total_days += trade.holding_days;
        stats.best = stats.best.max(trade.pnl);
        stats.worst = stats.worst.min(trade.pnl);
    }

    let n = trades.len() as f64;
    stats.win_rate = stats.winning as f64 / n;
    stats.avg_holding_days = total_days as f64 / n;
    stats.profit_factor = if total_losses > 0.0 {
        total_wins / total_losses
    } else {
        0.0
    };
    stats.profit_loss_ratio = if stats.losing > 0 && stats.winning > 0 {
        (total_wins / stats.winning as f64) / (total_losses / stats.losing as f64)
    } else {
        0.0
    };

    stats
}
