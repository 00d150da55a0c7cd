use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{
    BacktestConfig, Diagnostic, EngineError, PortfolioSnapshot, Position, Result,
    SignalDirection, TradeRecord, TradingSignal,
};
use tracing::debug;

const CASH_EPSILON: f64 = 1e-9;

/// What applying a signal did to the portfolio
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Opened {
        symbol: String,
        quantity: f64,
        price: f64,
    },
    Closed(TradeRecord),
    /// Valid signal with nothing to do (repeated entry, exit while flat, hold)
    Ignored(&'static str),
    /// Signal could not be executed (sizing, cash or price problem)
    Rejected(String),
}

/// Cash and per-symbol positions of one backtest run.
///
/// Each symbol is either Flat (no entry in `positions`) or Open. Cash never
/// goes negative: entries keep enough cash back to pay the transaction cost
/// of closing every open position.
#[derive(Debug)]
pub struct PortfolioSimulator {
    initial_capital: f64,
    cash: f64,
    positions: BTreeMap<String, Position>,
    realized_pnl: f64,
    trades: Vec<TradeRecord>,
    transaction_cost: f64,
    commission_rate: f64,
    stamp_tax_rate: f64,
    lot_size: f64,
    max_position_size: f64,
    rejected: usize,
    diagnostics: Vec<Diagnostic>,
}

impl PortfolioSimulator {
    pub fn new(config: &BacktestConfig, max_position_size: f64) -> Self {
        Self {
            initial_capital: config.initial_capital,
            cash: config.initial_capital,
            positions: BTreeMap::new(),
            realized_pnl: 0.0,
            trades: Vec::new(),
            transaction_cost: config.transaction_cost,
            commission_rate: config.commission_rate,
            stamp_tax_rate: config.stamp_tax_rate,
            lot_size: config.lot_size,
            max_position_size,
            rejected: 0,
            diagnostics: Vec::new(),
        }
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    /// Cash plus market value of open positions
    pub fn equity(&self) -> f64 {
        self.cash + self.positions.values().map(|p| p.market_value()).sum::<f64>()
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl()).sum()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn is_open(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Apply a signal at the given execution price
    pub fn apply_signal(&mut self, signal: &TradingSignal, price: f64) -> SignalOutcome {
        let outcome = match signal.direction {
            SignalDirection::Hold => SignalOutcome::Ignored("hold"),
            _ if !(price > 0.0 && price.is_finite()) => {
                SignalOutcome::Rejected(format!("invalid execution price {}", price))
            }
            SignalDirection::Enter if self.is_open(&signal.symbol) => {
                SignalOutcome::Ignored("position already open")
            }
            SignalDirection::Enter => self.open(signal, price),
            SignalDirection::Exit => match self.positions.remove(&signal.symbol) {
                Some(position) => SignalOutcome::Closed(self.close(
                    position,
                    price,
                    signal.timestamp,
                    &signal.reason,
                )),
                None => SignalOutcome::Ignored("no open position"),
            },
        };

        if let SignalOutcome::Rejected(reason) = &outcome {
            debug!(signal = %signal.id, reason = %reason, "Signal rejected");
            self.rejected += 1;
            self.diagnostics.push(Diagnostic::RejectedSignal {
                signal_id: signal.id.clone(),
                symbol: signal.symbol.clone(),
                reason: reason.clone(),
            });
        }

        outcome
    }

    fn open(&mut self, signal: &TradingSignal, price: f64) -> SignalOutcome {
        let fraction = if signal.position_size > 0.0 {
            signal.position_size.min(self.max_position_size)
        } else {
            self.max_position_size
        };

        // Keep back the closing cost of every position, including this one
        let reserve = self.transaction_cost * (self.positions.len() + 1) as f64;
        let spendable = self.cash - reserve;
        if spendable <= 0.0 {
            return SignalOutcome::Rejected("insufficient cash".to_string());
        }

        let budget = (self.cash * fraction).min(spendable);
        let unit_cost = price * (1.0 + self.commission_rate);
        let quantity = (budget / unit_cost / self.lot_size).floor() * self.lot_size;
        if quantity < self.lot_size {
            return SignalOutcome::Rejected(format!(
                "budget {:.2} buys less than one lot at {:.2}",
                budget, price
            ));
        }

        let notional = quantity * price;
        let commission = notional * self.commission_rate;
        if notional + commission > spendable + CASH_EPSILON {
            return SignalOutcome::Rejected(format!(
                "cost {:.2} exceeds available cash {:.2}",
                notional + commission,
                spendable
            ));
        }

        self.cash -= notional + commission;
        self.positions.insert(
            signal.symbol.clone(),
            Position {
                symbol: signal.symbol.clone(),
                quantity,
                avg_entry_price: price,
                entry_date: signal.timestamp,
                current_price: price,
                signal_id: signal.id.clone(),
                entry_commission: commission,
            },
        );

        debug!(
            symbol = %signal.symbol,
            quantity,
            price,
            commission,
            cash = self.cash,
            "Position opened"
        );

        SignalOutcome::Opened {
            symbol: signal.symbol.clone(),
            quantity,
            price,
        }
    }

    fn close(
        &mut self,
        position: Position,
        price: f64,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) -> TradeRecord {
        let gross = position.quantity * price;
        let exit_fees =
            gross * (self.commission_rate + self.stamp_tax_rate) + self.transaction_cost;
        let proceeds = gross - exit_fees;
        let cost_basis = position.quantity * position.avg_entry_price + position.entry_commission;
        let pnl = proceeds - cost_basis;

        self.cash += proceeds;
        self.realized_pnl += pnl;

        let trade = TradeRecord {
            symbol: position.symbol,
            entry_date: position.entry_date,
            exit_date: timestamp,
            entry_price: position.avg_entry_price,
            exit_price: price,
            quantity: position.quantity,
            transaction_cost: position.entry_commission + exit_fees,
            pnl,
            pnl_pct: if cost_basis > 0.0 {
                (pnl / cost_basis) * 100.0
            } else {
                0.0
            },
            holding_days: (timestamp - position.entry_date).num_days(),
            signal_id: position.signal_id,
            exit_reason: reason.to_string(),
        };

        debug!(symbol = %trade.symbol, pnl = trade.pnl, cash = self.cash, "Position closed");

        self.trades.push(trade.clone());
        trade
    }

    /// Update current prices of open positions; symbols without a price keep
    /// their last mark
    pub fn mark_to_market(&mut self, prices: &BTreeMap<String, f64>) {
        for (symbol, position) in self.positions.iter_mut() {
            if let Some(price) = prices.get(symbol) {
                if *price > 0.0 && price.is_finite() {
                    position.current_price = *price;
                }
            }
        }
    }

    /// Close every open position at its last marked price
    pub fn liquidate_all(&mut self, timestamp: DateTime<Utc>, reason: &str) -> Vec<TradeRecord> {
        let positions = std::mem::take(&mut self.positions);
        positions
            .into_values()
            .map(|position| {
                let price = position.current_price;
                self.close(position, price, timestamp, reason)
            })
            .collect()
    }

    pub fn snapshot(&self, as_of: DateTime<Utc>) -> PortfolioSnapshot {
        PortfolioSnapshot {
            cash: self.cash,
            positions: self.positions.clone(),
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl(),
            total_equity: self.equity(),
            as_of,
        }
    }

    /// Check the accounting invariants; a failure aborts the run. The error
    /// message carries the portfolio state at the time of the check.
    pub fn verify_invariants(&self) -> Result<()> {
        let violation = if self.cash < -CASH_EPSILON {
            Some(format!("cash went negative: {}", self.cash))
        } else if !self.equity().is_finite() {
            Some(format!("equity is not finite: {}", self.equity()))
        } else {
            let booked: f64 = self.trades.iter().map(|t| t.pnl).sum();
            let tolerance = 1e-6 * self.realized_pnl.abs().max(1.0);
            ((booked - self.realized_pnl).abs() > tolerance).then(|| {
                format!(
                    "realized P&L {} does not match trades {}",
                    self.realized_pnl, booked
                )
            })
        };

        match violation {
            Some(violation) => Err(EngineError::SimulationInvariant(format!(
                "{} [{}]",
                violation,
                self.describe()
            ))),
            None => Ok(()),
        }
    }

    /// One-line summary of cash, equity and open positions
    pub fn describe(&self) -> String {
        let positions: Vec<String> = self
            .positions
            .values()
            .map(|p| format!("{} {} @ {:.2}", p.symbol, p.quantity, p.avg_entry_price))
            .collect();
        format!(
            "cash {:.2}, equity {:.2}, realized {:.2}, open positions: {}",
            self.cash,
            self.equity(),
            self.realized_pnl,
            if positions.is_empty() {
                "none".to_string()
            } else {
                positions.join(", ")
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};
    use common::{MarketSnapshot, StrategyKind};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 15, 0, 0).unwrap() + Duration::days(n)
    }

    fn signal(symbol: &str, direction: SignalDirection, price: f64, n: i64, size: f64) -> TradingSignal {
        let snapshot = MarketSnapshot::new(symbol, "S1", day(n), price, price, price, price, 1_000);
        TradingSignal::new(StrategyKind::Momentum, &snapshot, direction, 90.0)
            .unwrap()
            .with_position_size(size)
            .unwrap()
    }

    fn simulator(capital: f64, cost: f64, max_size: f64) -> PortfolioSimulator {
        let config = BacktestConfig::default()
            .with_capital(capital)
            .with_transaction_cost(cost);
        PortfolioSimulator::new(&config, max_size)
    }

    #[test]
    fn test_open_and_close_position() {
        let mut portfolio = simulator(10_000.0, 0.0, 0.5);

        let outcome = portfolio.apply_signal(&signal("X", SignalDirection::Enter, 50.0, 0, 0.5), 50.0);
        assert_eq!(
            outcome,
            SignalOutcome::Opened {
                symbol: "X".to_string(),
                quantity: 100.0,
                price: 50.0
            }
        );
        assert_eq!(portfolio.cash(), 5_000.0);
        assert_eq!(portfolio.equity(), 10_000.0);

        let mut prices = BTreeMap::new();
        prices.insert("X".to_string(), 55.0);
        portfolio.mark_to_market(&prices);
        assert_eq!(portfolio.equity(), 10_500.0);
        assert_eq!(portfolio.unrealized_pnl(), 500.0);

        let outcome = portfolio.apply_signal(&signal("X", SignalDirection::Exit, 55.0, 3, 0.0), 55.0);
        let SignalOutcome::Closed(trade) = outcome else {
            panic!("expected a closed trade");
        };
        assert_eq!(trade.pnl, 500.0);
        assert_eq!(trade.pnl_pct, 10.0);
        assert_eq!(trade.holding_days, 3);
        assert_eq!(portfolio.cash(), 10_500.0);
        assert!(!portfolio.is_open("X"));
        portfolio.verify_invariants().unwrap();
    }

    #[test]
    fn test_transaction_cost_is_charged_on_close() {
        let mut portfolio = simulator(10_000.0, 10.0, 0.5);
        portfolio.apply_signal(&signal("X", SignalDirection::Enter, 50.0, 0, 0.5), 50.0);
        let SignalOutcome::Closed(trade) =
            portfolio.apply_signal(&signal("X", SignalDirection::Exit, 50.0, 1, 0.0), 50.0)
        else {
            panic!("expected a closed trade");
        };

        assert_relative_eq!(trade.pnl, -10.0);
        assert_relative_eq!(portfolio.cash(), 9_990.0);
        assert_relative_eq!(portfolio.realized_pnl(), -10.0);
    }

    #[test]
    fn test_commission_and_stamp_tax() {
        let config = BacktestConfig::a_share().with_capital(100_000.0);
        let mut portfolio = PortfolioSimulator::new(&config, 0.5);

        // 50_000 / (10 * 1.0003) = 4998.5 shares, rounded down to 4900
        portfolio.apply_signal(&signal("X", SignalDirection::Enter, 10.0, 0, 0.5), 10.0);
        let position = portfolio.position("X").unwrap();
        assert_eq!(position.quantity, 4_900.0);
        assert_relative_eq!(position.entry_commission, 14.7, epsilon = 1e-9);
        assert_relative_eq!(portfolio.cash(), 100_000.0 - 49_000.0 - 14.7, epsilon = 1e-9);

        let SignalOutcome::Closed(trade) =
            portfolio.apply_signal(&signal("X", SignalDirection::Exit, 11.0, 2, 0.0), 11.0)
        else {
            panic!("expected a closed trade");
        };

        // Exit fees: 53_900 * (0.0003 + 0.001) = 70.07
        assert_relative_eq!(trade.transaction_cost, 14.7 + 70.07, epsilon = 1e-9);
        assert_relative_eq!(trade.pnl, 4_900.0 - 14.7 - 70.07, epsilon = 1e-9);
        assert_relative_eq!(portfolio.cash(), 100_000.0 + trade.pnl, epsilon = 1e-9);
        portfolio.verify_invariants().unwrap();
    }

    #[test]
    fn test_invariant_error_reports_portfolio_state() {
        let mut portfolio = simulator(10_000.0, 0.0, 0.5);
        portfolio.apply_signal(&signal("X", SignalDirection::Enter, 50.0, 0, 0.5), 50.0);
        portfolio.cash = -5.0;

        let err = portfolio.verify_invariants().unwrap_err();
        let EngineError::SimulationInvariant(message) = err else {
            panic!("expected an invariant error");
        };
        assert!(message.contains("cash went negative"));
        assert!(message.contains("cash -5.00"));
        assert!(message.contains("X 100 @ 50.00"));
    }

    #[test]
    fn test_repeated_entry_and_flat_exit_are_ignored() {
        let mut portfolio = simulator(10_000.0, 0.0, 0.5);
        portfolio.apply_signal(&signal("X", SignalDirection::Enter, 50.0, 0, 0.2), 50.0);
        let cash = portfolio.cash();

        let again = portfolio.apply_signal(&signal("X", SignalDirection::Enter, 50.0, 1, 0.2), 50.0);
        assert!(matches!(again, SignalOutcome::Ignored(_)));
        assert_eq!(portfolio.cash(), cash);

        let flat = portfolio.apply_signal(&signal("Y", SignalDirection::Exit, 20.0, 1, 0.0), 20.0);
        assert!(matches!(flat, SignalOutcome::Ignored(_)));
        assert_eq!(portfolio.rejected_count(), 0);
    }

    #[test]
    fn test_position_size_is_capped() {
        let mut portfolio = simulator(10_000.0, 0.0, 0.1);
        portfolio.apply_signal(&signal("X", SignalDirection::Enter, 10.0, 0, 0.9), 10.0);
        assert_eq!(portfolio.position("X").unwrap().quantity, 100.0);
    }

    #[test]
    fn test_sub_lot_entry_is_rejected() {
        let mut portfolio = simulator(1_000.0, 0.0, 0.1);
        let outcome = portfolio.apply_signal(&signal("X", SignalDirection::Enter, 500.0, 0, 0.1), 500.0);

        assert!(matches!(outcome, SignalOutcome::Rejected(_)));
        assert_eq!(portfolio.rejected_count(), 1);
        assert_eq!(portfolio.cash(), 1_000.0);
        assert!(matches!(
            portfolio.take_diagnostics().as_slice(),
            [Diagnostic::RejectedSignal { .. }]
        ));
    }

    #[test]
    fn test_liquidate_all_uses_last_marks() {
        let mut portfolio = simulator(10_000.0, 0.0, 0.3);
        portfolio.apply_signal(&signal("A", SignalDirection::Enter, 10.0, 0, 0.3), 10.0);
        portfolio.apply_signal(&signal("B", SignalDirection::Enter, 20.0, 0, 0.3), 20.0);

        let mut prices = BTreeMap::new();
        prices.insert("A".to_string(), 11.0);
        portfolio.mark_to_market(&prices);

        let trades = portfolio.liquidate_all(day(5), "end of backtest");
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].symbol, "A");
        assert_eq!(trades[0].exit_price, 11.0);
        assert_eq!(trades[1].exit_price, 20.0);
        assert!(portfolio.positions().is_empty());
        assert_relative_eq!(portfolio.equity(), portfolio.cash());
        portfolio.verify_invariants().unwrap();
    }

    #[test]
    fn test_cash_never_negative_under_random_signals() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut portfolio = simulator(5_000.0, 7.5, 0.6);
        let symbols = ["A", "B", "C", "D"];

        for n in 0..500 {
            let symbol = symbols[rng.gen_range(0..symbols.len())];
            let price = rng.gen_range(0.5..400.0);
            let direction = if rng.gen_bool(0.6) {
                SignalDirection::Enter
            } else {
                SignalDirection::Exit
            };
            let size = rng.gen_range(0.0..1.0);
            portfolio.apply_signal(&signal(symbol, direction, price, n, size), price);

            let prices: BTreeMap<String, f64> = symbols
                .iter()
                .map(|s| (s.to_string(), rng.gen_range(0.01..400.0)))
                .collect();
            portfolio.mark_to_market(&prices);

            assert!(portfolio.cash() >= -CASH_EPSILON);
            portfolio.verify_invariants().unwrap();
        }

        portfolio.liquidate_all(day(600), "end");
        assert!(portfolio.cash() >= -CASH_EPSILON);
    }
}
