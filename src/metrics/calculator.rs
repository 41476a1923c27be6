//! Performance statistics over a task's ledger: win rate, drawdown, holding time.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use statrs::statistics::Statistics;

use crate::models::{BacktestStatistics, BacktestTrade, LedgerSide};

/// Calculator for backtest statistics.
pub struct StatisticsCalculator;

impl StatisticsCalculator {
    /// Calculate statistics from the ordered ledger of a run.
    pub fn calculate(initial_balance: Decimal, rows: &[BacktestTrade]) -> BacktestStatistics {
        let mut stats = BacktestStatistics {
            total_trades: rows.len() as i64,
            ..Default::default()
        };

        if rows.is_empty() {
            return stats;
        }

        stats.buy_trades = rows.iter().filter(|r| r.side == LedgerSide::Buy).count() as i64;
        stats.sell_trades = rows.iter().filter(|r| r.side == LedgerSide::Sell).count() as i64;

        Self::calculate_pnl_stats(&mut stats, rows);
        stats.max_drawdown = Self::max_drawdown(initial_balance, rows);
        stats.avg_holding_time_ms = Self::avg_holding_time_ms(rows);

        stats
    }

    /// Win/loss counts and extremes over rows carrying realized P&L.
    fn calculate_pnl_stats(stats: &mut BacktestStatistics, rows: &[BacktestTrade]) {
        let pnls: Vec<Decimal> = rows.iter().filter_map(|r| r.profit_loss).collect();
        if pnls.is_empty() {
            return;
        }

        stats.win_trades = pnls.iter().filter(|p| **p > Decimal::ZERO).count() as i64;
        stats.loss_trades = pnls.iter().filter(|p| **p < Decimal::ZERO).count() as i64;

        stats.win_rate = (Decimal::from(stats.win_trades) / Decimal::from(pnls.len() as i64) * dec!(100))
            .round_dp(2);

        stats.max_profit = pnls.iter().copied().fold(Decimal::ZERO, Decimal::max);
        stats.max_loss = pnls.iter().copied().fold(Decimal::ZERO, Decimal::min);
    }

    /// Largest fall of `balance_after` from its running peak, starting at the initial balance.
    fn max_drawdown(initial_balance: Decimal, rows: &[BacktestTrade]) -> Decimal {
        let mut peak = initial_balance;
        let mut max_dd = Decimal::ZERO;

        for row in rows {
            if row.balance_after > peak {
                peak = row.balance_after;
            }
            let dd = peak - row.balance_after;
            if dd > max_dd {
                max_dd = dd;
            }
        }

        max_dd
    }

    /// Mean delay over adjacent BUY then SELL rows.
    ///
    /// Rows are paired by ledger order, not by position: a BUY counts only when the
    /// very next row is a SELL.
    fn avg_holding_time_ms(rows: &[BacktestTrade]) -> Option<i64> {
        let holds: Vec<f64> = rows
            .windows(2)
            .filter(|pair| pair[0].side == LedgerSide::Buy && pair[1].side == LedgerSide::Sell)
            .map(|pair| (pair[1].trade_time - pair[0].trade_time).num_milliseconds() as f64)
            .collect();

        if holds.is_empty() {
            return None;
        }
        Some(holds.mean().round() as i64)
    }
}
