//! Aggregate performance statistics of a finished backtest.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Performance statistics derived from a task's ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestStatistics {
    // === Counts ===
    /// All ledger rows, settlements included
    pub total_trades: i64,

    pub buy_trades: i64,

    pub sell_trades: i64,

    // === Win/Loss ===
    /// Rows with positive realized P&L
    pub win_trades: i64,

    /// Rows with negative realized P&L
    pub loss_trades: i64,

    /// Wins over rows carrying P&L, in percent (0 to 100)
    pub win_rate: Decimal,

    /// Largest single realized profit
    pub max_profit: Decimal,

    /// Largest single realized loss (negative or zero)
    pub max_loss: Decimal,

    // === Risk ===
    /// Largest peak-to-trough fall of the running balance, in USDC
    pub max_drawdown: Decimal,

    /// Mean BUY to next SELL delay in milliseconds
    pub avg_holding_time_ms: Option<i64>,
}
