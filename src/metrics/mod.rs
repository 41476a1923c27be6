//! Statistics over a finished backtest ledger.

mod calculator;

pub use calculator::StatisticsCalculator;
