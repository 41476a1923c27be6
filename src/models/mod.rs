//! Data models for leader trades, simulated positions, ledger rows and tasks.

mod ledger;
mod market;
mod position;
mod statistics;
mod task;
mod trade;

pub use ledger::{net_cost_basis, BacktestTrade, LedgerSide, SettlementKind};
pub use market::{MarketContext, MarketSnapshot};
pub use position::{floor_quantity, Position, QUANTITY_SCALE};
pub use statistics::BacktestStatistics;
pub use task::{BacktestTask, Checkpoint, NewTask, TaskOutcome, TaskStatus};
pub use trade::{position_key, TradeData, TradeSide};
