//! Append-only ledger rows written by the backtest engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Kind of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LedgerSide {
    Buy,
    Sell,
    Settlement,
}

impl LedgerSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerSide::Buy => "BUY",
            LedgerSide::Sell => "SELL",
            LedgerSide::Settlement => "SETTLEMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(LedgerSide::Buy),
            "SELL" => Some(LedgerSide::Sell),
            "SETTLEMENT" => Some(LedgerSide::Settlement),
            _ => None,
        }
    }
}

/// Why a position was closed without a leader trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettlementKind {
    /// Market resolved and paid out 0 or 1 per share
    Resolution,
    /// Still open at the end of the run, valued at the current price
    Mark,
}

impl SettlementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementKind::Resolution => "RESOLUTION",
            SettlementKind::Mark => "MARK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RESOLUTION" => Some(SettlementKind::Resolution),
            "MARK" => Some(SettlementKind::Mark),
            _ => None,
        }
    }
}

/// One simulated fill or settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub task_id: String,

    /// Order of the row within its task
    pub seq: i64,

    pub trade_time: DateTime<Utc>,

    pub side: LedgerSide,

    pub settlement_kind: Option<SettlementKind>,

    pub market_id: String,

    #[serde(default)]
    pub market_title: String,

    pub outcome: Option<String>,

    pub outcome_index: Option<i32>,

    /// Shares filled
    pub quantity: Decimal,

    /// Execution (or payout / mark) price per share
    pub price: Decimal,

    /// USDC moved by this row
    pub amount: Decimal,

    /// Always zero in simulation
    pub fee: Decimal,

    /// Realized P&L, set on SELL and SETTLEMENT rows only
    pub profit_loss: Option<Decimal>,

    /// Running balance right after this row
    pub balance_after: Decimal,

    /// Originating leader trade, absent for settlement rows
    pub leader_trade_id: Option<String>,

    /// Leader trade size, used to rebuild leader open quantity on resume
    pub leader_quantity: Option<Decimal>,
}

impl BacktestTrade {
    /// Signed balance effect of this row.
    pub fn cash_flow(&self) -> Decimal {
        match self.side {
            LedgerSide::Buy => -self.amount,
            LedgerSide::Sell | LedgerSide::Settlement => self.amount,
        }
    }

    /// Signed change in cost basis this row causes for its market outcome.
    pub fn cost_basis_delta(&self) -> Decimal {
        match self.side {
            LedgerSide::Buy => self.amount,
            LedgerSide::Sell | LedgerSide::Settlement => {
                -(self.amount - self.profit_loss.unwrap_or(Decimal::ZERO))
            }
        }
    }

    /// Whether this row belongs to the given market outcome.
    pub fn matches_outcome(&self, market_id: &str, outcome: Option<&str>, outcome_index: Option<i32>) -> bool {
        if self.market_id != market_id {
            return false;
        }
        match (outcome, self.outcome.as_deref()) {
            (Some(wanted), Some(held)) => wanted.eq_ignore_ascii_case(held),
            _ => outcome_index.is_some() && outcome_index == self.outcome_index,
        }
    }
}

/// Net cost basis of the given rows for one market outcome.
pub fn net_cost_basis<'a>(
    rows: impl IntoIterator<Item = &'a BacktestTrade>,
    market_id: &str,
    outcome: Option<&str>,
    outcome_index: Option<i32>,
) -> Decimal {
    rows.into_iter()
        .filter(|r| r.matches_outcome(market_id, outcome, outcome_index))
        .map(|r| r.cost_basis_delta())
        .sum::<Decimal>()
        .max(Decimal::ZERO)
}
