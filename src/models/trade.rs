//! Normalized leader trade replayed by the backtest engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// Parse the side strings used by the Polymarket APIs.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// Historical leader trade, produced only by the fetcher and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeData {
    /// Transaction hash, suffixed with an ordinal when one transaction holds several fills
    pub trade_id: String,

    /// Market condition ID (0x-prefixed)
    pub market_id: String,

    /// Outcome token (CLOB asset id)
    #[serde(default)]
    pub token_id: String,

    #[serde(default)]
    pub market_title: String,

    #[serde(default)]
    pub market_slug: String,

    pub side: TradeSide,

    /// Outcome label (e.g., "Yes", "No")
    pub outcome: Option<String>,

    pub outcome_index: Option<i32>,

    /// Price per share in USDC (0.0 to 1.0)
    pub price: Decimal,

    /// Number of outcome shares traded
    pub size: Decimal,

    /// USDC value of the trade
    pub usdc_amount: Decimal,

    pub timestamp: DateTime<Utc>,
}

impl TradeData {
    /// Key of the simulated position this trade touches: `marketId:outcomeKey`.
    pub fn position_key(&self) -> String {
        position_key(&self.market_id, self.outcome.as_deref(), self.outcome_index)
    }
}

/// Positions are keyed by outcome label when known, falling back to the outcome index.
pub fn position_key(market_id: &str, outcome: Option<&str>, outcome_index: Option<i32>) -> String {
    let outcome_key = match (outcome, outcome_index) {
        (Some(label), _) if !label.is_empty() => label.to_string(),
        (_, Some(index)) => index.to_string(),
        _ => String::new(),
    };
    format!("{}:{}", market_id, outcome_key)
}
