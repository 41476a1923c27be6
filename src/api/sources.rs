//! Collaborator seams of the backtest engine and filter pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{BookError, SourceError};
use crate::models::MarketSnapshot;

use super::types::{ActivityQuery, ActivityResponse};

/// Paginated historical trade activity of a wallet.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn fetch_activity(&self, query: &ActivityQuery) -> Result<Vec<ActivityResponse>, SourceError>;
}

/// Market resolution and price lookups.
#[async_trait]
pub trait MarketOracle: Send + Sync {
    /// Metadata for the filter pipeline; `None` if the market is unknown.
    async fn market_snapshot(&self, market_id: &str) -> anyhow::Result<Option<MarketSnapshot>>;

    /// When the market resolved, `None` while unresolved.
    async fn market_resolution(&self, market_id: &str) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Payout per share (0 or 1) of a resolved outcome.
    async fn settlement_payout(&self, market_id: &str, outcome_index: i32) -> anyhow::Result<Option<Decimal>>;

    /// Current valuation price of an unresolved outcome.
    async fn mark_price(&self, market_id: &str, outcome_index: i32) -> anyhow::Result<Decimal>;

    async fn resolve_outcome_index(
        &self,
        market_id: &str,
        outcome: Option<&str>,
        outcome_index: Option<i32>,
    ) -> anyhow::Result<Option<i32>>;
}

/// One price level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    pub price: Decimal,
    pub size: Decimal,
}

/// Order book snapshot of one outcome token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBook {
    pub token_id: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

impl OrderBook {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().map(|l| l.price).max()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().map(|l| l.price).min()
    }

    /// `best_ask - best_bid`, `None` when either side is empty.
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    /// Total notional on both sides.
    pub fn depth(&self) -> Decimal {
        self.bids
            .iter()
            .chain(self.asks.iter())
            .map(|l| l.price * l.size)
            .sum()
    }
}

/// Live order book lookups.
#[async_trait]
pub trait OrderBookSource: Send + Sync {
    async fn order_book(&self, token_id: &str) -> Result<OrderBook, BookError>;
}
