//! API response types for the Polymarket Data, Gamma and CLOB APIs.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Activity response from /activity endpoint.
///
/// Trade fields are optional because non-trade activity (splits, merges,
/// redemptions) omits them and malformed rows must be dropped, not fail the page.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResponse {
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default)]
    pub proxy_wallet: String,
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub size: Option<Decimal>,
    #[serde(default)]
    pub usdc_size: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub timestamp: i64,
    #[serde(default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub outcome_index: Option<i32>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub slug: String,
}

/// Position response from /positions endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    #[serde(default)]
    pub proxy_wallet: String,
    pub condition_id: String,
    #[serde(default)]
    pub title: String,
    pub outcome: String,
    pub outcome_index: i32,
    pub size: Decimal,
    #[serde(default)]
    pub current_value: Decimal,
}

/// Query for the /activity endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityQuery {
    pub user: String,
    #[serde(rename = "type")]
    pub activity_type: String,
    /// Epoch seconds, inclusive
    pub start: i64,
    /// Epoch seconds, inclusive
    pub end: i64,
    pub limit: u32,
    pub offset: u32,
    pub sort_by: String,
    pub sort_direction: String,
}

impl ActivityQuery {
    /// Trades of `user` in `[start, end]`, oldest first.
    pub fn trades(user: &str, start: i64, end: i64, limit: u32, offset: u32) -> Self {
        Self {
            user: user.to_string(),
            activity_type: "TRADE".to_string(),
            start,
            end,
            limit,
            offset,
            sort_by: "TIMESTAMP".to_string(),
            sort_direction: "ASC".to_string(),
        }
    }
}

/// Market from Gamma /markets endpoint. List-valued fields arrive as JSON-encoded strings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GammaMarketResponse {
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub closed_time: Option<String>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub outcomes: Option<String>,
    #[serde(default)]
    pub outcome_prices: Option<String>,
    #[serde(default)]
    pub clob_token_ids: Option<String>,
    #[serde(default)]
    pub uma_resolution_status: Option<String>,
}

/// Order book entry
#[derive(Debug, Clone, Deserialize)]
pub struct BookLevel {
    pub price: String,
    pub size: String,
}

/// Order book response from CLOB /book endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderBookResponse {
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub timestamp: String,
}
