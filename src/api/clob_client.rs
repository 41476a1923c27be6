//! Polymarket CLOB (Central Limit Order Book) client for live order book reads.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{BookError, SourceError};

use super::sources::{Level, OrderBook, OrderBookSource};
use super::types::{BookLevel, OrderBookResponse};

/// CLOB API base URL
pub const CLOB_URL: &str = "https://clob.polymarket.com";

/// Read-only CLOB client.
pub struct ClobClient {
    http: Client,
    base_url: String,
}

impl ClobClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(CLOB_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get order book for a token.
    pub async fn get_order_book(&self, token_id: &str) -> Result<OrderBook, BookError> {
        let url = format!("{}/book?token_id={}", self.base_url, token_id);
        debug!(url = %url, "Fetching order book");

        let resp = self.http.get(&url).send().await.map_err(SourceError::from)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            if status == 404 || text.contains("No orderbook exists") {
                return Err(BookError::NotFound(token_id.to_string()));
            }
            return Err(SourceError::Status { status, body: text }.into());
        }

        let book: OrderBookResponse = resp.json().await.map_err(SourceError::from)?;
        Ok(OrderBook {
            token_id: token_id.to_string(),
            bids: parse_levels(&book.bids),
            asks: parse_levels(&book.asks),
        })
    }
}

#[async_trait]
impl OrderBookSource for ClobClient {
    async fn order_book(&self, token_id: &str) -> Result<OrderBook, BookError> {
        self.get_order_book(token_id).await
    }
}

/// Parse string levels, dropping malformed ones.
fn parse_levels(levels: &[BookLevel]) -> Vec<Level> {
    levels
        .iter()
        .filter_map(|l| match (Decimal::from_str(&l.price), Decimal::from_str(&l.size)) {
            (Ok(price), Ok(size)) => Some(Level { price, size }),
            _ => {
                warn!(price = %l.price, size = %l.size, "Skipping malformed book level");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_levels() {
        let levels = vec![
            BookLevel { price: "0.48".to_string(), size: "120.5".to_string() },
            BookLevel { price: "bad".to_string(), size: "1".to_string() },
        ];

        let parsed = parse_levels(&levels);
        assert_eq!(parsed, vec![Level { price: dec!(0.48), size: dec!(120.5) }]);
    }
}
