//! Polymarket Gamma API client: market metadata, resolution and prices.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::MarketSnapshot;

use super::sources::MarketOracle;
use super::types::GammaMarketResponse;

pub const GAMMA_URL: &str = "https://gamma-api.polymarket.com";

/// Client for market metadata lookups.
pub struct GammaClient {
    http: Client,
    base_url: String,
}

impl GammaClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(GAMMA_URL.to_string())
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

    /// Get market information by condition ID.
    pub async fn get_market(&self, condition_id: &str) -> Result<Option<MarketSnapshot>> {
        let url = format!("{}/markets?condition_ids={}", self.base_url, condition_id);
        debug!(url = %url, "Fetching market");

        let resp = self.http.get(&url).send().await.context("Failed to fetch market")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to get market: {} - {}", status, text));
        }

        let markets: Vec<GammaMarketResponse> =
            resp.json().await.context("Failed to parse market response")?;

        Ok(markets
            .into_iter()
            .find(|m| m.condition_id.eq_ignore_ascii_case(condition_id))
            .map(snapshot_from_response))
    }

    async fn require_market(&self, market_id: &str) -> Result<MarketSnapshot> {
        self.get_market(market_id)
            .await?
            .ok_or_else(|| anyhow!("Market {} not found", market_id))
    }
}

#[async_trait]
impl MarketOracle for GammaClient {
    async fn market_snapshot(&self, market_id: &str) -> Result<Option<MarketSnapshot>> {
        self.get_market(market_id).await
    }

    async fn market_resolution(&self, market_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get_market(market_id).await?.and_then(|m| m.resolved_at))
    }

    async fn settlement_payout(&self, market_id: &str, outcome_index: i32) -> Result<Option<Decimal>> {
        let market = self.require_market(market_id).await?;
        if market.resolved_at.is_none() {
            return Ok(None);
        }
        Ok(market.price_of(outcome_index))
    }

    async fn mark_price(&self, market_id: &str, outcome_index: i32) -> Result<Decimal> {
        self.require_market(market_id)
            .await?
            .price_of(outcome_index)
            .ok_or_else(|| anyhow!("No price for outcome {} of {}", outcome_index, market_id))
    }

    async fn resolve_outcome_index(
        &self,
        market_id: &str,
        outcome: Option<&str>,
        outcome_index: Option<i32>,
    ) -> Result<Option<i32>> {
        if outcome_index.is_some() {
            return Ok(outcome_index);
        }
        let Some(label) = outcome else {
            return Ok(None);
        };
        Ok(self.require_market(market_id).await?.outcome_index(label))
    }
}

/// Convert a Gamma market into a snapshot.
///
/// A market counts as resolved once it is closed and every outcome price is exactly 0 or 1.
pub fn snapshot_from_response(m: GammaMarketResponse) -> MarketSnapshot {
    let outcomes: Vec<String> = parse_json_list(m.outcomes.as_deref());
    let outcome_prices: Vec<Decimal> = parse_json_list::<String>(m.outcome_prices.as_deref())
        .iter()
        .filter_map(|p| match Decimal::from_str(p) {
            Ok(d) => Some(d),
            Err(_) => {
                warn!(market = %m.condition_id, price = %p, "Unparseable outcome price");
                None
            }
        })
        .collect();
    let token_ids: Vec<String> = parse_json_list(m.clob_token_ids.as_deref());

    let end_date = m.end_date.as_deref().and_then(parse_gamma_time);

    let payouts_final = !outcome_prices.is_empty()
        && outcome_prices.len() == outcomes.len()
        && outcome_prices.iter().all(|p| *p == Decimal::ZERO || *p == Decimal::ONE)
        && outcome_prices.iter().filter(|p| **p == Decimal::ONE).count() == 1;

    let resolved_at = if m.closed && payouts_final {
        m.closed_time
            .as_deref()
            .and_then(parse_gamma_time)
            .or(end_date)
    } else {
        None
    };

    MarketSnapshot {
        condition_id: m.condition_id,
        title: m.question,
        slug: m.slug,
        end_date,
        closed: m.closed,
        archived: m.archived,
        active: m.active,
        resolved_at,
        outcomes,
        outcome_prices,
        token_ids,
    }
}

fn parse_json_list<T: serde::de::DeserializeOwned>(raw: Option<&str>) -> Vec<T> {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

/// Gamma mixes RFC 3339, `2024-11-06 04:12:33+00` and bare dates.
fn parse_gamma_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
