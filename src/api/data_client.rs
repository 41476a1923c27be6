//! Polymarket Data API client for leader activity and wallet positions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::error::SourceError;

use super::sources::ActivitySource;
use super::types::*;

pub const DATA_API_BASE: &str = "https://data-api.polymarket.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for Polymarket Data API (read-only operations).
pub struct DataClient {
    client: Client,
    base_url: String,
}

impl DataClient {
    /// Create a new data client with default settings.
    pub fn new() -> Result<Self> {
        Self::with_base_url(DATA_API_BASE.to_string())
    }

    /// Create with custom base URL.
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch open positions of a wallet.
    pub async fn get_positions(&self, address: &str) -> Result<Vec<PositionResponse>> {
        let url = format!("{}/positions?user={}&limit=500", self.base_url, address);

        debug!(url = %url, "Fetching positions");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch positions")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Positions request failed: {} - {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse positions response")
    }
}

#[async_trait]
impl ActivitySource for DataClient {
    async fn fetch_activity(&self, query: &ActivityQuery) -> Result<Vec<ActivityResponse>, SourceError> {
        let url = format!("{}/activity", self.base_url);

        debug!(
            url = %url,
            user = %query.user,
            offset = query.offset,
            limit = query.limit,
            "Fetching activity"
        );

        let response = self.client.get(&url).query(query).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status { status, body });
        }

        Ok(response.json().await?)
    }
}
