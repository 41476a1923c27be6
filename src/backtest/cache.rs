//! Read-through cache over a market oracle, owned by one replay run.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::api::MarketOracle;
use crate::models::MarketSnapshot;

/// Caches successful oracle answers for the lifetime of the wrapper. Errors are not cached.
pub struct CachedOracle {
    inner: Arc<dyn MarketOracle>,
    snapshots: RwLock<HashMap<String, Option<MarketSnapshot>>>,
    resolutions: RwLock<HashMap<String, Option<DateTime<Utc>>>>,
    payouts: RwLock<HashMap<(String, i32), Option<Decimal>>>,
    marks: RwLock<HashMap<(String, i32), Decimal>>,
    outcome_indexes: RwLock<HashMap<(String, Option<String>, Option<i32>), Option<i32>>>,
}

impl CachedOracle {
    pub fn new(inner: Arc<dyn MarketOracle>) -> Self {
        Self {
            inner,
            snapshots: RwLock::new(HashMap::new()),
            resolutions: RwLock::new(HashMap::new()),
            payouts: RwLock::new(HashMap::new()),
            marks: RwLock::new(HashMap::new()),
            outcome_indexes: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MarketOracle for CachedOracle {
    async fn market_snapshot(&self, market_id: &str) -> Result<Option<MarketSnapshot>> {
        if let Some(hit) = self.snapshots.read().await.get(market_id) {
            return Ok(hit.clone());
        }
        let value = self.inner.market_snapshot(market_id).await?;
        self.snapshots.write().await.insert(market_id.to_string(), value.clone());
        Ok(value)
    }

    async fn market_resolution(&self, market_id: &str) -> Result<Option<DateTime<Utc>>> {
        if let Some(hit) = self.resolutions.read().await.get(market_id) {
            return Ok(*hit);
        }
        let value = self.inner.market_resolution(market_id).await?;
        self.resolutions.write().await.insert(market_id.to_string(), value);
        Ok(value)
    }

    async fn settlement_payout(&self, market_id: &str, outcome_index: i32) -> Result<Option<Decimal>> {
        let key = (market_id.to_string(), outcome_index);
        if let Some(hit) = self.payouts.read().await.get(&key) {
            return Ok(*hit);
        }
        let value = self.inner.settlement_payout(market_id, outcome_index).await?;
        self.payouts.write().await.insert(key, value);
        Ok(value)
    }

    async fn mark_price(&self, market_id: &str, outcome_index: i32) -> Result<Decimal> {
        let key = (market_id.to_string(), outcome_index);
        if let Some(hit) = self.marks.read().await.get(&key) {
            return Ok(*hit);
        }
        let value = self.inner.mark_price(market_id, outcome_index).await?;
        self.marks.write().await.insert(key, value);
        Ok(value)
    }

    async fn resolve_outcome_index(
        &self,
        market_id: &str,
        outcome: Option<&str>,
        outcome_index: Option<i32>,
    ) -> Result<Option<i32>> {
        let key = (market_id.to_string(), outcome.map(str::to_string), outcome_index);
        if let Some(hit) = self.outcome_indexes.read().await.get(&key) {
            return Ok(*hit);
        }
        let value = self.inner.resolve_outcome_index(market_id, outcome, outcome_index).await?;
        self.outcome_indexes.write().await.insert(key, value);
        Ok(value)
    }
}
