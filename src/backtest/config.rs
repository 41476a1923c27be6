//! Engine and fetcher tuning.

use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;

use crate::trading::DEFAULT_MIN_TICK;

/// Retry and pagination limits of the historical fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct FetcherConfig {
    /// Deepest offset the activity endpoint accepts
    pub max_offset: u32,

    /// Attempts per page, first try included
    pub max_attempts: u32,

    /// Fixed delay between attempts
    pub retry_delay: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_offset: 10_000,
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Replay engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Leader trades requested per page
    pub page_size: u32,

    pub fetcher: FetcherConfig,

    /// Lowest simulated execution price
    pub min_tick: Decimal,

    /// Value still-open positions at the current price when a run completes
    pub mark_to_market: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            fetcher: FetcherConfig::default(),
            min_tick: DEFAULT_MIN_TICK,
            mark_to_market: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by environment variables:
    /// - BACKTEST_PAGE_SIZE
    /// - BACKTEST_MAX_OFFSET
    /// - BACKTEST_RETRY_ATTEMPTS
    /// - BACKTEST_RETRY_DELAY_MS
    /// - BACKTEST_MARK_TO_MARKET (true/false)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_var("BACKTEST_PAGE_SIZE") {
            config.page_size = v.parse().context("Invalid BACKTEST_PAGE_SIZE")?;
        }
        if let Some(v) = env_var("BACKTEST_MAX_OFFSET") {
            config.fetcher.max_offset = v.parse().context("Invalid BACKTEST_MAX_OFFSET")?;
        }
        if let Some(v) = env_var("BACKTEST_RETRY_ATTEMPTS") {
            config.fetcher.max_attempts = v.parse().context("Invalid BACKTEST_RETRY_ATTEMPTS")?;
        }
        if let Some(v) = env_var("BACKTEST_RETRY_DELAY_MS") {
            let ms: u64 = v.parse().context("Invalid BACKTEST_RETRY_DELAY_MS")?;
            config.fetcher.retry_delay = Duration::from_millis(ms);
        }
        if let Some(v) = env_var("BACKTEST_MARK_TO_MARKET") {
            config.mark_to_market = v.parse().context("Invalid BACKTEST_MARK_TO_MARKET")?;
        }

        anyhow::ensure!(config.page_size > 0, "BACKTEST_PAGE_SIZE must be positive");
        anyhow::ensure!(config.fetcher.max_attempts > 0, "BACKTEST_RETRY_ATTEMPTS must be positive");

        Ok(config)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
