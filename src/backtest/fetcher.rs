//! Paginated leader history with bounded fixed-delay retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::api::{ActivityQuery, ActivityResponse, ActivitySource};
use crate::error::{FetchError, SourceError};
use crate::models::{TradeData, TradeSide};

use super::config::FetcherConfig;

/// One page of leader trades.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    /// Trades kept after mapping, in source order
    pub trades: Vec<TradeData>,

    /// Rows the source returned before filtering; zero means no more data
    pub raw_count: usize,
}

impl HistoryPage {
    pub fn end_of_data() -> Self {
        Self::default()
    }
}

/// Constant delay for a fixed number of retries.
struct FixedRetries {
    delay: Duration,
    retries: u32,
    remaining: u32,
}

impl FixedRetries {
    fn new(delay: Duration, max_attempts: u32) -> Self {
        let retries = max_attempts.saturating_sub(1);
        Self { delay, retries, remaining: retries }
    }
}

impl Backoff for FixedRetries {
    fn reset(&mut self) {
        self.remaining = self.retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.delay)
    }
}

/// Wraps the activity source with retry, the offset cap and row normalization.
pub struct HistoricalDataFetcher {
    source: Arc<dyn ActivitySource>,
    config: FetcherConfig,
}

impl HistoricalDataFetcher {
    pub fn new(source: Arc<dyn ActivitySource>, config: FetcherConfig) -> Self {
        Self { source, config }
    }

    /// Fetch page `page` of the leader's trades inside `[start, end]`.
    pub async fn fetch_page(
        &self,
        leader: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: u32,
        page_size: u32,
    ) -> Result<HistoryPage, FetchError> {
        let offset = u64::from(page) * u64::from(page_size);
        if offset > u64::from(self.config.max_offset) {
            debug!(page, offset, max_offset = self.config.max_offset, "Offset cap reached");
            return Ok(HistoryPage::end_of_data());
        }

        let query = ActivityQuery::trades(leader, start.timestamp(), end.timestamp(), page_size, offset as u32);

        let mut attempt = 0u32;
        let source = &self.source;
        let query = &query;
        let operation = || {
            attempt += 1;
            let attempt = attempt;
            async move {
                match source.fetch_activity(query).await {
                    Ok(rows) => Ok(rows),
                    // The endpoint answers 400 once offset runs past the data
                    Err(e) if page > 0 && e.status() == Some(400) => {
                        debug!(page, "Source returned 400 past first page, treating as end of data");
                        Ok(Vec::new())
                    }
                    Err(e) if !e.is_retryable() => Err(backoff::Error::permanent(e)),
                    Err(e) => {
                        warn!(page, attempt, error = %e, "Activity fetch failed, retrying");
                        Err(backoff::Error::transient(e))
                    }
                }
            }
        };

        let backoff = FixedRetries::new(self.config.retry_delay, self.config.max_attempts);
        let rows = backoff::future::retry(backoff, operation)
            .await
            .map_err(|e| classify(e, page, self.config.max_attempts))?;

        let raw_count = rows.len();
        let trades = map_rows(rows, start, end);
        debug!(page, raw_count, kept = trades.len(), "Fetched history page");

        Ok(HistoryPage { trades, raw_count })
    }
}

fn classify(e: SourceError, page: u32, attempts: u32) -> FetchError {
    if e.is_retryable() {
        FetchError::RetriesExhausted { page, attempts, last: e }
    } else {
        FetchError::NonRetryable { page, source: e }
    }
}

/// Normalize raw activity into trades, dropping what cannot be replayed.
fn map_rows(rows: Vec<ActivityResponse>, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TradeData> {
    let mut ordinals: HashMap<String, u32> = HashMap::new();

    rows.into_iter()
        .filter(|r| r.activity_type.eq_ignore_ascii_case("TRADE"))
        .filter_map(|r| {
            let side = r.side.as_deref().and_then(TradeSide::parse);
            let (Some(side), Some(price), Some(size), Some(usdc_amount)) = (side, r.price, r.size, r.usdc_size) else {
                warn!(tx = %r.transaction_hash, market = %r.condition_id, "Dropping trade row with missing fields");
                return None;
            };

            let Some(timestamp) = parse_timestamp(r.timestamp) else {
                warn!(tx = %r.transaction_hash, timestamp = r.timestamp, "Dropping trade row with invalid timestamp");
                return None;
            };
            if timestamp < start || timestamp > end {
                debug!(tx = %r.transaction_hash, %timestamp, "Dropping trade outside window");
                return None;
            }

            let base = if r.transaction_hash.is_empty() {
                format!("{}_{}", r.condition_id, r.timestamp)
            } else {
                r.transaction_hash.clone()
            };
            let seen = ordinals.entry(base.clone()).or_insert(0);
            let trade_id = if *seen == 0 { base } else { format!("{}_{}", base, seen) };
            *seen += 1;

            Some(TradeData {
                trade_id,
                market_id: r.condition_id,
                token_id: r.asset,
                market_title: r.title,
                market_slug: r.slug,
                side,
                outcome: r.outcome.filter(|o| !o.is_empty()),
                outcome_index: r.outcome_index,
                price,
                size,
                usdc_amount,
                timestamp,
            })
        })
        .collect()
}

/// Activity timestamps are epoch seconds; millisecond values are accepted too.
fn parse_timestamp(ts: i64) -> Option<DateTime<Utc>> {
    if ts > 100_000_000_000 {
        Utc.timestamp_millis_opt(ts).single()
    } else {
        Utc.timestamp_opt(ts, 0).single()
    }
}
