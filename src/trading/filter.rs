//! Admission-control pipeline shared by live checks and backtest replay.
//!
//! Checks run in a fixed order and stop at the first failure:
//! keyword, tradability, expiry cap, price range, order book, spread, depth, position cap.
//! Local checks come before the order book request.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::api::{OrderBook, OrderBookSource};
use crate::error::BookError;
use crate::models::MarketContext;

use super::config::{FilterConfig, KeywordFilterMode};

/// Which check rejected a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterCategory {
    MarketStatus,
    Keyword,
    PriceRange,
    Spread,
    OrderDepth,
    PositionLimit,
    MarketEndDate,
    OrderbookError,
}

impl FilterCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterCategory::MarketStatus => "MARKET_STATUS",
            FilterCategory::Keyword => "KEYWORD",
            FilterCategory::PriceRange => "PRICE_RANGE",
            FilterCategory::Spread => "SPREAD",
            FilterCategory::OrderDepth => "ORDER_DEPTH",
            FilterCategory::PositionLimit => "POSITION_LIMIT",
            FilterCategory::MarketEndDate => "MARKET_END_DATE",
            FilterCategory::OrderbookError => "ORDERBOOK_ERROR",
        }
    }
}

/// Outcome of running a trade through the pipeline.
#[derive(Debug, Clone)]
pub struct FilterResult {
    pub passed: bool,
    pub category: Option<FilterCategory>,
    pub reason: String,
    /// Book used by the spread and depth checks, if one was fetched
    pub order_book: Option<OrderBook>,
}

impl FilterResult {
    pub fn pass(order_book: Option<OrderBook>) -> Self {
        Self {
            passed: true,
            category: None,
            reason: "All checks passed".to_string(),
            order_book,
        }
    }

    pub fn reject(category: FilterCategory, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            category: Some(category),
            reason: reason.into(),
            order_book: None,
        }
    }

    fn with_book(mut self, book: Option<OrderBook>) -> Self {
        self.order_book = book;
        self
    }
}

/// The outcome token a trade targets.
#[derive(Debug, Clone, Copy)]
pub struct TokenContext<'a> {
    pub token_id: &'a str,
    pub market_id: &'a str,
    pub outcome: Option<&'a str>,
    pub outcome_index: Option<i32>,
    /// Market title as seen on the trade, preferred over the market context's
    pub title: Option<&'a str>,
}

/// Existing exposure to one market outcome.
#[async_trait]
pub trait ExposureLookup: Send + Sync {
    /// Cost basis tracked for the outcome.
    async fn tracked_exposure(
        &self,
        market_id: &str,
        outcome: Option<&str>,
        outcome_index: Option<i32>,
    ) -> Result<Decimal>;

    /// Position value reported by an external source, if any.
    async fn reported_value(
        &self,
        _market_id: &str,
        _outcome: Option<&str>,
        _outcome_index: Option<i32>,
    ) -> Result<Option<Decimal>> {
        Ok(None)
    }
}

/// Short-circuiting admission checks. Holds no mutable state.
pub struct FilterPipeline {
    books: Arc<dyn OrderBookSource>,
}

impl FilterPipeline {
    pub fn new(books: Arc<dyn OrderBookSource>) -> Self {
        Self { books }
    }

    /// Run all configured checks for one trade.
    ///
    /// With `skip_liquidity_checks` a missing or unavailable order book is not a
    /// failure; spread and depth are still evaluated when a book could be fetched.
    #[allow(clippy::too_many_arguments)]
    pub async fn check(
        &self,
        config: &FilterConfig,
        token: &TokenContext<'_>,
        trade_price: Decimal,
        follow_amount: Option<Decimal>,
        market: Option<&MarketContext>,
        exposure: Option<&dyn ExposureLookup>,
        skip_liquidity_checks: bool,
    ) -> FilterResult {
        let title = token
            .title
            .filter(|t| !t.is_empty())
            .or_else(|| market.and_then(|m| m.title.as_deref()));

        if let Some(result) = check_keywords(config, title) {
            return result;
        }

        if let Some(market) = market {
            if let Some(result) = check_tradability(market) {
                return result;
            }
            if let Some(result) = check_end_date(config, market) {
                return result;
            }
        }

        if let Some(result) = check_price_range(config, trade_price) {
            return result;
        }

        let book = match self.fetch_book(config, token, skip_liquidity_checks).await {
            Ok(book) => book,
            Err(result) => return result,
        };

        if let (Some(max_spread), Some(spread)) =
            (config.max_spread, book.as_ref().and_then(|b| b.spread()))
        {
            if spread > max_spread {
                return FilterResult::reject(
                    FilterCategory::Spread,
                    format!("Spread too wide: {} > {}", spread, max_spread),
                )
                .with_book(book);
            }
        }

        if let (Some(min_depth), Some(b)) = (config.min_order_depth, book.as_ref()) {
            let depth = b.depth();
            if depth < min_depth {
                return FilterResult::reject(
                    FilterCategory::OrderDepth,
                    format!("Order book too thin: {} < {}", depth, min_depth),
                )
                .with_book(book);
            }
        }

        if let (Some(cap), Some(amount)) = (config.max_position_value, follow_amount) {
            if let Some(result) = check_position_cap(token, cap, amount, exposure).await {
                return result.with_book(book);
            }
        }

        FilterResult::pass(book)
    }

    /// Fetch the book only when spread or depth limits need it.
    async fn fetch_book(
        &self,
        config: &FilterConfig,
        token: &TokenContext<'_>,
        skip_liquidity_checks: bool,
    ) -> Result<Option<OrderBook>, FilterResult> {
        if !config.needs_order_book() {
            return Ok(None);
        }

        let failure = if token.token_id.is_empty() {
            FilterResult::reject(FilterCategory::MarketStatus, "Trade has no token id")
        } else {
            match self.books.order_book(token.token_id).await {
                Ok(book) if !book.is_empty() => return Ok(Some(book)),
                Ok(_) => FilterResult::reject(FilterCategory::MarketStatus, "Order book is empty"),
                Err(BookError::NotFound(id)) => FilterResult::reject(
                    FilterCategory::MarketStatus,
                    format!("No order book for token {}", id),
                ),
                Err(e) => FilterResult::reject(
                    FilterCategory::OrderbookError,
                    format!("Order book lookup failed: {}", e),
                ),
            }
        };

        if skip_liquidity_checks {
            debug!(token = %token.token_id, reason = %failure.reason, "Order book unavailable, liquidity checks skipped");
            Ok(None)
        } else {
            Err(failure)
        }
    }
}

fn check_keywords(config: &FilterConfig, title: Option<&str>) -> Option<FilterResult> {
    if config.keyword_mode == KeywordFilterMode::Disabled {
        return None;
    }

    let Some(title) = title else {
        return Some(FilterResult::reject(FilterCategory::Keyword, "Market title unknown"));
    };

    let title = title.to_lowercase();
    let matched = config
        .keywords
        .iter()
        .filter(|k| !k.trim().is_empty())
        .find(|k| title.contains(&k.trim().to_lowercase()));

    match (config.keyword_mode, matched) {
        (KeywordFilterMode::Whitelist, None) => Some(FilterResult::reject(
            FilterCategory::Keyword,
            "Title matches no whitelisted keyword",
        )),
        (KeywordFilterMode::Blacklist, Some(k)) => Some(FilterResult::reject(
            FilterCategory::Keyword,
            format!("Title matches blacklisted keyword '{}'", k),
        )),
        _ => None,
    }
}

fn check_tradability(market: &MarketContext) -> Option<FilterResult> {
    let reason = if market.closed {
        "Market is closed".to_string()
    } else if market.archived {
        "Market is archived".to_string()
    } else if !market.active {
        "Market is inactive".to_string()
    } else {
        match market.end_date {
            Some(end) if end < market.as_of => format!("Market ended at {}", end),
            _ => return None,
        }
    };
    Some(FilterResult::reject(FilterCategory::MarketStatus, reason))
}

fn check_end_date(config: &FilterConfig, market: &MarketContext) -> Option<FilterResult> {
    let max_hours = config.max_market_end_hours?;
    let end = market.end_date?;
    let remaining = end - market.as_of;
    if remaining > Duration::hours(max_hours) {
        return Some(FilterResult::reject(
            FilterCategory::MarketEndDate,
            format!("Market ends in {}h > {}h", remaining.num_hours(), max_hours),
        ));
    }
    None
}

fn check_price_range(config: &FilterConfig, price: Decimal) -> Option<FilterResult> {
    if let Some(min) = config.min_price {
        if price < min {
            return Some(FilterResult::reject(
                FilterCategory::PriceRange,
                format!("Price too low: {} < {}", price, min),
            ));
        }
    }
    if let Some(max) = config.max_price {
        if price > max {
            return Some(FilterResult::reject(
                FilterCategory::PriceRange,
                format!("Price too high: {} > {}", price, max),
            ));
        }
    }
    None
}

async fn check_position_cap(
    token: &TokenContext<'_>,
    cap: Decimal,
    amount: Decimal,
    exposure: Option<&dyn ExposureLookup>,
) -> Option<FilterResult> {
    let current = match exposure {
        Some(lookup) => {
            let tracked = lookup
                .tracked_exposure(token.market_id, token.outcome, token.outcome_index)
                .await;
            let reported = lookup
                .reported_value(token.market_id, token.outcome, token.outcome_index)
                .await;
            match (tracked, reported) {
                (Ok(tracked), Ok(reported)) => tracked.max(reported.unwrap_or(Decimal::ZERO)),
                (Err(e), _) | (_, Err(e)) => {
                    return Some(FilterResult::reject(
                        FilterCategory::PositionLimit,
                        format!("Exposure lookup failed: {}", e),
                    ));
                }
            }
        }
        None => Decimal::ZERO,
    };

    if current + amount > cap {
        return Some(FilterResult::reject(
            FilterCategory::PositionLimit,
            format!("Position limit: {} + {} > {}", current, amount, cap),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Level;
    use crate::error::SourceError;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum BookReply {
        Book(OrderBook),
        NotFound,
        Fail,
    }

    struct MockBooks {
        reply: BookReply,
        calls: AtomicU32,
    }

    impl MockBooks {
        fn new(reply: BookReply) -> Arc<Self> {
            Arc::new(Self { reply, calls: AtomicU32::new(0) })
        }
    }

    #[async_trait]
    impl OrderBookSource for MockBooks {
        async fn order_book(&self, token_id: &str) -> Result<OrderBook, BookError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                BookReply::Book(b) => Ok(b.clone()),
                BookReply::NotFound => Err(BookError::NotFound(token_id.to_string())),
                BookReply::Fail => Err(SourceError::Status { status: 502, body: String::new() }.into()),
            }
        }
    }

    struct FixedExposure {
        tracked: Decimal,
        reported: Option<Decimal>,
        fail: bool,
    }

    #[async_trait]
    impl ExposureLookup for FixedExposure {
        async fn tracked_exposure(&self, _: &str, _: Option<&str>, _: Option<i32>) -> Result<Decimal> {
            if self.fail {
                anyhow::bail!("store offline");
            }
            Ok(self.tracked)
        }

        async fn reported_value(&self, _: &str, _: Option<&str>, _: Option<i32>) -> Result<Option<Decimal>> {
            Ok(self.reported)
        }
    }

    fn book(spread_ask: Decimal, size: Decimal) -> OrderBook {
        OrderBook {
            token_id: "tok".to_string(),
            bids: vec![Level { price: dec!(0.50), size }],
            asks: vec![Level { price: spread_ask, size }],
        }
    }

    fn token<'a>(title: Option<&'a str>) -> TokenContext<'a> {
        TokenContext {
            token_id: "tok",
            market_id: "0xm",
            outcome: Some("Yes"),
            outcome_index: Some(0),
            title,
        }
    }

    fn open_market() -> MarketContext {
        MarketContext {
            title: None,
            end_date: Some(Utc::now() + Duration::hours(48)),
            closed: false,
            archived: false,
            active: true,
            as_of: Utc::now(),
        }
    }

    async fn run(
        pipeline: &FilterPipeline,
        config: &FilterConfig,
        title: Option<&str>,
        price: Decimal,
        market: Option<&MarketContext>,
        skip: bool,
    ) -> FilterResult {
        pipeline
            .check(config, &token(title), price, Some(dec!(10)), market, None, skip)
            .await
    }

    #[tokio::test]
    async fn test_keyword_modes() {
        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::NotFound));
        let mut config = FilterConfig {
            keyword_mode: KeywordFilterMode::Whitelist,
            keywords: vec!["bitcoin".to_string()],
            ..Default::default()
        };

        let result = run(&pipeline, &config, Some("Will BITCOIN hit 100k?"), dec!(0.5), None, true).await;
        assert!(result.passed);

        let result = run(&pipeline, &config, Some("Election winner"), dec!(0.5), None, true).await;
        assert_eq!(result.category, Some(FilterCategory::Keyword));

        let result = run(&pipeline, &config, None, dec!(0.5), None, true).await;
        assert_eq!(result.category, Some(FilterCategory::Keyword));

        config.keyword_mode = KeywordFilterMode::Blacklist;
        let result = run(&pipeline, &config, Some("Will bitcoin hit 100k?"), dec!(0.5), None, true).await;
        assert_eq!(result.category, Some(FilterCategory::Keyword));

        config.keywords.clear();
        assert!(run(&pipeline, &config, Some("Anything"), dec!(0.5), None, true).await.passed);

        config.keyword_mode = KeywordFilterMode::Whitelist;
        let result = run(&pipeline, &config, Some("Anything"), dec!(0.5), None, true).await;
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_market_status_checks() {
        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::NotFound));
        let config = FilterConfig::default();

        let mut market = open_market();
        market.closed = true;
        let result = run(&pipeline, &config, Some("t"), dec!(0.5), Some(&market), true).await;
        assert_eq!(result.category, Some(FilterCategory::MarketStatus));

        let mut market = open_market();
        market.end_date = Some(market.as_of - Duration::minutes(1));
        let result = run(&pipeline, &config, Some("t"), dec!(0.5), Some(&market), true).await;
        assert_eq!(result.category, Some(FilterCategory::MarketStatus));
        assert!(result.reason.contains("ended"));
    }

    #[tokio::test]
    async fn test_end_date_cap() {
        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::NotFound));
        let config = FilterConfig {
            max_market_end_hours: Some(24),
            ..Default::default()
        };

        let result = run(&pipeline, &config, Some("t"), dec!(0.5), Some(&open_market()), true).await;
        assert_eq!(result.category, Some(FilterCategory::MarketEndDate));
    }

    #[tokio::test]
    async fn test_price_range() {
        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::NotFound));
        let config = FilterConfig {
            min_price: Some(dec!(0.10)),
            max_price: Some(dec!(0.90)),
            ..Default::default()
        };

        assert!(run(&pipeline, &config, None, dec!(0.10), None, true).await.passed);
        let low = run(&pipeline, &config, None, dec!(0.05), None, true).await;
        assert_eq!(low.category, Some(FilterCategory::PriceRange));
        let high = run(&pipeline, &config, None, dec!(0.95), None, true).await;
        assert!(high.reason.contains("too high"));
    }

    #[tokio::test]
    async fn test_book_not_fetched_without_liquidity_limits() {
        let books = MockBooks::new(BookReply::NotFound);
        let pipeline = FilterPipeline::new(books.clone());

        let result = run(&pipeline, &FilterConfig::default(), None, dec!(0.5), None, false).await;
        assert!(result.passed);
        assert_eq!(books.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_book_depends_on_liquidity_flag() {
        let config = FilterConfig {
            max_spread: Some(dec!(0.05)),
            ..Default::default()
        };

        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::NotFound));
        let live = run(&pipeline, &config, None, dec!(0.5), None, false).await;
        assert_eq!(live.category, Some(FilterCategory::MarketStatus));
        assert!(run(&pipeline, &config, None, dec!(0.5), None, true).await.passed);

        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::Fail));
        let live = run(&pipeline, &config, None, dec!(0.5), None, false).await;
        assert_eq!(live.category, Some(FilterCategory::OrderbookError));

        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::Book(OrderBook::default())));
        let live = run(&pipeline, &config, None, dec!(0.5), None, false).await;
        assert_eq!(live.category, Some(FilterCategory::MarketStatus));
    }

    #[tokio::test]
    async fn test_spread_and_depth() {
        let config = FilterConfig {
            max_spread: Some(dec!(0.05)),
            min_order_depth: Some(dec!(100)),
            ..Default::default()
        };

        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::Book(book(dec!(0.60), dec!(1000)))));
        let wide = run(&pipeline, &config, None, dec!(0.5), None, true).await;
        assert_eq!(wide.category, Some(FilterCategory::Spread));
        assert!(wide.order_book.is_some());

        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::Book(book(dec!(0.52), dec!(10)))));
        let thin = run(&pipeline, &config, None, dec!(0.5), None, true).await;
        assert_eq!(thin.category, Some(FilterCategory::OrderDepth));

        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::Book(book(dec!(0.52), dec!(1000)))));
        let ok = run(&pipeline, &config, None, dec!(0.5), None, false).await;
        assert!(ok.passed);
        assert!(ok.order_book.is_some());
    }

    #[tokio::test]
    async fn test_position_cap_uses_larger_exposure() {
        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::NotFound));
        let config = FilterConfig {
            max_position_value: Some(dec!(100)),
            ..Default::default()
        };
        let check = |exposure: FixedExposure| {
            let pipeline = &pipeline;
            let config = &config;
            async move {
                pipeline
                    .check(config, &token(None), dec!(0.5), Some(dec!(20)), None, Some(&exposure), true)
                    .await
            }
        };

        let result = check(FixedExposure { tracked: dec!(70), reported: Some(dec!(30)), fail: false }).await;
        assert!(result.passed);

        let result = check(FixedExposure { tracked: dec!(30), reported: Some(dec!(90)), fail: false }).await;
        assert_eq!(result.category, Some(FilterCategory::PositionLimit));

        let result = check(FixedExposure { tracked: dec!(0), reported: None, fail: true }).await;
        assert_eq!(result.category, Some(FilterCategory::PositionLimit));
    }

    #[tokio::test]
    async fn test_first_failure_wins() {
        let pipeline = FilterPipeline::new(MockBooks::new(BookReply::NotFound));
        let config = FilterConfig {
            keyword_mode: KeywordFilterMode::Blacklist,
            keywords: vec!["sports".to_string()],
            min_price: Some(dec!(0.9)),
            ..Default::default()
        };
        let mut market = open_market();
        market.closed = true;

        let result = run(&pipeline, &config, Some("Sports final"), dec!(0.5), Some(&market), true).await;
        assert_eq!(result.category, Some(FilterCategory::Keyword));

        let result = run(&pipeline, &config, Some("Election"), dec!(0.5), Some(&market), true).await;
        assert_eq!(result.category, Some(FilterCategory::MarketStatus));
    }
}
