//! Market metadata used for settlement and admission checks.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Market metadata as reported by the Gamma API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Market condition ID (0x-prefixed)
    pub condition_id: String,

    /// Human-readable title
    pub title: String,

    #[serde(default)]
    pub slug: String,

    /// When the market ends
    pub end_date: Option<DateTime<Utc>>,

    pub closed: bool,

    pub archived: bool,

    pub active: bool,

    /// Resolution instant, set once payouts are final
    pub resolved_at: Option<DateTime<Utc>>,

    /// Outcome labels in index order
    #[serde(default)]
    pub outcomes: Vec<String>,

    /// Current prices in outcome order; exactly 0/1 once resolved
    #[serde(default)]
    pub outcome_prices: Vec<Decimal>,

    /// CLOB token ids in outcome order
    #[serde(default)]
    pub token_ids: Vec<String>,
}

impl MarketSnapshot {
    /// Index of an outcome label (case-insensitive).
    pub fn outcome_index(&self, label: &str) -> Option<i32> {
        self.outcomes
            .iter()
            .position(|o| o.eq_ignore_ascii_case(label))
            .map(|i| i as i32)
    }

    pub fn price_of(&self, outcome_index: i32) -> Option<Decimal> {
        usize::try_from(outcome_index)
            .ok()
            .and_then(|i| self.outcome_prices.get(i).copied())
    }

    /// Market state as it was at `as_of`. Resolution after `as_of` is not visible yet.
    pub fn context_at(&self, as_of: DateTime<Utc>) -> MarketContext {
        let resolved = self.resolved_at.is_some_and(|at| at <= as_of);
        MarketContext {
            title: Some(self.title.clone()).filter(|t| !t.is_empty()),
            end_date: self.end_date,
            closed: resolved,
            archived: false,
            active: true,
            as_of,
        }
    }

    /// Market state right now.
    pub fn live_context(&self, now: DateTime<Utc>) -> MarketContext {
        MarketContext {
            title: Some(self.title.clone()).filter(|t| !t.is_empty()),
            end_date: self.end_date,
            closed: self.closed,
            archived: self.archived,
            active: self.active,
            as_of: now,
        }
    }
}

/// Tradability facts handed to the filter pipeline, evaluated at `as_of`.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketContext {
    pub title: Option<String>,
    pub end_date: Option<DateTime<Utc>>,
    pub closed: bool,
    pub archived: bool,
    pub active: bool,
    pub as_of: DateTime<Utc>,
}
