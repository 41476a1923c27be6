//! Copy-trading and admission-control configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// How the follow amount of a BUY is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CopyMode {
    /// Follow amount scales with the leader's trade amount
    Ratio,
    /// Constant follow amount regardless of leader size
    Fixed,
}

impl CopyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyMode::Ratio => "RATIO",
            CopyMode::Fixed => "FIXED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "RATIO" => Some(CopyMode::Ratio),
            "FIXED" => Some(CopyMode::Fixed),
            _ => None,
        }
    }
}

/// Keyword filter applied to market titles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeywordFilterMode {
    #[default]
    Disabled,
    Whitelist,
    Blacklist,
}

impl KeywordFilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeywordFilterMode::Disabled => "DISABLED",
            KeywordFilterMode::Whitelist => "WHITELIST",
            KeywordFilterMode::Blacklist => "BLACKLIST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "DISABLED" => Some(KeywordFilterMode::Disabled),
            "WHITELIST" => Some(KeywordFilterMode::Whitelist),
            "BLACKLIST" => Some(KeywordFilterMode::Blacklist),
            _ => None,
        }
    }
}

/// Admission limits checked by the filter pipeline. Unset limits are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub keyword_mode: KeywordFilterMode,

    /// Case-insensitive substrings matched against the market title
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Lowest leader price to follow (0-1)
    pub min_price: Option<Decimal>,

    /// Highest leader price to follow (0-1)
    pub max_price: Option<Decimal>,

    /// Widest acceptable best ask minus best bid
    pub max_spread: Option<Decimal>,

    /// Minimum order book notional, both sides summed
    pub min_order_depth: Option<Decimal>,

    /// Cap on exposure to a single market outcome in USDC
    pub max_position_value: Option<Decimal>,

    /// Skip markets ending further out than this many hours
    pub max_market_end_hours: Option<i64>,
}

impl FilterConfig {
    /// Whether any check needs the order book.
    pub fn needs_order_book(&self) -> bool {
        self.max_spread.is_some() || self.min_order_depth.is_some()
    }
}

/// Risk and sizing parameters of a copy-trading configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyConfig {
    pub copy_mode: CopyMode,

    /// Multiplier on the leader's USDC amount in ratio mode
    pub copy_ratio: Decimal,

    /// USDC per BUY in fixed mode
    pub fixed_amount: Option<Decimal>,

    /// Minimum order size in USDC
    pub min_order_size: Decimal,

    /// Maximum order size in USDC
    pub max_order_size: Decimal,

    /// Stop buying for the day once realized losses exceed this
    pub max_daily_loss: Option<Decimal>,

    /// Maximum BUY fills per day
    pub max_daily_orders: Option<u32>,

    /// Simulated slippage in percent (0 to 100)
    pub slippage_percent: Decimal,

    /// Follow the leader's sells
    pub support_sell: bool,

    #[serde(default)]
    pub filter: FilterConfig,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            copy_mode: CopyMode::Ratio,
            copy_ratio: dec!(1.0),           // Mirror the leader
            fixed_amount: None,
            min_order_size: dec!(1.0),       // Min $1
            max_order_size: dec!(1000.0),    // Max $1000
            max_daily_loss: None,
            max_daily_orders: None,
            slippage_percent: dec!(0),
            support_sell: true,
            filter: FilterConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(CopyMode::parse("ratio"), Some(CopyMode::Ratio));
        assert_eq!(CopyMode::parse("FIXED"), Some(CopyMode::Fixed));
        assert_eq!(KeywordFilterMode::parse("blacklist"), Some(KeywordFilterMode::Blacklist));
        assert_eq!(KeywordFilterMode::parse("other"), None);
    }

    #[test]
    fn test_needs_order_book() {
        let mut filter = FilterConfig::default();
        assert!(!filter.needs_order_book());
        filter.min_order_depth = Some(dec!(100));
        assert!(filter.needs_order_book());
    }
}
