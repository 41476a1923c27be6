//! Trading logic: copy configuration, follow sizing and admission control.

mod config;
mod filter;
mod position_sizer;

pub use config::{CopyConfig, CopyMode, FilterConfig, KeywordFilterMode};
pub use filter::{ExposureLookup, FilterCategory, FilterPipeline, FilterResult, TokenContext};
pub use position_sizer::{PositionSizer, SellOrder, DEFAULT_MIN_TICK};
