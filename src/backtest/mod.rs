//! Historical replay: fetching leader history, the replay engine and task lifecycle.

mod cache;
mod config;
mod engine;
mod fetcher;
mod service;

pub use cache::CachedOracle;
pub use config::{EngineConfig, FetcherConfig};
pub use engine::BacktestEngine;
pub use fetcher::{HistoricalDataFetcher, HistoryPage};
pub use service::{validate, BacktestService, MAX_BACKTEST_DAYS};
