//! Polymarket API clients and the collaborator traits they implement.

mod clob_client;
mod data_client;
mod gamma_client;
mod sources;
mod types;

pub use clob_client::{ClobClient, CLOB_URL};
pub use data_client::{DataClient, DATA_API_BASE};
pub use gamma_client::{GammaClient, GAMMA_URL};
pub use sources::{ActivitySource, Level, MarketOracle, OrderBook, OrderBookSource};
pub use types::*;
