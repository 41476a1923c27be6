//! Simulated follower position held during a backtest run.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Decimal places kept for share quantities and average prices.
pub const QUANTITY_SCALE: u32 = 8;

/// Follower holding in one market outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Market condition ID
    pub market_id: String,

    #[serde(default)]
    pub market_title: String,

    /// Outcome label held (e.g., "Yes", "No")
    pub outcome: Option<String>,

    /// Resolved lazily, needed for settlement payout lookups
    pub outcome_index: Option<i32>,

    /// Number of outcome shares held
    pub quantity: Decimal,

    /// Volume-weighted average entry price
    pub avg_price: Decimal,

    /// Leader's still-open size in this outcome; scales ratio-mode sells
    pub leader_open_quantity: Decimal,
}

impl Position {
    /// Open a position from a first buy fill.
    pub fn open(
        market_id: String,
        market_title: String,
        outcome: Option<String>,
        outcome_index: Option<i32>,
        quantity: Decimal,
        price: Decimal,
        leader_quantity: Decimal,
    ) -> Self {
        Self {
            market_id,
            market_title,
            outcome,
            outcome_index,
            quantity,
            avg_price: price,
            leader_open_quantity: leader_quantity,
        }
    }

    /// Add to position (averaging in).
    pub fn add(&mut self, quantity: Decimal, price: Decimal, leader_quantity: Decimal) {
        let total_cost = self.quantity * self.avg_price + quantity * price;
        let new_quantity = self.quantity + quantity;

        if !new_quantity.is_zero() {
            self.avg_price = (total_cost / new_quantity)
                .round_dp_with_strategy(QUANTITY_SCALE, RoundingStrategy::MidpointAwayFromZero);
        }

        self.quantity = new_quantity;
        self.leader_open_quantity += leader_quantity;
    }

    /// Reduce position size, returning the quantity actually removed.
    pub fn reduce(&mut self, quantity: Decimal, leader_quantity: Decimal) -> Decimal {
        let removed = quantity.min(self.quantity).max(Decimal::ZERO);
        self.quantity -= removed;
        self.leader_open_quantity = (self.leader_open_quantity - leader_quantity).max(Decimal::ZERO);
        removed
    }

    /// Cost basis of the shares still held.
    pub fn cost_basis(&self) -> Decimal {
        self.quantity * self.avg_price
    }

    pub fn is_closed(&self) -> bool {
        self.quantity <= Decimal::ZERO
    }
}

/// Round a share quantity down to the kept scale.
pub fn floor_quantity(quantity: Decimal) -> Decimal {
    quantity.round_dp_with_strategy(QUANTITY_SCALE, RoundingStrategy::ToZero)
}
