//! Follow sizing: copy amounts, slippage-adjusted prices and sell quantities.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::{floor_quantity, Position};

use super::config::{CopyConfig, CopyMode};

/// Lowest price a simulated fill can execute at.
pub const DEFAULT_MIN_TICK: Decimal = dec!(0.01);

/// A sized sell order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SellOrder {
    pub quantity: Decimal,
    pub amount: Decimal,
}

/// Applies a copy configuration to leader trades.
pub struct PositionSizer<'a> {
    config: &'a CopyConfig,
    min_tick: Decimal,
}

impl<'a> PositionSizer<'a> {
    pub fn new(config: &'a CopyConfig, min_tick: Decimal) -> Self {
        Self { config, min_tick }
    }

    /// Follow amount before the balance is considered, clamped into the order size range.
    pub fn follow_amount(&self, leader_amount: Decimal) -> Decimal {
        let raw = match self.config.copy_mode {
            CopyMode::Ratio => leader_amount * self.config.copy_ratio,
            CopyMode::Fixed => self.config.fixed_amount.unwrap_or(Decimal::ZERO),
        };
        self.apply_constraints(raw)
    }

    /// USDC to spend on a BUY, or `None` when the balance cannot cover a minimum order.
    pub fn buy_amount(&self, leader_amount: Decimal, balance: Decimal) -> Option<Decimal> {
        let amount = self.follow_amount(leader_amount).min(balance);
        if amount <= Decimal::ZERO || amount < self.config.min_order_size {
            return None;
        }
        Some(amount)
    }

    /// Leader price pushed up by slippage, floored at the minimum tick.
    pub fn buy_price(&self, leader_price: Decimal) -> Decimal {
        (leader_price * (Decimal::ONE + self.slippage())).max(self.min_tick)
    }

    /// Leader price pushed down by slippage, floored at the minimum tick.
    pub fn sell_price(&self, leader_price: Decimal) -> Decimal {
        (leader_price * (Decimal::ONE - self.slippage())).max(self.min_tick)
    }

    /// Shares a BUY of `amount` gets at `price`, rounded down.
    pub fn buy_quantity(&self, amount: Decimal, price: Decimal) -> Decimal {
        floor_quantity(amount / price)
    }

    /// Size the follower's sell for a leader sell of `leader_size`.
    ///
    /// Ratio mode sells the share of the position matching the share of the leader's
    /// open size being closed; fixed mode closes the whole position.
    pub fn sell_order(&self, position: &Position, leader_size: Decimal, price: Decimal) -> Option<SellOrder> {
        let mut quantity = match self.config.copy_mode {
            CopyMode::Ratio if position.leader_open_quantity > Decimal::ZERO => {
                floor_quantity(position.quantity * leader_size / position.leader_open_quantity)
                    .min(position.quantity)
            }
            _ => position.quantity,
        };

        let mut amount = quantity * price;
        if amount <= Decimal::ZERO || amount < self.config.min_order_size {
            return None;
        }
        if amount > self.config.max_order_size {
            quantity = floor_quantity(self.config.max_order_size / price);
            amount = quantity * price;
        }

        Some(SellOrder { quantity, amount })
    }

    fn apply_constraints(&self, amount: Decimal) -> Decimal {
        amount
            .max(self.config.min_order_size)
            .min(self.config.max_order_size)
    }

    fn slippage(&self) -> Decimal {
        self.config.slippage_percent / dec!(100)
    }
}
