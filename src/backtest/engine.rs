//! Replays a leader's trade history against a simulated follower account.
//!
//! Each run walks the leader's history page by page in time order, settles
//! positions whose market resolved before the next trade, sizes and records
//! follower fills, and persists every page together with its checkpoint.
//! A STOPPED or FAILED task resumes from that checkpoint with its positions
//! rebuilt from the persisted ledger.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::api::{ActivitySource, MarketOracle, OrderBookSource};
use crate::db::TaskStore;
use crate::error::TaskError;
use crate::metrics::StatisticsCalculator;
use crate::models::{
    position_key, BacktestTask, BacktestTrade, LedgerSide, Position, SettlementKind, TaskOutcome,
    TaskStatus, TradeData, TradeSide,
};
use crate::trading::{ExposureLookup, FilterPipeline, PositionSizer, TokenContext};

use super::cache::CachedOracle;
use super::config::EngineConfig;
use super::fetcher::HistoricalDataFetcher;

/// Follower state of one run. Every ledger row goes through [`ReplayState::apply`],
/// both when it is produced and when a resumed run rebuilds its state.
#[derive(Debug, Clone, Default)]
struct ReplayState {
    balance: Decimal,
    next_seq: i64,
    positions: BTreeMap<String, Position>,
    daily_orders: HashMap<NaiveDate, u32>,
    daily_losses: HashMap<NaiveDate, Decimal>,
}

impl ReplayState {
    fn restore(task: &BacktestTask, ledger: &[BacktestTrade]) -> Self {
        let mut state = Self {
            balance: task.initial_balance,
            ..Default::default()
        };
        for row in ledger {
            state.apply(row);
        }
        state.balance = task.current_balance();
        state
    }

    fn apply(&mut self, row: &BacktestTrade) {
        self.balance = row.balance_after;
        self.next_seq = row.seq + 1;

        let key = position_key(&row.market_id, row.outcome.as_deref(), row.outcome_index);
        let day = row.trade_time.date_naive();
        let leader_quantity = row.leader_quantity.unwrap_or(Decimal::ZERO);

        match row.side {
            LedgerSide::Buy => {
                *self.daily_orders.entry(day).or_insert(0) += 1;
                match self.positions.get_mut(&key) {
                    Some(position) => position.add(row.quantity, row.price, leader_quantity),
                    None => {
                        let position = Position::open(
                            row.market_id.clone(),
                            row.market_title.clone(),
                            row.outcome.clone(),
                            row.outcome_index,
                            row.quantity,
                            row.price,
                            leader_quantity,
                        );
                        self.positions.insert(key, position);
                    }
                }
            }
            LedgerSide::Sell => {
                let closed = match self.positions.get_mut(&key) {
                    Some(position) => {
                        position.reduce(row.quantity, leader_quantity);
                        position.is_closed()
                    }
                    None => false,
                };
                if closed {
                    self.positions.remove(&key);
                }
                if let Some(pnl) = row.profit_loss.filter(|p| *p < Decimal::ZERO) {
                    *self.daily_losses.entry(day).or_insert(Decimal::ZERO) -= pnl;
                }
            }
            LedgerSide::Settlement => {
                self.positions.remove(&key);
            }
        }
    }

    fn record(&mut self, row: BacktestTrade, rows: &mut Vec<BacktestTrade>) {
        self.apply(&row);
        rows.push(row);
    }

    fn daily_orders(&self, day: NaiveDate) -> u32 {
        self.daily_orders.get(&day).copied().unwrap_or(0)
    }

    fn daily_loss(&self, day: NaiveDate) -> Decimal {
        self.daily_losses.get(&day).copied().unwrap_or(Decimal::ZERO)
    }

    /// Reason to end the replay early, if the account can no longer trade.
    fn liquidity_halt(&self) -> Option<&'static str> {
        if self.balance < Decimal::ZERO {
            return Some("balance below zero");
        }
        if self.balance < Decimal::ONE && self.positions.is_empty() {
            return Some("balance exhausted with no open positions");
        }
        None
    }

    /// Closing row for a whole position at `price` per share.
    fn closing_row(
        &self,
        task_id: &str,
        position: &Position,
        at: DateTime<Utc>,
        kind: SettlementKind,
        price: Decimal,
    ) -> BacktestTrade {
        let amount = position.quantity * price;
        BacktestTrade {
            task_id: task_id.to_string(),
            seq: self.next_seq,
            trade_time: at,
            side: LedgerSide::Settlement,
            settlement_kind: Some(kind),
            market_id: position.market_id.clone(),
            market_title: position.market_title.clone(),
            outcome: position.outcome.clone(),
            outcome_index: position.outcome_index,
            quantity: position.quantity,
            price,
            amount,
            fee: Decimal::ZERO,
            profit_loss: Some(amount - position.cost_basis()),
            balance_after: self.balance + amount,
            leader_trade_id: None,
            leader_quantity: None,
        }
    }
}

/// Cost basis already committed by the task plus rows of the page in flight.
struct RunExposure<'a> {
    store: &'a dyn TaskStore,
    task_id: &'a str,
    pending: &'a [BacktestTrade],
}

#[async_trait]
impl ExposureLookup for RunExposure<'_> {
    async fn tracked_exposure(
        &self,
        market_id: &str,
        outcome: Option<&str>,
        outcome_index: Option<i32>,
    ) -> Result<Decimal> {
        let committed = self
            .store
            .sum_exposure(self.task_id, market_id, outcome, outcome_index)
            .await?;
        let pending: Decimal = self
            .pending
            .iter()
            .filter(|r| r.matches_outcome(market_id, outcome, outcome_index))
            .map(|r| r.cost_basis_delta())
            .sum();
        Ok((committed + pending).max(Decimal::ZERO))
    }
}

/// First page to request when resuming after `last_index`.
fn start_page(last_index: Option<i64>, page_size: u32) -> u32 {
    match last_index {
        Some(last) if last >= 0 => ((last + 1) / i64::from(page_size)) as u32,
        _ => 0,
    }
}

/// Backtest replay engine.
pub struct BacktestEngine {
    store: Arc<dyn TaskStore>,
    fetcher: HistoricalDataFetcher,
    oracle: Arc<dyn MarketOracle>,
    filter: FilterPipeline,
    config: EngineConfig,
    /// Tasks this engine has taken and not yet finished
    active: RwLock<HashSet<String>>,
}

impl BacktestEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        source: Arc<dyn ActivitySource>,
        oracle: Arc<dyn MarketOracle>,
        books: Arc<dyn OrderBookSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            fetcher: HistoricalDataFetcher::new(source, config.fetcher.clone()),
            oracle,
            filter: FilterPipeline::new(books),
            config,
            active: RwLock::new(HashSet::new()),
        }
    }

    /// Ids of the runs currently driven by this engine.
    pub async fn active_runs(&self) -> Vec<String> {
        self.active.read().await.iter().cloned().collect()
    }

    /// Run a task from its checkpoint, returning the status it ends in.
    ///
    /// Only a PENDING task can be taken; losing that race is an `InvalidState`
    /// error and leaves the task alone. Any later error marks the task FAILED,
    /// keeping its checkpoint, and is returned.
    pub async fn run(&self, task_id: &str) -> Result<TaskStatus> {
        if !self.store.mark_running(task_id, Utc::now()).await? {
            let status = self.current_status(task_id).await?;
            return Err(TaskError::InvalidState {
                id: task_id.to_string(),
                status: status.to_string(),
                action: "run",
            }
            .into());
        }
        // Checkpoint as of taking the task
        let task = self
            .store
            .load_task(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        info!(
            task = %task_id,
            leader = %task.leader_address,
            resume_from = ?task.last_processed_trade_index,
            "Starting backtest run"
        );

        self.active.write().await.insert(task_id.to_string());
        let result = self.replay(&task).await;
        self.active.write().await.remove(task_id);

        match result {
            Ok(status) => {
                info!(task = %task_id, status = %status, "Backtest run ended");
                Ok(status)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(task = %task_id, error = %message, "Backtest run failed");
                if let Err(store_err) = self.store.mark_failed(task_id, &message, Utc::now()).await {
                    error!(task = %task_id, error = %store_err, "Failed to record task failure");
                }
                Err(e)
            }
        }
    }

    async fn replay(&self, task: &BacktestTask) -> Result<TaskStatus> {
        let oracle = CachedOracle::new(self.oracle.clone());
        let ledger = self.store.ledger_rows(&task.id).await?;
        let mut state = ReplayState::restore(task, &ledger);
        let sizer = PositionSizer::new(&task.config, self.config.min_tick);

        let page_size = self.config.page_size;
        let mut checkpoint = task.checkpoint();
        let mut page = start_page(checkpoint.last_processed_trade_index, page_size);

        loop {
            let status = self.current_status(&task.id).await?;
            if status != TaskStatus::Running {
                info!(task = %task.id, status = %status, page, "Task no longer running, stopping replay");
                return Ok(status);
            }

            let fetched = self
                .fetcher
                .fetch_page(&task.leader_address, task.start_time, task.end_time, page, page_size)
                .await?;
            if fetched.raw_count == 0 {
                debug!(task = %task.id, page, "No more leader trades");
                break;
            }

            let mut rows = Vec::new();
            let mut halted = false;

            for (i, trade) in fetched.trades.iter().enumerate() {
                let index = i64::from(page) * i64::from(page_size) + i as i64;
                if checkpoint.last_processed_trade_index.is_some_and(|last| index <= last) {
                    continue;
                }

                self.settle_up_to(&oracle, &task.id, &mut state, trade.timestamp, &mut rows)
                    .await;

                if let Some(reason) = state.liquidity_halt() {
                    info!(task = %task.id, balance = %state.balance, reason, "Ending replay early");
                    halted = true;
                    break;
                }

                self.follow(&oracle, task, &sizer, &mut state, trade, &mut rows).await;

                checkpoint.last_processed_trade_index = Some(index);
                checkpoint.last_processed_trade_time = Some(trade.timestamp);
                checkpoint.processed_trade_count += 1;
            }

            checkpoint.balance = state.balance;
            if let Some(at) = checkpoint.last_processed_trade_time {
                checkpoint.progress = task.progress_at(at);
            }
            self.store.save_checkpoint(&task.id, &rows, &checkpoint).await?;
            debug!(
                task = %task.id,
                page,
                rows = rows.len(),
                processed = checkpoint.processed_trade_count,
                balance = %state.balance,
                "Page committed"
            );

            if halted || fetched.raw_count < page_size as usize {
                break;
            }
            page += 1;
        }

        let status = self.current_status(&task.id).await?;
        if status != TaskStatus::Running {
            info!(task = %task.id, status = %status, "Task no longer running, skipping final settlement");
            return Ok(status);
        }

        self.complete(&oracle, task, &mut state).await
    }

    async fn current_status(&self, task_id: &str) -> Result<TaskStatus> {
        Ok(self
            .store
            .task_status(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?)
    }

    /// Final settlement, optional mark-to-market, statistics and the COMPLETED write.
    async fn complete(&self, oracle: &CachedOracle, task: &BacktestTask, state: &mut ReplayState) -> Result<TaskStatus> {
        let now = Utc::now();
        let mut closing = Vec::new();

        self.settle_up_to(oracle, &task.id, state, now, &mut closing).await;
        if self.config.mark_to_market {
            self.mark_open_positions(oracle, &task.id, state, now, &mut closing).await;
        }

        let mut ledger = self.store.ledger_rows(&task.id).await?;
        ledger.extend(closing.iter().cloned());
        let statistics = StatisticsCalculator::calculate(task.initial_balance, &ledger);

        let profit_amount = state.balance - task.initial_balance;
        let profit_rate = (profit_amount / task.initial_balance * dec!(100)).round_dp(4);

        let outcome = TaskOutcome {
            final_balance: state.balance,
            profit_amount,
            profit_rate,
            statistics,
            finished_at: now,
        };
        if !self.store.finish_task(&task.id, &closing, &outcome).await? {
            let status = self.current_status(&task.id).await?;
            info!(task = %task.id, status = %status, "Task left RUNNING during final settlement, results discarded");
            return Ok(status);
        }

        info!(
            task = %task.id,
            final_balance = %outcome.final_balance,
            profit = %profit_amount,
            rate = %profit_rate,
            trades = outcome.statistics.total_trades,
            "Backtest completed"
        );
        Ok(TaskStatus::Completed)
    }

    /// Settle every open position whose market resolved at or before `until`.
    async fn settle_up_to(
        &self,
        oracle: &CachedOracle,
        task_id: &str,
        state: &mut ReplayState,
        until: DateTime<Utc>,
        rows: &mut Vec<BacktestTrade>,
    ) {
        let open: Vec<Position> = state.positions.values().cloned().collect();

        for position in open {
            let resolved_at = match oracle.market_resolution(&position.market_id).await {
                Ok(Some(at)) if at <= until => at,
                Ok(_) => continue,
                Err(e) => {
                    warn!(market = %position.market_id, error = %e, "Resolution lookup failed, keeping position");
                    continue;
                }
            };

            let Some(index) = outcome_index_of(oracle, &position).await else {
                warn!(market = %position.market_id, outcome = ?position.outcome, "Cannot resolve outcome index, keeping position");
                continue;
            };

            let payout = match oracle.settlement_payout(&position.market_id, index).await {
                Ok(Some(payout)) => payout,
                Ok(None) => {
                    debug!(market = %position.market_id, index, "Payout not known yet");
                    continue;
                }
                Err(e) => {
                    warn!(market = %position.market_id, error = %e, "Payout lookup failed, keeping position");
                    continue;
                }
            };

            let row = state.closing_row(task_id, &position, resolved_at, SettlementKind::Resolution, payout);
            debug!(
                market = %position.market_id,
                quantity = %row.quantity,
                payout = %payout,
                pnl = ?row.profit_loss,
                "Settled position"
            );
            state.record(row, rows);
        }
    }

    /// Value still-open positions at the oracle's current price.
    async fn mark_open_positions(
        &self,
        oracle: &CachedOracle,
        task_id: &str,
        state: &mut ReplayState,
        at: DateTime<Utc>,
        rows: &mut Vec<BacktestTrade>,
    ) {
        let open: Vec<Position> = state.positions.values().cloned().collect();

        for position in open {
            let price = match outcome_index_of(oracle, &position).await {
                Some(index) => match oracle.mark_price(&position.market_id, index).await {
                    Ok(price) => price,
                    Err(e) => {
                        warn!(market = %position.market_id, error = %e, "Mark price unavailable, using average cost");
                        position.avg_price
                    }
                },
                None => {
                    warn!(market = %position.market_id, "Outcome index unknown, marking at average cost");
                    position.avg_price
                }
            };

            let row = state.closing_row(task_id, &position, at, SettlementKind::Mark, price);
            state.record(row, rows);
        }
    }

    /// Admission checks, then the BUY or SELL follow for one leader trade.
    async fn follow(
        &self,
        oracle: &CachedOracle,
        task: &BacktestTask,
        sizer: &PositionSizer<'_>,
        state: &mut ReplayState,
        trade: &TradeData,
        rows: &mut Vec<BacktestTrade>,
    ) {
        if trade.side == TradeSide::Sell && !task.config.support_sell {
            debug!(trade = %trade.trade_id, "Sell following disabled");
            return;
        }

        let market = match oracle.market_snapshot(&trade.market_id).await {
            Ok(snapshot) => snapshot.map(|s| s.context_at(trade.timestamp)),
            Err(e) => {
                warn!(market = %trade.market_id, error = %e, "Market lookup failed, filtering without market context");
                None
            }
        };

        let follow_amount = match trade.side {
            TradeSide::Buy => Some(sizer.follow_amount(trade.usdc_amount)),
            TradeSide::Sell => None,
        };

        let result = {
            let token = TokenContext {
                token_id: &trade.token_id,
                market_id: &trade.market_id,
                outcome: trade.outcome.as_deref(),
                outcome_index: trade.outcome_index,
                title: Some(trade.market_title.as_str()),
            };
            let exposure = RunExposure {
                store: self.store.as_ref(),
                task_id: &task.id,
                pending: rows,
            };
            self.filter
                .check(
                    &task.config.filter,
                    &token,
                    trade.price,
                    follow_amount,
                    market.as_ref(),
                    Some(&exposure),
                    true,
                )
                .await
        };

        if !result.passed {
            debug!(
                trade = %trade.trade_id,
                category = result.category.map(|c| c.as_str()).unwrap_or(""),
                reason = %result.reason,
                "Trade filtered"
            );
            return;
        }

        match trade.side {
            TradeSide::Buy => Self::follow_buy(task, sizer, state, trade, rows),
            TradeSide::Sell => Self::follow_sell(task, sizer, state, trade, rows),
        }
    }

    fn follow_buy(
        task: &BacktestTask,
        sizer: &PositionSizer<'_>,
        state: &mut ReplayState,
        trade: &TradeData,
        rows: &mut Vec<BacktestTrade>,
    ) {
        let day = trade.timestamp.date_naive();

        if let Some(limit) = task.config.max_daily_orders {
            if state.daily_orders(day) >= limit {
                debug!(trade = %trade.trade_id, %day, limit, "Daily order limit reached");
                return;
            }
        }
        if let Some(limit) = task.config.max_daily_loss {
            let loss = state.daily_loss(day);
            if loss > limit {
                debug!(trade = %trade.trade_id, %day, loss = %loss, "Daily loss limit exceeded");
                return;
            }
        }

        let Some(amount) = sizer.buy_amount(trade.usdc_amount, state.balance) else {
            debug!(trade = %trade.trade_id, balance = %state.balance, "Buy below minimum order size");
            return;
        };
        let price = sizer.buy_price(trade.price);
        let quantity = sizer.buy_quantity(amount, price);
        if quantity <= Decimal::ZERO {
            return;
        }

        let row = BacktestTrade {
            task_id: task.id.clone(),
            seq: state.next_seq,
            trade_time: trade.timestamp,
            side: LedgerSide::Buy,
            settlement_kind: None,
            market_id: trade.market_id.clone(),
            market_title: trade.market_title.clone(),
            outcome: trade.outcome.clone(),
            outcome_index: trade.outcome_index,
            quantity,
            price,
            amount,
            fee: Decimal::ZERO,
            profit_loss: None,
            balance_after: state.balance - amount,
            leader_trade_id: Some(trade.trade_id.clone()),
            leader_quantity: Some(trade.size),
        };
        debug!(trade = %trade.trade_id, quantity = %quantity, price = %price, amount = %amount, "Followed buy");
        state.record(row, rows);
    }

    fn follow_sell(
        task: &BacktestTask,
        sizer: &PositionSizer<'_>,
        state: &mut ReplayState,
        trade: &TradeData,
        rows: &mut Vec<BacktestTrade>,
    ) {
        let Some(position) = state.positions.get(&trade.position_key()) else {
            debug!(trade = %trade.trade_id, "No position to sell");
            return;
        };

        let price = sizer.sell_price(trade.price);
        let Some(order) = sizer.sell_order(position, trade.size, price) else {
            debug!(trade = %trade.trade_id, "Sell below minimum order size");
            return;
        };

        let row = BacktestTrade {
            task_id: task.id.clone(),
            seq: state.next_seq,
            trade_time: trade.timestamp,
            side: LedgerSide::Sell,
            settlement_kind: None,
            market_id: position.market_id.clone(),
            market_title: position.market_title.clone(),
            outcome: position.outcome.clone(),
            outcome_index: position.outcome_index,
            quantity: order.quantity,
            price,
            amount: order.amount,
            fee: Decimal::ZERO,
            profit_loss: Some(order.amount - order.quantity * position.avg_price),
            balance_after: state.balance + order.amount,
            leader_trade_id: Some(trade.trade_id.clone()),
            leader_quantity: Some(trade.size),
        };
        debug!(trade = %trade.trade_id, quantity = %order.quantity, price = %price, pnl = ?row.profit_loss, "Followed sell");
        state.record(row, rows);
    }
}

async fn outcome_index_of(oracle: &CachedOracle, position: &Position) -> Option<i32> {
    if position.outcome_index.is_some() {
        return position.outcome_index;
    }
    match oracle
        .resolve_outcome_index(&position.market_id, position.outcome.as_deref(), None)
        .await
    {
        Ok(index) => index,
        Err(e) => {
            warn!(market = %position.market_id, error = %e, "Outcome index lookup failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ActivityQuery, ActivityResponse, OrderBook};
    use crate::db::Database;
    use crate::error::{BookError, SourceError};
    use crate::models::{MarketSnapshot, NewTask};
    use crate::trading::{CopyConfig, CopyMode, KeywordFilterMode};
    use chrono::Duration;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    /// Serves a fixed trade list by offset, with scripted failures and an optional stop request.
    struct MockSource {
        rows: Vec<ActivityResponse>,
        errors: Mutex<HashMap<u32, Vec<u16>>>,
        stop_at: Mutex<Option<(Arc<Database>, String, u32)>>,
    }

    impl MockSource {
        fn new(rows: Vec<ActivityResponse>) -> Arc<Self> {
            Arc::new(Self {
                rows,
                errors: Mutex::new(HashMap::new()),
                stop_at: Mutex::new(None),
            })
        }

        fn fail(&self, offset: u32, statuses: Vec<u16>) {
            self.errors.lock().unwrap().insert(offset, statuses);
        }

        fn clear_failures(&self) {
            self.errors.lock().unwrap().clear();
        }

        fn stop_when_fetching(&self, db: Arc<Database>, task_id: &str, offset: u32) {
            *self.stop_at.lock().unwrap() = Some((db, task_id.to_string(), offset));
        }
    }

    #[async_trait]
    impl ActivitySource for MockSource {
        async fn fetch_activity(&self, query: &ActivityQuery) -> Result<Vec<ActivityResponse>, SourceError> {
            let failure = {
                let mut errors = self.errors.lock().unwrap();
                errors
                    .get_mut(&query.offset)
                    .filter(|s| !s.is_empty())
                    .map(|s| if s.len() > 1 { s.remove(0) } else { s[0] })
            };
            if let Some(status) = failure {
                return Err(SourceError::Status { status, body: "scripted".to_string() });
            }

            let stop = {
                let mut stop_at = self.stop_at.lock().unwrap();
                match stop_at.as_ref() {
                    Some((_, _, offset)) if *offset == query.offset => stop_at.take(),
                    _ => None,
                }
            };
            if let Some((db, task_id, _)) = stop {
                db.transition_status(&task_id, TaskStatus::Running, TaskStatus::Stopped)
                    .await
                    .unwrap();
            }

            Ok(self
                .rows
                .iter()
                .skip(query.offset as usize)
                .take(query.limit as usize)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct MockOracle {
        resolutions: HashMap<String, DateTime<Utc>>,
        payouts: HashMap<(String, i32), Decimal>,
        marks: HashMap<(String, i32), Decimal>,
    }

    #[async_trait]
    impl MarketOracle for MockOracle {
        async fn market_snapshot(&self, _: &str) -> Result<Option<MarketSnapshot>> {
            Ok(None)
        }

        async fn market_resolution(&self, market_id: &str) -> Result<Option<DateTime<Utc>>> {
            Ok(self.resolutions.get(market_id).copied())
        }

        async fn settlement_payout(&self, market_id: &str, outcome_index: i32) -> Result<Option<Decimal>> {
            Ok(self.payouts.get(&(market_id.to_string(), outcome_index)).copied())
        }

        async fn mark_price(&self, market_id: &str, outcome_index: i32) -> Result<Decimal> {
            self.marks
                .get(&(market_id.to_string(), outcome_index))
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no price"))
        }

        async fn resolve_outcome_index(&self, _: &str, _: Option<&str>, index: Option<i32>) -> Result<Option<i32>> {
            Ok(index)
        }
    }

    struct NoBooks;

    #[async_trait]
    impl OrderBookSource for NoBooks {
        async fn order_book(&self, token_id: &str) -> Result<OrderBook, BookError> {
            Err(BookError::NotFound(token_id.to_string()))
        }
    }

    fn hours_ago(h: i64) -> DateTime<Utc> {
        Utc::now() - Duration::hours(h)
    }

    fn leader_trade(hash: &str, market: &str, side: &str, size: Decimal, price: Decimal, at: DateTime<Utc>) -> ActivityResponse {
        ActivityResponse {
            activity_type: "TRADE".to_string(),
            condition_id: market.to_string(),
            asset: format!("{}-yes", market),
            size: Some(size),
            usdc_size: Some(size * price),
            price: Some(price),
            timestamp: at.timestamp(),
            transaction_hash: hash.to_string(),
            side: Some(side.to_string()),
            outcome: Some("Yes".to_string()),
            outcome_index: Some(0),
            title: format!("Market {}", market),
            ..Default::default()
        }
    }

    fn engine_config(page_size: u32, mark_to_market: bool) -> EngineConfig {
        let mut config = EngineConfig {
            page_size,
            mark_to_market,
            ..Default::default()
        };
        config.fetcher.retry_delay = StdDuration::ZERO;
        config
    }

    async fn setup(
        rows: Vec<ActivityResponse>,
        oracle: MockOracle,
        config: EngineConfig,
        copy: CopyConfig,
    ) -> (BacktestEngine, Arc<Database>, Arc<MockSource>, String) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let source = MockSource::new(rows);
        let task = BacktestTask::new(
            NewTask {
                name: None,
                leader_address: "0xleader".to_string(),
                initial_balance: dec!(1000),
                backtest_days: 3,
                config: copy,
            },
            Utc::now(),
        );
        db.insert_task(&task).await.unwrap();

        let engine = BacktestEngine::new(db.clone(), source.clone(), Arc::new(oracle), Arc::new(NoBooks), config);
        (engine, db, source, task.id)
    }

    #[test]
    fn test_start_page() {
        assert_eq!(start_page(None, 100), 0);
        assert_eq!(start_page(Some(42), 100), 0);
        // Last index of a page moves on to the next page
        assert_eq!(start_page(Some(99), 100), 1);
        assert_eq!(start_page(Some(100), 100), 1);
    }

    #[tokio::test]
    async fn test_follows_leader_buy() {
        let rows = vec![leader_trade("0xa", "0xm", "BUY", dec!(100), dec!(0.50), hours_ago(10))];
        let (engine, db, _, id) = setup(rows, MockOracle::default(), engine_config(100, false), CopyConfig::default()).await;

        assert_eq!(engine.run(&id).await.unwrap(), TaskStatus::Completed);

        let ledger = db.ledger_rows(&id).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].side, LedgerSide::Buy);
        assert_eq!(ledger[0].price, dec!(0.50));
        assert_eq!(ledger[0].amount, dec!(50));
        assert_eq!(ledger[0].quantity, dec!(100));
        assert_eq!(ledger[0].balance_after, dec!(950));

        let task = db.load_task(&id).await.unwrap().unwrap();
        assert_eq!(task.final_balance, Some(dec!(950)));
        assert_eq!(task.progress, 100);
        assert_eq!(task.processed_trade_count, 1);
    }

    #[tokio::test]
    async fn test_follows_leader_full_exit() {
        let bought_at = hours_ago(10);
        let rows = vec![
            leader_trade("0xa", "0xm", "BUY", dec!(100), dec!(0.50), bought_at),
            leader_trade("0xb", "0xm", "SELL", dec!(100), dec!(0.60), bought_at + Duration::hours(5)),
        ];
        let (engine, db, _, id) = setup(rows, MockOracle::default(), engine_config(100, true), CopyConfig::default()).await;

        engine.run(&id).await.unwrap();

        let ledger = db.ledger_rows(&id).await.unwrap();
        assert_eq!(ledger.len(), 2);
        let sell = &ledger[1];
        assert_eq!(sell.side, LedgerSide::Sell);
        assert_eq!(sell.quantity, dec!(100));
        assert_eq!(sell.price, dec!(0.60));
        assert_eq!(sell.profit_loss, Some(dec!(10)));
        assert_eq!(sell.balance_after, dec!(1010));

        let task = db.load_task(&id).await.unwrap().unwrap();
        assert_eq!(task.profit_amount, Some(dec!(10)));
        assert_eq!(task.profit_rate, Some(dec!(1)));
        let stats = task.statistics.unwrap();
        assert_eq!(stats.win_trades, 1);
        assert_eq!(stats.avg_holding_time_ms, Some(5 * 3_600_000));
    }

    #[tokio::test]
    async fn test_resolved_market_is_settled() {
        let rows = vec![
            leader_trade("0xa", "0xm", "BUY", dec!(50), dec!(0.40), hours_ago(10)),
            leader_trade("0xb", "0xother", "BUY", dec!(10), dec!(0.50), hours_ago(2)),
        ];
        let resolved_at = hours_ago(4);
        let oracle = MockOracle {
            resolutions: HashMap::from([("0xm".to_string(), resolved_at)]),
            payouts: HashMap::from([(("0xm".to_string(), 0), dec!(1))]),
            marks: HashMap::from([(("0xother".to_string(), 0), dec!(0.50))]),
        };
        let (engine, db, _, id) = setup(rows, oracle, engine_config(100, true), CopyConfig::default()).await;

        engine.run(&id).await.unwrap();

        let ledger = db.ledger_rows(&id).await.unwrap();
        let sides: Vec<_> = ledger.iter().map(|r| (r.side, r.settlement_kind)).collect();
        assert_eq!(
            sides,
            vec![
                (LedgerSide::Buy, None),
                // Settled before the next leader trade because the market resolved first
                (LedgerSide::Settlement, Some(SettlementKind::Resolution)),
                (LedgerSide::Buy, None),
                (LedgerSide::Settlement, Some(SettlementKind::Mark)),
            ]
        );

        let settlement = &ledger[1];
        assert_eq!(settlement.price, dec!(1));
        assert_eq!(settlement.amount, dec!(50));
        assert_eq!(settlement.profit_loss, Some(dec!(30)));
        assert_eq!(settlement.trade_time.timestamp(), resolved_at.timestamp());

        let mark = &ledger[3];
        assert_eq!(mark.amount, dec!(5));
        assert_eq!(mark.profit_loss, Some(dec!(0)));

        let task = db.load_task(&id).await.unwrap().unwrap();
        assert_eq!(task.final_balance, Some(dec!(1030)));
    }

    #[tokio::test]
    async fn test_mark_falls_back_to_average_cost() {
        let rows = vec![leader_trade("0xa", "0xm", "BUY", dec!(100), dec!(0.30), hours_ago(10))];
        let (engine, db, _, id) = setup(rows, MockOracle::default(), engine_config(100, true), CopyConfig::default()).await;

        engine.run(&id).await.unwrap();

        let ledger = db.ledger_rows(&id).await.unwrap();
        assert_eq!(ledger[1].settlement_kind, Some(SettlementKind::Mark));
        assert_eq!(ledger[1].price, dec!(0.30));
        assert_eq!(db.load_task(&id).await.unwrap().unwrap().final_balance, Some(dec!(1000)));
    }

    #[tokio::test]
    async fn test_bad_request_on_later_page_completes() {
        let rows = vec![
            leader_trade("0xa", "0xm", "BUY", dec!(10), dec!(0.50), hours_ago(10)),
            leader_trade("0xb", "0xm", "BUY", dec!(10), dec!(0.50), hours_ago(9)),
        ];
        let (engine, db, source, id) = setup(rows, MockOracle::default(), engine_config(2, false), CopyConfig::default()).await;
        source.fail(2, vec![400]);

        assert_eq!(engine.run(&id).await.unwrap(), TaskStatus::Completed);

        let task = db.load_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(db.ledger_rows(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_server_errors_fail_and_retry_resumes() {
        let rows = vec![
            leader_trade("0xa", "0xm", "BUY", dec!(10), dec!(0.50), hours_ago(10)),
            leader_trade("0xb", "0xm", "BUY", dec!(10), dec!(0.50), hours_ago(9)),
            leader_trade("0xc", "0xm", "SELL", dec!(20), dec!(0.60), hours_ago(8)),
        ];
        let (engine, db, source, id) = setup(rows, MockOracle::default(), engine_config(2, false), CopyConfig::default()).await;
        source.fail(2, vec![500]);

        assert!(engine.run(&id).await.is_err());

        let failed = db.load_task(&id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error_message.as_deref().unwrap_or("").contains("5 attempts"));
        assert_eq!(failed.last_processed_trade_index, Some(1));
        assert_eq!(failed.processed_trade_count, 2);
        assert_eq!(failed.current_balance(), dec!(990));

        source.clear_failures();
        assert!(db.reset_for_retry(&id).await.unwrap());
        assert_eq!(engine.run(&id).await.unwrap(), TaskStatus::Completed);

        let ledger = db.ledger_rows(&id).await.unwrap();
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger[2].side, LedgerSide::Sell);
        assert_eq!(ledger[2].quantity, dec!(20));
        assert_eq!(ledger[2].profit_loss, Some(dec!(2)));
        assert_eq!(ledger[2].balance_after, dec!(1002));
    }

    #[tokio::test]
    async fn test_balance_conservation() {
        let rows = vec![
            leader_trade("0xa", "0xm", "BUY", dec!(300), dec!(0.35), hours_ago(30)),
            leader_trade("0xb", "0xn", "BUY", dec!(120), dec!(0.70), hours_ago(28)),
            leader_trade("0xc", "0xm", "SELL", dec!(100), dec!(0.45), hours_ago(20)),
            leader_trade("0xd", "0xn", "BUY", dec!(90), dec!(0.65), hours_ago(12)),
            leader_trade("0xe", "0xm", "SELL", dec!(50), dec!(0.25), hours_ago(6)),
        ];
        let oracle = MockOracle {
            resolutions: HashMap::from([("0xn".to_string(), hours_ago(3))]),
            payouts: HashMap::from([(("0xn".to_string(), 0), dec!(0))]),
            marks: HashMap::from([(("0xm".to_string(), 0), dec!(0.31))]),
        };
        let copy = CopyConfig {
            copy_ratio: dec!(0.7),
            slippage_percent: dec!(1.5),
            ..Default::default()
        };
        let (engine, db, _, id) = setup(rows, oracle, engine_config(2, true), copy).await;

        engine.run(&id).await.unwrap();

        let task = db.load_task(&id).await.unwrap().unwrap();
        let ledger = db.ledger_rows(&id).await.unwrap();
        let flows: Decimal = ledger.iter().map(|r| r.cash_flow()).sum();
        let final_balance = task.final_balance.unwrap();

        assert_eq!(final_balance, task.initial_balance + flows);
        assert_eq!(final_balance, task.initial_balance + task.profit_amount.unwrap());
        assert_eq!(ledger.last().unwrap().balance_after, final_balance);

        // Open quantity never goes negative
        let mut open: HashMap<String, Decimal> = HashMap::new();
        for row in &ledger {
            let key = position_key(&row.market_id, row.outcome.as_deref(), row.outcome_index);
            let qty = open.entry(key).or_insert(Decimal::ZERO);
            match row.side {
                LedgerSide::Buy => *qty += row.quantity,
                LedgerSide::Sell | LedgerSide::Settlement => *qty -= row.quantity,
            }
            assert!(*qty >= Decimal::ZERO);
        }
    }

    #[tokio::test]
    async fn test_slippage_direction() {
        let rows = vec![
            leader_trade("0xa", "0xm", "BUY", dec!(100), dec!(0.50), hours_ago(10)),
            leader_trade("0xb", "0xm", "SELL", dec!(100), dec!(0.60), hours_ago(5)),
        ];
        let copy = CopyConfig {
            slippage_percent: dec!(2),
            ..Default::default()
        };
        let (engine, db, _, id) = setup(rows, MockOracle::default(), engine_config(100, false), copy).await;

        engine.run(&id).await.unwrap();

        let ledger = db.ledger_rows(&id).await.unwrap();
        assert_eq!(ledger[0].price, dec!(0.51));
        assert!(ledger[0].price > dec!(0.50));
        assert_eq!(ledger[1].price, dec!(0.588));
        assert!(ledger[1].price < dec!(0.60));
    }

    #[tokio::test]
    async fn test_daily_order_limit() {
        let noon = (Utc::now() - Duration::days(1))
            .date_naive()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        let rows = vec![
            leader_trade("0xa", "0xm", "BUY", dec!(10), dec!(0.50), noon),
            leader_trade("0xb", "0xm", "BUY", dec!(10), dec!(0.50), noon + Duration::minutes(1)),
        ];
        let copy = CopyConfig {
            max_daily_orders: Some(1),
            ..Default::default()
        };
        let (engine, db, _, id) = setup(rows, MockOracle::default(), engine_config(100, false), copy).await;

        engine.run(&id).await.unwrap();

        assert_eq!(db.ledger_rows(&id).await.unwrap().len(), 1);
        // Both trades were walked through, one was gated
        assert_eq!(db.load_task(&id).await.unwrap().unwrap().processed_trade_count, 2);
    }

    #[tokio::test]
    async fn test_filtered_trades_leave_no_rows() {
        let rows = vec![leader_trade("0xa", "0xm", "BUY", dec!(100), dec!(0.50), hours_ago(10))];
        let mut copy = CopyConfig::default();
        copy.filter.keyword_mode = KeywordFilterMode::Blacklist;
        copy.filter.keywords = vec!["market 0xm".to_string()];
        let (engine, db, _, id) = setup(rows, MockOracle::default(), engine_config(100, true), copy).await;

        engine.run(&id).await.unwrap();

        assert!(db.ledger_rows(&id).await.unwrap().is_empty());
        let task = db.load_task(&id).await.unwrap().unwrap();
        assert_eq!(task.final_balance, Some(dec!(1000)));
        assert_eq!(task.processed_trade_count, 1);
    }

    #[tokio::test]
    async fn test_position_cap_counts_rows_of_current_page() {
        let rows = vec![
            leader_trade("0xa", "0xm", "BUY", dec!(100), dec!(0.50), hours_ago(10)),
            leader_trade("0xb", "0xm", "BUY", dec!(100), dec!(0.50), hours_ago(9)),
        ];
        let mut copy = CopyConfig {
            copy_mode: CopyMode::Fixed,
            fixed_amount: Some(dec!(40)),
            ..Default::default()
        };
        copy.filter.max_position_value = Some(dec!(60));
        let (engine, db, _, id) = setup(rows, MockOracle::default(), engine_config(100, false), copy).await;

        engine.run(&id).await.unwrap();

        let ledger = db.ledger_rows(&id).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].amount, dec!(40));
    }

    #[tokio::test]
    async fn test_stop_then_retry_matches_uninterrupted_run() {
        let rows = vec![
            leader_trade("0xa", "0xm", "BUY", dec!(200), dec!(0.40), hours_ago(30)),
            leader_trade("0xb", "0xn", "BUY", dec!(80), dec!(0.55), hours_ago(26)),
            leader_trade("0xc", "0xm", "SELL", dec!(50), dec!(0.50), hours_ago(20)),
            leader_trade("0xd", "0xm", "BUY", dec!(40), dec!(0.45), hours_ago(15)),
            leader_trade("0xe", "0xm", "SELL", dec!(190), dec!(0.42), hours_ago(4)),
        ];
        let resolved_at = hours_ago(18);
        let oracle = || MockOracle {
            resolutions: HashMap::from([("0xn".to_string(), resolved_at)]),
            payouts: HashMap::from([(("0xn".to_string(), 0), dec!(1))]),
            marks: HashMap::new(),
        };

        let (engine, db, _, id) = setup(rows.clone(), oracle(), engine_config(2, false), CopyConfig::default()).await;
        engine.run(&id).await.unwrap();
        let expected = db.ledger_rows(&id).await.unwrap();

        let (engine, db, source, id) = setup(rows, oracle(), engine_config(2, false), CopyConfig::default()).await;
        source.stop_when_fetching(db.clone(), &id, 2);

        assert_eq!(engine.run(&id).await.unwrap(), TaskStatus::Stopped);
        let stopped = db.load_task(&id).await.unwrap().unwrap();
        assert_eq!(stopped.status, TaskStatus::Stopped);
        assert_eq!(stopped.last_processed_trade_index, Some(3));
        assert!(stopped.statistics.is_none());

        assert!(db.reset_for_retry(&id).await.unwrap());
        assert_eq!(engine.run(&id).await.unwrap(), TaskStatus::Completed);

        let resumed: Vec<_> = db
            .ledger_rows(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| BacktestTrade { task_id: expected[0].task_id.clone(), ..r })
            .collect();
        assert_eq!(resumed, expected);
    }

    #[tokio::test]
    async fn test_stop_during_last_page_is_kept() {
        let rows = vec![leader_trade("0xa", "0xm", "BUY", dec!(100), dec!(0.50), hours_ago(10))];
        let (engine, db, source, id) = setup(rows, MockOracle::default(), engine_config(100, true), CopyConfig::default()).await;
        source.stop_when_fetching(db.clone(), &id, 0);

        assert_eq!(engine.run(&id).await.unwrap(), TaskStatus::Stopped);

        let task = db.load_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);
        assert!(task.statistics.is_none());
        assert_eq!(task.last_processed_trade_index, Some(0));
        // The page was committed but no mark-to-market row was written
        let ledger = db.ledger_rows(&id).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].side, LedgerSide::Buy);

        assert!(db.reset_for_retry(&id).await.unwrap());
        assert_eq!(engine.run(&id).await.unwrap(), TaskStatus::Completed);
        let ledger = db.ledger_rows(&id).await.unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[1].settlement_kind, Some(SettlementKind::Mark));
    }

    #[tokio::test]
    async fn test_concurrent_runs_of_one_task() {
        let rows = vec![leader_trade("0xa", "0xm", "BUY", dec!(100), dec!(0.50), hours_ago(10))];
        let (engine, db, _, id) = setup(rows, MockOracle::default(), engine_config(100, false), CopyConfig::default()).await;

        let (a, b) = tokio::join!(engine.run(&id), engine.run(&id));

        let (won, lost) = match (a, b) {
            (Ok(status), Err(e)) | (Err(e), Ok(status)) => (status, e),
            (a, b) => panic!("expected exactly one run to win, got {:?} and {:?}", a, b),
        };
        assert_eq!(won, TaskStatus::Completed);
        assert!(matches!(
            lost.downcast_ref::<TaskError>(),
            Some(TaskError::InvalidState { action: "run", .. })
        ));

        let task = db.load_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error_message.is_none());
        assert_eq!(db.ledger_rows(&id).await.unwrap().len(), 1);
        assert!(engine.active_runs().await.is_empty());
    }

    fn yesterday_noon() -> DateTime<Utc> {
        (Utc::now() - Duration::days(1))
            .date_naive()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
    }

    fn losing_day(noon: DateTime<Utc>) -> Vec<ActivityResponse> {
        vec![
            leader_trade("0xa", "0xm", "BUY", dec!(100), dec!(0.50), noon),
            leader_trade("0xb", "0xm", "SELL", dec!(100), dec!(0.30), noon + Duration::minutes(1)),
            leader_trade("0xc", "0xn", "BUY", dec!(10), dec!(0.50), noon + Duration::minutes(2)),
        ]
    }

    #[tokio::test]
    async fn test_daily_loss_limit_blocks_buys() {
        let copy = CopyConfig {
            max_daily_loss: Some(dec!(10)),
            ..Default::default()
        };
        let (engine, db, _, id) = setup(losing_day(yesterday_noon()), MockOracle::default(), engine_config(100, false), copy).await;

        engine.run(&id).await.unwrap();

        let ledger = db.ledger_rows(&id).await.unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[1].profit_loss, Some(dec!(-20)));

        let task = db.load_task(&id).await.unwrap().unwrap();
        assert_eq!(task.processed_trade_count, 3);
        assert_eq!(task.final_balance, Some(dec!(980)));
    }

    #[tokio::test]
    async fn test_resumed_run_restores_daily_loss() {
        let copy = CopyConfig {
            max_daily_loss: Some(dec!(10)),
            ..Default::default()
        };
        let (engine, db, source, id) = setup(losing_day(yesterday_noon()), MockOracle::default(), engine_config(2, false), copy).await;
        source.fail(2, vec![500]);

        assert!(engine.run(&id).await.is_err());
        assert_eq!(db.load_task(&id).await.unwrap().unwrap().last_processed_trade_index, Some(1));
        assert!(engine.active_runs().await.is_empty());

        source.clear_failures();
        assert!(db.reset_for_retry(&id).await.unwrap());
        assert_eq!(engine.run(&id).await.unwrap(), TaskStatus::Completed);

        // The loss from before the failure still gates the BUY on the next page
        assert_eq!(db.ledger_rows(&id).await.unwrap().len(), 2);
        assert_eq!(db.load_task(&id).await.unwrap().unwrap().processed_trade_count, 3);
    }

    #[tokio::test]
    async fn test_exhausted_balance_ends_replay() {
        let rows = vec![
            leader_trade("0xa", "0xm", "BUY", dec!(10), dec!(0.50), hours_ago(10)),
            leader_trade("0xb", "0xn", "BUY", dec!(10), dec!(0.50), hours_ago(5)),
            leader_trade("0xc", "0xn", "BUY", dec!(10), dec!(0.50), hours_ago(4)),
        ];
        let oracle = MockOracle {
            resolutions: HashMap::from([("0xm".to_string(), hours_ago(8))]),
            payouts: HashMap::from([(("0xm".to_string(), 0), dec!(0))]),
            marks: HashMap::new(),
        };
        let copy = CopyConfig {
            copy_mode: CopyMode::Fixed,
            fixed_amount: Some(dec!(999.5)),
            ..Default::default()
        };
        let (engine, db, _, id) = setup(rows, oracle, engine_config(100, true), copy).await;

        assert_eq!(engine.run(&id).await.unwrap(), TaskStatus::Completed);

        let ledger = db.ledger_rows(&id).await.unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].amount, dec!(999.5));
        assert_eq!(ledger[1].settlement_kind, Some(SettlementKind::Resolution));
        assert_eq!(ledger[1].profit_loss, Some(dec!(-999.5)));

        let task = db.load_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.final_balance, Some(dec!(0.5)));
        // Halted before following the second trade
        assert_eq!(task.processed_trade_count, 1);
    }
}
