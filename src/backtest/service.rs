//! Task lifecycle operations: create, run, stop, retry, delete and queries.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use crate::db::TaskStore;
use crate::error::TaskError;
use crate::models::{BacktestTask, BacktestTrade, NewTask, TaskStatus};
use crate::trading::CopyMode;

use super::engine::BacktestEngine;

/// Longest replay window in days.
pub const MAX_BACKTEST_DAYS: i64 = 15;

/// Reject task parameters that cannot produce a meaningful run.
pub fn validate(params: &NewTask) -> Result<(), TaskError> {
    let invalid = |msg: String| -> Result<(), TaskError> { Err(TaskError::Validation(msg)) };
    let config = &params.config;

    if params.leader_address.trim().is_empty() {
        return invalid("leader address is required".to_string());
    }
    if !(1..=MAX_BACKTEST_DAYS).contains(&params.backtest_days) {
        return invalid(format!(
            "backtest days must be between 1 and {}, got {}",
            MAX_BACKTEST_DAYS, params.backtest_days
        ));
    }
    if params.initial_balance <= Decimal::ZERO {
        return invalid(format!("initial balance must be positive, got {}", params.initial_balance));
    }
    if config.slippage_percent < Decimal::ZERO || config.slippage_percent >= dec!(100) {
        return invalid(format!("slippage must be in [0, 100), got {}", config.slippage_percent));
    }
    match config.copy_mode {
        CopyMode::Ratio if config.copy_ratio <= Decimal::ZERO => {
            return invalid(format!("copy ratio must be positive, got {}", config.copy_ratio));
        }
        CopyMode::Fixed if !config.fixed_amount.is_some_and(|a| a > Decimal::ZERO) => {
            return invalid("fixed mode needs a positive fixed amount".to_string());
        }
        _ => {}
    }
    if config.min_order_size > config.max_order_size {
        return invalid(format!(
            "min order size {} exceeds max order size {}",
            config.min_order_size, config.max_order_size
        ));
    }
    if let (Some(min), Some(max)) = (config.filter.min_price, config.filter.max_price) {
        if min > max {
            return invalid(format!("min price {} exceeds max price {}", min, max));
        }
    }

    Ok(())
}

/// Entry point for callers managing backtest tasks.
pub struct BacktestService {
    store: Arc<dyn TaskStore>,
    engine: BacktestEngine,
}

impl BacktestService {
    pub fn new(store: Arc<dyn TaskStore>, engine: BacktestEngine) -> Self {
        Self { store, engine }
    }

    /// Validate and persist a new PENDING task.
    pub async fn create(&self, params: NewTask) -> Result<BacktestTask> {
        validate(&params)?;

        let task = BacktestTask::new(params, Utc::now());
        self.store.insert_task(&task).await?;

        info!(task = %task.id, leader = %task.leader_address, days = task.backtest_days, "Created backtest task");
        Ok(task)
    }

    /// Run a PENDING task to its end state.
    pub async fn run(&self, id: &str) -> Result<TaskStatus> {
        let status = self.status_of(id).await?;
        if status != TaskStatus::Pending {
            return Err(invalid_state(id, status, "run").into());
        }
        self.engine.run(id).await
    }

    /// Ids of the tasks currently PENDING, newest first.
    pub async fn pending_ids(&self) -> Result<Vec<String>> {
        let pending = self.store.list_tasks(Some(TaskStatus::Pending)).await?;
        Ok(pending.into_iter().map(|task| task.id).collect())
    }

    /// Run the given tasks concurrently. A task another run already took fails with `InvalidState`.
    pub async fn run_all(&self, ids: &[String]) -> Vec<(String, Result<TaskStatus>)> {
        info!(count = ids.len(), "Running pending tasks");

        let runs = ids.iter().map(|id| async move {
            let result = self.engine.run(id).await;
            (id.clone(), result)
        });

        join_all(runs).await
    }

    /// Tasks this service's engine is running right now.
    pub async fn active_runs(&self) -> Vec<String> {
        self.engine.active_runs().await
    }

    /// Ask a RUNNING task to stop; the run ends at its next page boundary.
    pub async fn stop(&self, id: &str) -> Result<()> {
        if !self
            .store
            .transition_status(id, TaskStatus::Running, TaskStatus::Stopped)
            .await?
        {
            let status = self.status_of(id).await?;
            return Err(invalid_state(id, status, "stop").into());
        }
        info!(task = %id, "Stop requested");
        Ok(())
    }

    /// Put a STOPPED or FAILED task back to PENDING, keeping its checkpoint.
    pub async fn retry(&self, id: &str) -> Result<()> {
        let status = self.status_of(id).await?;
        if !matches!(status, TaskStatus::Stopped | TaskStatus::Failed) {
            return Err(invalid_state(id, status, "retry").into());
        }
        if !self.store.reset_for_retry(id).await? {
            let status = self.status_of(id).await?;
            return Err(invalid_state(id, status, "retry").into());
        }
        info!(task = %id, from = %status, "Task queued for retry");
        Ok(())
    }

    /// Delete a task and its ledger.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let status = self.status_of(id).await?;
        if status == TaskStatus::Running {
            return Err(invalid_state(id, status, "delete").into());
        }
        self.store.delete_task(id).await?;
        warn!(task = %id, "Deleted backtest task");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<BacktestTask> {
        Ok(self
            .store
            .load_task(id)
            .await?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?)
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<BacktestTask>> {
        self.store.list_tasks(status).await
    }

    /// One page of a task's ledger (pages start at 0) and the total row count.
    pub async fn trades(&self, id: &str, page: i64, page_size: i64) -> Result<(Vec<BacktestTrade>, i64)> {
        self.status_of(id).await?;
        let page_size = page_size.max(1);
        self.store.ledger_page(id, page.max(0) * page_size, page_size).await
    }

    async fn status_of(&self, id: &str) -> Result<TaskStatus> {
        Ok(self
            .store
            .task_status(id)
            .await?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?)
    }
}

fn invalid_state(id: &str, status: TaskStatus, action: &'static str) -> TaskError {
    TaskError::InvalidState {
        id: id.to_string(),
        status: status.to_string(),
        action,
    }
}
