//! Backtest task: configuration, resume checkpoint and results.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::trading::CopyConfig;

use super::BacktestStatistics;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Stopped => "STOPPED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(TaskStatus::Pending),
            "RUNNING" => Some(TaskStatus::Running),
            "COMPLETED" => Some(TaskStatus::Completed),
            "STOPPED" => Some(TaskStatus::Stopped),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: Option<String>,
    pub leader_address: String,
    pub initial_balance: Decimal,
    pub backtest_days: i64,
    pub config: CopyConfig,
}

/// Resume marker persisted together with each page of ledger rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub last_processed_trade_index: Option<i64>,
    pub last_processed_trade_time: Option<DateTime<Utc>>,
    pub processed_trade_count: i64,
    /// Running balance at the checkpoint
    pub balance: Decimal,
    pub progress: i32,
}

/// Final figures written when a run completes.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub final_balance: Decimal,
    pub profit_amount: Decimal,
    pub profit_rate: Decimal,
    pub statistics: BacktestStatistics,
    pub finished_at: DateTime<Utc>,
}

/// A backtest of one leader over a fixed time window.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestTask {
    pub id: String,

    pub name: Option<String>,

    /// Leader's proxy wallet address
    pub leader_address: String,

    pub initial_balance: Decimal,

    /// Running balance while RUNNING, final valuation once COMPLETED
    pub final_balance: Option<Decimal>,

    pub backtest_days: i64,

    /// Replayed window, `end_time - backtest_days`
    pub start_time: DateTime<Utc>,

    /// Task creation instant
    pub end_time: DateTime<Utc>,

    pub status: TaskStatus,

    /// 0 to 100
    pub progress: i32,

    pub config: CopyConfig,

    // === Checkpoint ===
    pub last_processed_trade_index: Option<i64>,
    pub last_processed_trade_time: Option<DateTime<Utc>>,
    pub processed_trade_count: i64,

    // === Results ===
    pub profit_amount: Option<Decimal>,
    pub profit_rate: Option<Decimal>,
    pub statistics: Option<BacktestStatistics>,

    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BacktestTask {
    /// Create a PENDING task whose window ends now.
    pub fn new(params: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: params.name,
            leader_address: params.leader_address,
            initial_balance: params.initial_balance,
            final_balance: None,
            backtest_days: params.backtest_days,
            start_time: now - Duration::days(params.backtest_days),
            end_time: now,
            status: TaskStatus::Pending,
            progress: 0,
            config: params.config,
            last_processed_trade_index: None,
            last_processed_trade_time: None,
            processed_trade_count: 0,
            profit_amount: None,
            profit_rate: None,
            statistics: None,
            error_message: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Balance to resume from: the checkpoint balance if a run already started.
    pub fn current_balance(&self) -> Decimal {
        self.final_balance.unwrap_or(self.initial_balance)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            last_processed_trade_index: self.last_processed_trade_index,
            last_processed_trade_time: self.last_processed_trade_time,
            processed_trade_count: self.processed_trade_count,
            balance: self.current_balance(),
            progress: self.progress,
        }
    }

    /// Share of the window covered up to `at`, in percent.
    pub fn progress_at(&self, at: DateTime<Utc>) -> i32 {
        let total = (self.end_time - self.start_time).num_milliseconds();
        if total <= 0 {
            return 100;
        }
        let done = (at - self.start_time).num_milliseconds().clamp(0, total);
        ((done * 100) / total) as i32
    }
}

impl std::fmt::Display for BacktestTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " BACKTEST TASK ")?;
        writeln!(f, "Task:             {}", self.id)?;
        if let Some(name) = &self.name {
            writeln!(f, "Name:             {}", name)?;
        }
        writeln!(f, "Leader:           {}", self.leader_address)?;
        writeln!(f, "Window:           {} -> {}",
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"))?;
        writeln!(f, "Status:           {} ({}%)", self.status, self.progress)?;
        writeln!(f, "Copy Mode:        {}", self.config.copy_mode.as_str())?;
        writeln!(f, "Processed Trades: {}", self.processed_trade_count)?;
        writeln!(f)?;
        writeln!(f, "Initial Balance:  ${:.2}", self.initial_balance)?;
        writeln!(f, "Balance:          ${:.2}", self.current_balance())?;
        if let (Some(profit), Some(rate)) = (self.profit_amount, self.profit_rate) {
            writeln!(f, "Profit:           ${:.2} ({:.2}%)", profit, rate)?;
        }
        if let Some(stats) = &self.statistics {
            writeln!(f)?;
            writeln!(f, "Total Trades:     {} ({} buys, {} sells)",
                stats.total_trades, stats.buy_trades, stats.sell_trades)?;
            writeln!(f, "Win Rate:         {:.1}% ({} W / {} L)",
                stats.win_rate, stats.win_trades, stats.loss_trades)?;
            writeln!(f, "Max Profit:       ${:.2}", stats.max_profit)?;
            writeln!(f, "Max Loss:         ${:.2}", stats.max_loss)?;
            writeln!(f, "Max Drawdown:     ${:.2}", stats.max_drawdown)?;
            if let Some(ms) = stats.avg_holding_time_ms {
                writeln!(f, "Avg Holding:      {:.1}h", ms as f64 / 3_600_000.0)?;
            }
        }
        if let Some(error) = &self.error_message {
            writeln!(f)?;
            writeln!(f, "Error:            {}", error)?;
        }
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}
