//! Durable task store: task configuration, resume checkpoint and the ledger.
//!
//! Decimals are stored as TEXT so balances round-trip exactly. Each page of
//! ledger rows is written in the same transaction as the checkpoint that covers it.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction};

use crate::models::{
    net_cost_basis, BacktestTask, BacktestTrade, Checkpoint, LedgerSide, SettlementKind,
    TaskOutcome, TaskStatus,
};

/// Persistence operations the engine and service depend on.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &BacktestTask) -> Result<()>;

    async fn load_task(&self, id: &str) -> Result<Option<BacktestTask>>;

    /// Tasks, newest first, optionally filtered by status.
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<BacktestTask>>;

    async fn task_status(&self, id: &str) -> Result<Option<TaskStatus>>;

    /// Move `id` from `from` to `to`; false when the task was not in `from`.
    async fn transition_status(&self, id: &str, from: TaskStatus, to: TaskStatus) -> Result<bool>;

    /// PENDING to RUNNING; false when the task was not PENDING. `started_at` is only set by the first run.
    async fn mark_running(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Append a page of ledger rows and move the checkpoint in one transaction.
    async fn save_checkpoint(&self, id: &str, rows: &[BacktestTrade], checkpoint: &Checkpoint) -> Result<()>;

    /// Append the closing rows and write the results as COMPLETED in one transaction.
    ///
    /// Writes nothing and returns false when the task is no longer RUNNING.
    async fn finish_task(&self, id: &str, rows: &[BacktestTrade], outcome: &TaskOutcome) -> Result<bool>;

    async fn mark_failed(&self, id: &str, message: &str, at: DateTime<Utc>) -> Result<()>;

    /// STOPPED or FAILED back to PENDING, keeping the checkpoint.
    async fn reset_for_retry(&self, id: &str) -> Result<bool>;

    async fn delete_task(&self, id: &str) -> Result<()>;

    /// Full ledger in write order.
    async fn ledger_rows(&self, id: &str) -> Result<Vec<BacktestTrade>>;

    /// One page of the ledger plus the total row count.
    async fn ledger_page(&self, id: &str, offset: i64, limit: i64) -> Result<(Vec<BacktestTrade>, i64)>;

    /// Net cost basis the task holds in one market outcome.
    async fn sum_exposure(
        &self,
        id: &str,
        market_id: &str,
        outcome: Option<&str>,
        outcome_index: Option<i32>,
    ) -> Result<Decimal>;
}

/// SQLite-backed task store.
pub struct Database {
    pool: SqlitePool,
}

/// Stored task record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredTask {
    id: String,
    name: Option<String>,
    leader_address: String,
    initial_balance: String,
    final_balance: Option<String>,
    backtest_days: i64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    status: String,
    progress: i64,
    config: String,
    last_processed_trade_index: Option<i64>,
    last_processed_trade_time: Option<DateTime<Utc>>,
    processed_trade_count: i64,
    profit_amount: Option<String>,
    profit_rate: Option<String>,
    statistics: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Stored ledger row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredTrade {
    task_id: String,
    seq: i64,
    trade_time: DateTime<Utc>,
    side: String,
    settlement_kind: Option<String>,
    market_id: String,
    market_title: String,
    outcome: Option<String>,
    outcome_index: Option<i64>,
    quantity: String,
    price: String,
    amount: String,
    fee: String,
    profit_loss: Option<String>,
    balance_after: String,
    leader_trade_id: Option<String>,
    leader_quantity: Option<String>,
}

fn decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Invalid decimal in database: {}", s))
}

fn opt_decimal(s: Option<&str>) -> Result<Option<Decimal>> {
    s.map(decimal).transpose()
}

impl TryFrom<StoredTask> for BacktestTask {
    type Error = anyhow::Error;

    fn try_from(t: StoredTask) -> Result<Self> {
        Ok(BacktestTask {
            status: TaskStatus::parse(&t.status)
                .ok_or_else(|| anyhow!("Unknown task status {}", t.status))?,
            initial_balance: decimal(&t.initial_balance)?,
            final_balance: opt_decimal(t.final_balance.as_deref())?,
            config: serde_json::from_str(&t.config).context("Invalid task config")?,
            profit_amount: opt_decimal(t.profit_amount.as_deref())?,
            profit_rate: opt_decimal(t.profit_rate.as_deref())?,
            statistics: t
                .statistics
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Invalid task statistics")?,
            progress: t.progress.clamp(0, 100) as i32,
            id: t.id,
            name: t.name,
            leader_address: t.leader_address,
            backtest_days: t.backtest_days,
            start_time: t.start_time,
            end_time: t.end_time,
            last_processed_trade_index: t.last_processed_trade_index,
            last_processed_trade_time: t.last_processed_trade_time,
            processed_trade_count: t.processed_trade_count,
            error_message: t.error_message,
            created_at: t.created_at,
            started_at: t.started_at,
            finished_at: t.finished_at,
        })
    }
}

impl TryFrom<StoredTrade> for BacktestTrade {
    type Error = anyhow::Error;

    fn try_from(r: StoredTrade) -> Result<Self> {
        Ok(BacktestTrade {
            side: LedgerSide::parse(&r.side).ok_or_else(|| anyhow!("Unknown ledger side {}", r.side))?,
            settlement_kind: match r.settlement_kind.as_deref() {
                Some(kind) => Some(
                    SettlementKind::parse(kind).ok_or_else(|| anyhow!("Unknown settlement kind {}", kind))?,
                ),
                None => None,
            },
            outcome_index: r.outcome_index.map(i32::try_from).transpose()?,
            quantity: decimal(&r.quantity)?,
            price: decimal(&r.price)?,
            amount: decimal(&r.amount)?,
            fee: decimal(&r.fee)?,
            profit_loss: opt_decimal(r.profit_loss.as_deref())?,
            balance_after: decimal(&r.balance_after)?,
            leader_quantity: opt_decimal(r.leader_quantity.as_deref())?,
            task_id: r.task_id,
            seq: r.seq,
            trade_time: r.trade_time,
            market_id: r.market_id,
            market_title: r.market_title,
            outcome: r.outcome,
            leader_trade_id: r.leader_trade_id,
        })
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection keeps every query on the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backtest_tasks (
                id TEXT PRIMARY KEY,
                name TEXT,
                leader_address TEXT NOT NULL,
                initial_balance TEXT NOT NULL,
                final_balance TEXT,
                backtest_days INTEGER NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                progress INTEGER NOT NULL DEFAULT 0,
                config TEXT NOT NULL,
                last_processed_trade_index INTEGER,
                last_processed_trade_time TEXT,
                processed_trade_count INTEGER NOT NULL DEFAULT 0,
                profit_amount TEXT,
                profit_rate TEXT,
                statistics TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backtest_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                trade_time TEXT NOT NULL,
                side TEXT NOT NULL,
                settlement_kind TEXT,
                market_id TEXT NOT NULL,
                market_title TEXT NOT NULL DEFAULT '',
                outcome TEXT,
                outcome_index INTEGER,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                amount TEXT NOT NULL,
                fee TEXT NOT NULL DEFAULT '0',
                profit_loss TEXT,
                balance_after TEXT NOT NULL,
                leader_trade_id TEXT,
                leader_quantity TEXT,
                UNIQUE(task_id, seq),
                FOREIGN KEY (task_id) REFERENCES backtest_tasks(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_backtest_tasks_status ON backtest_tasks(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_backtest_trades_market ON backtest_trades(task_id, market_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_rows(tx: &mut Transaction<'_, Sqlite>, rows: &[BacktestTrade]) -> Result<()> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO backtest_trades (
                    task_id, seq, trade_time, side, settlement_kind, market_id, market_title,
                    outcome, outcome_index, quantity, price, amount, fee, profit_loss,
                    balance_after, leader_trade_id, leader_quantity
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.task_id)
            .bind(row.seq)
            .bind(row.trade_time)
            .bind(row.side.as_str())
            .bind(row.settlement_kind.map(|k| k.as_str()))
            .bind(&row.market_id)
            .bind(&row.market_title)
            .bind(&row.outcome)
            .bind(row.outcome_index)
            .bind(row.quantity.to_string())
            .bind(row.price.to_string())
            .bind(row.amount.to_string())
            .bind(row.fee.to_string())
            .bind(row.profit_loss.map(|d| d.to_string()))
            .bind(row.balance_after.to_string())
            .bind(&row.leader_trade_id)
            .bind(row.leader_quantity.map(|d| d.to_string()))
            .execute(&mut **tx)
            .await
            .with_context(|| format!("Failed to insert ledger row {} of task {}", row.seq, row.task_id))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for Database {
    async fn insert_task(&self, task: &BacktestTask) -> Result<()> {
        let config = serde_json::to_string(&task.config)?;

        sqlx::query(
            r#"
            INSERT INTO backtest_tasks (
                id, name, leader_address, initial_balance, backtest_days, start_time, end_time,
                status, progress, config, processed_trade_count, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.leader_address)
        .bind(task.initial_balance.to_string())
        .bind(task.backtest_days)
        .bind(task.start_time)
        .bind(task.end_time)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(config)
        .bind(task.processed_trade_count)
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert task")?;

        Ok(())
    }

    async fn load_task(&self, id: &str) -> Result<Option<BacktestTask>> {
        let stored = sqlx::query_as::<_, StoredTask>("SELECT * FROM backtest_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load task")?;

        stored.map(BacktestTask::try_from).transpose()
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<BacktestTask>> {
        let stored = match status {
            Some(status) => {
                sqlx::query_as::<_, StoredTask>(
                    "SELECT * FROM backtest_tasks WHERE status = ? ORDER BY created_at DESC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, StoredTask>("SELECT * FROM backtest_tasks ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("Failed to list tasks")?;

        stored.into_iter().map(BacktestTask::try_from).collect()
    }

    async fn task_status(&self, id: &str) -> Result<Option<TaskStatus>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM backtest_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(s,)| TaskStatus::parse(&s).ok_or_else(|| anyhow!("Unknown task status {}", s)))
            .transpose()
    }

    async fn transition_status(&self, id: &str, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE backtest_tasks SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_running(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE backtest_tasks SET
                status = 'RUNNING',
                error_message = NULL,
                started_at = COALESCE(started_at, ?)
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn save_checkpoint(&self, id: &str, rows: &[BacktestTrade], checkpoint: &Checkpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        Self::insert_rows(&mut tx, rows).await?;

        sqlx::query(
            r#"
            UPDATE backtest_tasks SET
                last_processed_trade_index = ?,
                last_processed_trade_time = ?,
                processed_trade_count = ?,
                final_balance = ?,
                progress = ?
            WHERE id = ?
            "#,
        )
        .bind(checkpoint.last_processed_trade_index)
        .bind(checkpoint.last_processed_trade_time)
        .bind(checkpoint.processed_trade_count)
        .bind(checkpoint.balance.to_string())
        .bind(checkpoint.progress)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("Failed to save checkpoint")?;

        tx.commit().await?;
        Ok(())
    }

    async fn finish_task(&self, id: &str, rows: &[BacktestTrade], outcome: &TaskOutcome) -> Result<bool> {
        let statistics = serde_json::to_string(&outcome.statistics)?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE backtest_tasks SET
                status = 'COMPLETED',
                progress = 100,
                final_balance = ?,
                profit_amount = ?,
                profit_rate = ?,
                statistics = ?,
                error_message = NULL,
                finished_at = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(outcome.final_balance.to_string())
        .bind(outcome.profit_amount.to_string())
        .bind(outcome.profit_rate.to_string())
        .bind(statistics)
        .bind(outcome.finished_at)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("Failed to finish task")?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::insert_rows(&mut tx, rows).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_failed(&self, id: &str, message: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE backtest_tasks SET status = 'FAILED', error_message = ?, finished_at = ? WHERE id = ?",
        )
        .bind(message)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_for_retry(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE backtest_tasks SET status = 'PENDING', error_message = NULL, finished_at = NULL
            WHERE id = ? AND status IN ('STOPPED', 'FAILED')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM backtest_trades WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM backtest_tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn ledger_rows(&self, id: &str) -> Result<Vec<BacktestTrade>> {
        let stored = sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM backtest_trades WHERE task_id = ? ORDER BY seq",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch ledger")?;

        stored.into_iter().map(BacktestTrade::try_from).collect()
    }

    async fn ledger_page(&self, id: &str, offset: i64, limit: i64) -> Result<(Vec<BacktestTrade>, i64)> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backtest_trades WHERE task_id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        let stored = sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM backtest_trades WHERE task_id = ? ORDER BY seq LIMIT ? OFFSET ?",
        )
        .bind(id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch ledger page")?;

        let rows = stored
            .into_iter()
            .map(BacktestTrade::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((rows, total))
    }

    async fn sum_exposure(
        &self,
        id: &str,
        market_id: &str,
        outcome: Option<&str>,
        outcome_index: Option<i32>,
    ) -> Result<Decimal> {
        let stored = sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM backtest_trades WHERE task_id = ? AND market_id = ? ORDER BY seq",
        )
        .bind(id)
        .bind(market_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch exposure rows")?;

        let rows = stored
            .into_iter()
            .map(BacktestTrade::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(net_cost_basis(&rows, market_id, outcome, outcome_index))
    }
}
