//! Polymarket copy-trading backtester.
//!
//! Replays a leader wallet's historical trades against a simulated follower
//! account with configurable sizing, slippage and admission filters.

mod api;
mod backtest;
mod db;
mod error;
mod metrics;
mod models;
mod trading;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{ClobClient, DataClient, GammaClient, CLOB_URL, DATA_API_BASE, GAMMA_URL};
use crate::backtest::{BacktestEngine, BacktestService, EngineConfig};
use crate::db::Database;
use crate::models::{NewTask, TaskStatus};
use crate::trading::{
    CopyConfig, CopyMode, ExposureLookup, FilterConfig, FilterPipeline, KeywordFilterMode, PositionSizer,
    TokenContext, DEFAULT_MIN_TICK,
};

/// Polymarket copy-trading backtester CLI.
#[derive(Parser)]
#[command(name = "polybacktest")]
#[command(about = "Backtest copy-trading a Polymarket wallet", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "BACKTEST_DATABASE_URL", default_value = "sqlite:./polybacktest.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Data API base URL
    #[arg(long, env = "POLYMARKET_DATA_API_URL", default_value = DATA_API_BASE)]
    data_api_url: String,

    /// Gamma API base URL
    #[arg(long, env = "POLYMARKET_GAMMA_URL", default_value = GAMMA_URL)]
    gamma_url: String,

    /// CLOB API base URL
    #[arg(long, env = "POLYMARKET_CLOB_URL", default_value = CLOB_URL)]
    clob_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a backtest task
    Create {
        /// Leader's wallet address
        leader: String,

        /// Starting follower balance in USDC
        #[arg(short, long, default_value = "1000")]
        balance: Decimal,

        /// Days of history to replay (1-15)
        #[arg(long, default_value = "7")]
        days: i64,

        /// Optional task name
        #[arg(short, long)]
        name: Option<String>,

        /// Run the task right away
        #[arg(long)]
        run: bool,

        #[command(flatten)]
        copy: CopyArgs,
    },

    /// Run a PENDING task (Ctrl+C stops it at the next page)
    Run {
        /// Task id
        id: String,
    },

    /// Run every PENDING task
    RunPending,

    /// Stop a RUNNING task
    Stop {
        /// Task id
        id: String,
    },

    /// Queue a STOPPED or FAILED task to resume from its checkpoint
    Retry {
        /// Task id
        id: String,
    },

    /// Delete a task and its ledger
    Delete {
        /// Task id
        id: String,
    },

    /// Show a task and its results
    Show {
        /// Task id
        id: String,
    },

    /// List tasks
    List {
        /// Only tasks with this status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show a task's simulated trades
    Trades {
        /// Task id
        id: String,

        /// Page number, starting at 0
        #[arg(short, long, default_value = "0")]
        page: i64,

        /// Rows per page
        #[arg(short, long, default_value = "20")]
        size: i64,
    },

    /// Run the admission filters against a live market
    Check {
        /// Outcome token id
        token_id: String,

        /// Market condition id
        market_id: String,

        /// Leader's trade price
        #[arg(long)]
        price: Decimal,

        /// Outcome label
        #[arg(long)]
        outcome: Option<String>,

        /// Outcome index
        #[arg(long)]
        outcome_index: Option<i32>,

        /// Leader's trade amount in USDC, used for the position cap
        #[arg(long)]
        amount: Option<Decimal>,

        /// Wallet whose current positions count towards the position cap
        #[arg(long)]
        wallet: Option<String>,

        #[command(flatten)]
        copy: CopyArgs,
    },
}

/// Copy sizing, risk and filter options.
#[derive(Args, Clone)]
struct CopyArgs {
    /// Copy mode (ratio, fixed)
    #[arg(long, default_value = "ratio")]
    mode: String,

    /// Multiplier on the leader's amount in ratio mode
    #[arg(long, default_value = "1")]
    ratio: Decimal,

    /// USDC per buy in fixed mode
    #[arg(long)]
    fixed_amount: Option<Decimal>,

    /// Minimum order size in USDC
    #[arg(long, default_value = "1")]
    min_order: Decimal,

    /// Maximum order size in USDC
    #[arg(long, default_value = "1000")]
    max_order: Decimal,

    /// Stop buying for the day once realized losses exceed this
    #[arg(long)]
    max_daily_loss: Option<Decimal>,

    /// Maximum buys per day
    #[arg(long)]
    max_daily_orders: Option<u32>,

    /// Simulated slippage percentage (0-100)
    #[arg(long, default_value = "0")]
    slippage: Decimal,

    /// Ignore the leader's sells
    #[arg(long)]
    no_sell: bool,

    /// Keyword filter mode (disabled, whitelist, blacklist)
    #[arg(long, default_value = "disabled")]
    keyword_mode: String,

    /// Comma-separated title keywords
    #[arg(long, value_delimiter = ',')]
    keywords: Vec<String>,

    /// Lowest leader price to follow
    #[arg(long)]
    min_price: Option<Decimal>,

    /// Highest leader price to follow
    #[arg(long)]
    max_price: Option<Decimal>,

    /// Widest acceptable bid/ask spread
    #[arg(long)]
    max_spread: Option<Decimal>,

    /// Minimum order book notional
    #[arg(long)]
    min_depth: Option<Decimal>,

    /// Cap on exposure to one market outcome in USDC
    #[arg(long)]
    max_position: Option<Decimal>,

    /// Skip markets ending further out than this many hours
    #[arg(long)]
    max_end_hours: Option<i64>,
}

impl CopyArgs {
    fn into_config(self) -> Result<CopyConfig> {
        let copy_mode = CopyMode::parse(&self.mode).ok_or_else(|| anyhow!("Unknown copy mode: {}", self.mode))?;
        let keyword_mode = KeywordFilterMode::parse(&self.keyword_mode)
            .ok_or_else(|| anyhow!("Unknown keyword mode: {}", self.keyword_mode))?;

        Ok(CopyConfig {
            copy_mode,
            copy_ratio: self.ratio,
            fixed_amount: self.fixed_amount,
            min_order_size: self.min_order,
            max_order_size: self.max_order,
            max_daily_loss: self.max_daily_loss,
            max_daily_orders: self.max_daily_orders,
            slippage_percent: self.slippage,
            support_sell: !self.no_sell,
            filter: FilterConfig {
                keyword_mode,
                keywords: self.keywords,
                min_price: self.min_price,
                max_price: self.max_price,
                max_spread: self.max_spread,
                min_order_depth: self.min_depth,
                max_position_value: self.max_position,
                max_market_end_hours: self.max_end_hours,
            },
        })
    }
}

/// Live exposure: nothing tracked locally, the wallet's reported position value if given.
struct WalletExposure<'a> {
    data: &'a DataClient,
    wallet: Option<&'a str>,
}

#[async_trait]
impl ExposureLookup for WalletExposure<'_> {
    async fn tracked_exposure(&self, _: &str, _: Option<&str>, _: Option<i32>) -> Result<Decimal> {
        Ok(Decimal::ZERO)
    }

    async fn reported_value(
        &self,
        market_id: &str,
        outcome: Option<&str>,
        outcome_index: Option<i32>,
    ) -> Result<Option<Decimal>> {
        let Some(wallet) = self.wallet else {
            return Ok(None);
        };

        let positions = self.data.get_positions(wallet).await?;
        let value = positions
            .iter()
            .filter(|p| p.condition_id == market_id)
            .filter(|p| match outcome {
                Some(label) => p.outcome.eq_ignore_ascii_case(label),
                None => outcome_index == Some(p.outcome_index),
            })
            .map(|p| p.current_value)
            .sum();
        Ok(Some(value))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize database and service
    let db = Arc::new(Database::new(&cli.database).await?);
    let engine = BacktestEngine::new(
        db.clone(),
        Arc::new(DataClient::with_base_url(cli.data_api_url.clone())?),
        Arc::new(GammaClient::with_base_url(cli.gamma_url.clone())?),
        Arc::new(ClobClient::with_base_url(cli.clob_url.clone())?),
        EngineConfig::from_env()?,
    );
    let service = BacktestService::new(db, engine);

    match cli.command {
        Commands::Create {
            leader,
            balance,
            days,
            name,
            run,
            copy,
        } => {
            let task = service
                .create(NewTask {
                    name,
                    leader_address: leader,
                    initial_balance: balance,
                    backtest_days: days,
                    config: copy.into_config()?,
                })
                .await?;

            println!("Created task {}", task.id);

            if run {
                let status = run_until_done(&service, &task.id).await?;
                println!("{}", service.get(&task.id).await?);
                println!("Task ended {}", status);
            } else {
                println!("Use 'polybacktest run {}' to start it.", task.id);
            }
        }

        Commands::Run { id } => {
            let status = run_until_done(&service, &id).await?;
            println!("{}", service.get(&id).await?);
            println!("Task ended {}", status);
        }

        Commands::RunPending => {
            let ids = service.pending_ids().await?;
            let runs = service.run_all(&ids);
            tokio::pin!(runs);

            let results = tokio::select! {
                results = &mut runs => results,
                _ = tokio::signal::ctrl_c() => {
                    println!("\nStopping running tasks at their next page...");
                    for id in service.active_runs().await {
                        if let Err(e) = service.stop(&id).await {
                            warn!(task = %id, error = %e, "Could not stop task");
                        }
                    }
                    runs.await
                }
            };

            if results.is_empty() {
                println!("No pending tasks.");
            }
            for (id, result) in results {
                match result {
                    Ok(status) => println!("{:<36} {}", id, status),
                    Err(e) => println!("{:<36} FAILED: {:#}", id, e),
                }
            }
        }

        Commands::Stop { id } => {
            service.stop(&id).await?;
            println!("Stop requested for {}", id);
        }

        Commands::Retry { id } => {
            service.retry(&id).await?;
            println!("Task {} is PENDING again and will resume from its checkpoint.", id);
        }

        Commands::Delete { id } => {
            service.delete(&id).await?;
            println!("Deleted task {}", id);
        }

        Commands::Show { id } => {
            println!("{}", service.get(&id).await?);
        }

        Commands::List { status } => {
            let status = status
                .map(|s| TaskStatus::parse(&s).ok_or_else(|| anyhow!("Unknown status: {}", s)))
                .transpose()?;
            let tasks = service.list(status).await?;

            if tasks.is_empty() {
                println!("No tasks. Use 'polybacktest create <leader>' to add one.");
                return Ok(());
            }

            println!(
                "\n{:<36} {:<10} {:<44} {:>5} {:>12} {:>9}",
                "ID", "STATUS", "LEADER", "PROG", "BALANCE", "PROFIT%"
            );
            println!("{}", "-".repeat(121));

            for task in tasks {
                let rate = task
                    .profit_rate
                    .map(|r| format!("{:.2}%", r))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<36} {:<10} {:<44} {:>4}% {:>12.2} {:>9}",
                    task.id,
                    task.status.as_str(),
                    truncate(&task.leader_address, 44),
                    task.progress,
                    task.current_balance(),
                    rate
                );
            }
        }

        Commands::Trades { id, page, size } => {
            let (rows, total) = service.trades(&id, page, size).await?;

            println!(
                "\n{:>5} {:<17} {:<10} {:<30} {:<8} {:>14} {:>8} {:>10} {:>10} {:>12}",
                "SEQ", "TIME", "SIDE", "MARKET", "OUTCOME", "QTY", "PRICE", "AMOUNT", "P&L", "BALANCE"
            );
            println!("{}", "-".repeat(132));

            for row in &rows {
                let side = match row.settlement_kind {
                    Some(kind) => kind.as_str(),
                    None => row.side.as_str(),
                };
                let title = if row.market_title.is_empty() { &row.market_id } else { &row.market_title };
                println!(
                    "{:>5} {:<17} {:<10} {:<30} {:<8} {:>14.4} {:>8.4} {:>10.2} {:>10} {:>12.2}",
                    row.seq,
                    row.trade_time.format("%Y-%m-%d %H:%M"),
                    side,
                    truncate(title, 30),
                    truncate(row.outcome.as_deref().unwrap_or("-"), 8),
                    row.quantity,
                    row.price,
                    row.amount,
                    row.profit_loss.map(|p| format!("{:.2}", p)).unwrap_or_default(),
                    row.balance_after
                );
            }

            let size = size.max(1);
            let pages = (total + size - 1) / size;
            println!("\nPage {} of {} ({} rows)", page.max(0) + 1, pages.max(1), total);
        }

        Commands::Check {
            token_id,
            market_id,
            price,
            outcome,
            outcome_index,
            amount,
            wallet,
            copy,
        } => {
            let config = copy.into_config()?;
            let data = DataClient::with_base_url(cli.data_api_url)?;
            let gamma = GammaClient::with_base_url(cli.gamma_url)?;
            let clob = ClobClient::with_base_url(cli.clob_url)?;

            let market = gamma.get_market(&market_id).await?;
            let context = market.as_ref().map(|m| m.live_context(Utc::now()));
            if market.is_none() {
                warn!(market = %market_id, "Market not found on Gamma, skipping market status checks");
            }

            let follow_amount = amount.map(|a| PositionSizer::new(&config, DEFAULT_MIN_TICK).follow_amount(a));
            let token = TokenContext {
                token_id: &token_id,
                market_id: &market_id,
                outcome: outcome.as_deref(),
                outcome_index,
                title: None,
            };
            let exposure = WalletExposure {
                data: &data,
                wallet: wallet.as_deref(),
            };

            let pipeline = FilterPipeline::new(Arc::new(clob));
            let result = pipeline
                .check(&config.filter, &token, price, follow_amount, context.as_ref(), Some(&exposure), false)
                .await;

            println!("\n{:=^60}", " FILTER CHECK ");
            if let Some(m) = &market {
                println!("Market:   {}", m.title);
            }
            println!("Token:    {}", token_id);
            println!("Price:    {}", price);
            if let Some(amount) = follow_amount {
                println!("Follow:   ${:.2}", amount);
            }
            if let Some(book) = &result.order_book {
                println!(
                    "Book:     bid {} / ask {} (depth ${:.2})",
                    book.best_bid().map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    book.best_ask().map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    book.depth()
                );
            }
            if result.passed {
                println!("Result:   PASS");
            } else {
                println!(
                    "Result:   REJECT [{}] {}",
                    result.category.map(|c| c.as_str()).unwrap_or(""),
                    result.reason
                );
            }
            println!("{:=^60}", "");
        }
    }

    Ok(())
}

/// Run a task; Ctrl+C asks it to stop and waits for the current page to commit.
async fn run_until_done(service: &BacktestService, id: &str) -> Result<TaskStatus> {
    info!(task = %id, "Running backtest, press Ctrl+C to stop");

    let run = service.run(id);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\nStopping at the next page...");
            if let Err(e) = service.stop(id).await {
                warn!(task = %id, error = %e, "Could not stop task");
            }
            run.await
        }
    }
}

/// Truncate a string to max length with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
