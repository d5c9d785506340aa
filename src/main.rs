// Racing warehouse sync v0.1
use chrono::{Duration, Local, NaiveDate};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use racing_warehouse::config::AppConfig;
use racing_warehouse::db::queries::Repository;
use racing_warehouse::errors::AppError;
use racing_warehouse::services::checkpoint::CheckpointStore;
use racing_warehouse::services::controller::{Controller, MANUAL_TABLES};
use racing_warehouse::services::limiter::ApiRateLimiter;
use racing_warehouse::services::racing_api::{RacingApi, RacingApiClient};
use racing_warehouse::services::schedule::SCHEDULE;

/// Maximum number of connections in the database pool. Writes are bounded
/// to this many concurrent transactions.
const DB_POOL_MAX_CONNECTIONS: u32 = 4;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 1;
/// Page-walk cap applied by `--test`.
const TEST_PAGE_CAP: usize = 5;
/// Default lookback for manual runs when no window is given.
const MANUAL_DEFAULT_DAYS_BACK: i64 = 3;

/// Mirrors a third-party horse-racing REST API into a PostgreSQL warehouse
/// and maintains derived statistics tables.
#[derive(Debug, Parser)]
#[command(name = "racing-warehouse", version)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Smoke run: shrink processed windows to 7 days and page walks to 5 pages.
    #[arg(long, global = true)]
    test: bool,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Historical backfill over month-sized, checkpointed chunks.
    Backfill {
        /// First date to cover (YYYY-MM-DD).
        #[arg(long)]
        start_date: NaiveDate,
        /// Last date to cover; defaults to today.
        #[arg(long)]
        end_date: Option<NaiveDate>,
    },
    /// Due master fetchers plus races and results for the last 3 days.
    Daily,
    /// Run a single named fetcher.
    Manual {
        /// Target table; see `list` for accepted names.
        #[arg(long)]
        table: String,
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// Defaults to today.
        #[arg(long)]
        end_date: Option<NaiveDate>,
        /// Window size counted back from the end date, when no start date
        /// is given.
        #[arg(long)]
        days_back: Option<i64>,
    },
    /// Consult the schedule table and run exactly what is due now.
    Scheduled,
    /// List the tables accepted by manual mode.
    List,
    /// Print the schedule table.
    ShowSchedule,
    /// Verify configuration, API reachability and warehouse freshness.
    Check,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "racing_warehouse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32, AppError> {
    // Informational modes need neither credentials nor a database.
    match &cli.mode {
        Mode::List => {
            for table in MANUAL_TABLES {
                println!("{table}");
            }
            return Ok(0);
        }
        Mode::ShowSchedule => {
            for entry in SCHEDULE {
                println!("{:<28} {}", entry.cadence, entry.targets);
            }
            return Ok(0);
        }
        _ => {}
    }

    let config = AppConfig::from_env()?;

    // Set up database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(&config.database_url)
        .await?;

    // One shared rate limiter governs every outbound API call.
    let limiter = Arc::new(ApiRateLimiter::new());
    let mut client = RacingApiClient::new(
        &config.api_base_url,
        &config.api_username,
        &config.api_password,
        limiter,
    )?;
    if cli.test {
        client = client.with_page_cap(TEST_PAGE_CAP);
    }
    let api: Arc<dyn RacingApi> = Arc::new(client);

    let controller = Controller::new(
        api,
        Repository::new(pool),
        CheckpointStore::new(&config.checkpoint_dir),
        config.regions.clone(),
        &config.log_dir,
    )
    .with_test_mode(cli.test);

    let report = match cli.mode {
        Mode::Backfill {
            start_date,
            end_date,
        } => controller.backfill(start_date, end_date).await?,
        Mode::Daily => controller.daily().await?,
        Mode::Manual {
            table,
            start_date,
            end_date,
            days_back,
        } => {
            let (date_from, date_to) = resolve_manual_window(start_date, end_date, days_back)?;
            controller.manual(&table, date_from, date_to).await?
        }
        Mode::Scheduled => controller.scheduled().await?,
        Mode::Check => controller.check().await?,
        Mode::List | Mode::ShowSchedule => unreachable!("handled above"),
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string())
    );
    Ok(report.exit_code())
}

/// Resolve the manual-mode window: an explicit start date wins, otherwise
/// count `--days-back` (default 3) back from the end date.
fn resolve_manual_window(
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    days_back: Option<i64>,
) -> Result<(NaiveDate, NaiveDate), AppError> {
    let date_to = end_date.unwrap_or_else(|| Local::now().date_naive());
    let date_from = match start_date {
        Some(start) => start,
        None => date_to - Duration::days(days_back.unwrap_or(MANUAL_DEFAULT_DAYS_BACK)),
    };
    if date_from > date_to {
        return Err(AppError::Config(format!(
            "start date {date_from} is after end date {date_to}"
        )));
    }
    Ok((date_from, date_to))
}
