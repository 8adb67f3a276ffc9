use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use coin_pipeline::alert::{AlertContext, AlertSink, LogAlertSink};
use coin_pipeline::config::{ClientConfig, PipelineConfig};
use coin_pipeline::data::model::{EnrichedRecord, Interval};
use coin_pipeline::data::processing::summary_statistics;
use coin_pipeline::data::MarketDataClient;
use coin_pipeline::error::{ConfigError, PipelineError, SnapshotError, StorageError};
use coin_pipeline::pipeline::{CycleOutcome, Pipeline};
use coin_pipeline::snapshot::SnapshotManager;
use coin_pipeline::storage::MarketStore;
use dotenv::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "coin-pipeline")]
#[command(about = "Collects, enriches and stores cryptocurrency market data")]
struct Cli {
    /// Database file (overrides PIPELINE_DB_PATH)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch the current top assets and store them enriched
    Collect {
        #[arg(long, default_value_t = 10)]
        limit: u32,

        #[arg(long, default_value = "usd")]
        currency: String,

        /// Snapshot the database after a successful run
        #[arg(long)]
        snapshot: bool,

        /// Print the stored records
        #[arg(long)]
        verbose: bool,
    },
    /// Rebuild historical candles for the top assets
    Backfill {
        #[arg(long, default_value_t = 10)]
        limit: u32,

        #[arg(long, default_value_t = 30)]
        days: u32,

        #[arg(long, value_enum, default_value_t = IntervalArg::Daily)]
        interval: IntervalArg,

        #[arg(long)]
        snapshot: bool,
    },
    /// Print database statistics and the largest assets
    Stats {
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
    /// Copy the database into the backup directory
    Snapshot,
    /// Delete data older than the retention window
    Prune {
        #[arg(long, default_value_t = 90)]
        days_to_keep: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum IntervalArg {
    Hourly,
    Daily,
}

impl From<IntervalArg> for Interval {
    fn from(arg: IntervalArg) -> Self {
        match arg {
            IntervalArg::Hourly => Interval::Hourly,
            IntervalArg::Daily => Interval::Daily,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "coin_pipeline={},coin_pipeline::data={}",
                cli.log_level, cli.log_level
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "run failed");
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }

    match cli.command {
        Command::Collect {
            limit,
            currency,
            snapshot,
            verbose,
        } => {
            let (pipeline, store, alerts) = build_pipeline(&config)?;
            let outcome = pipeline.run_snapshot_cycle(limit, &currency).await;
            let outcome = report_cycle_failure(outcome, alerts.as_ref())?;
            if let CycleOutcome::Persisted(report) = outcome {
                info!(records = report.records_written, "collection stored");
                if verbose {
                    let stored = store.latest_cycle()?;
                    print_records("Stored records", &stored);
                    print_summary(&stored);
                }
                print_statistics(&store, 5)?;
                if snapshot {
                    snapshot_store(&config, &store)?;
                }
            }
        }
        Command::Backfill {
            limit,
            days,
            interval,
            snapshot,
        } => {
            let (pipeline, store, alerts) = build_pipeline(&config)?;
            let outcome = pipeline.run_backfill_cycle(limit, days, interval.into()).await;
            if let CycleOutcome::Persisted(report) = report_cycle_failure(outcome, alerts.as_ref())? {
                println!("Backfill stored {} candles", report.candles_written);
                if snapshot {
                    snapshot_store(&config, &store)?;
                }
            }
        }
        Command::Stats { top } => {
            let store = MarketStore::open(&config.db_path)?;
            print_statistics(&store, top)?;
        }
        Command::Snapshot => {
            let store = MarketStore::open(&config.db_path)?;
            snapshot_store(&config, &store)?;
        }
        Command::Prune { days_to_keep } => {
            let store = MarketStore::open(&config.db_path)?;
            let deleted = store.delete_older_than(days_to_keep)?;
            println!("Deleted {deleted} rows older than {days_to_keep} days");
        }
    }

    Ok(())
}

fn build_pipeline(
    config: &PipelineConfig,
) -> Result<(Pipeline, Arc<MarketStore>, Arc<LogAlertSink>)> {
    let client = MarketDataClient::new(ClientConfig::from_env()?);
    let store = Arc::new(
        MarketStore::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );
    let alerts = Arc::new(LogAlertSink::new(
        &config.alert_log_path,
        config.alert_recipient.clone(),
    ));
    let pipeline = Pipeline::from_config(client, config, store.clone(), alerts.clone());
    Ok((pipeline, store, alerts))
}

/// Alerts on cycle errors the pipeline did not already report, and turns an
/// empty cycle into a warning.
fn report_cycle_failure(
    outcome: Result<CycleOutcome, PipelineError>,
    alerts: &dyn AlertSink,
) -> Result<CycleOutcome> {
    match outcome {
        Ok(CycleOutcome::Empty { mode }) => {
            warn!(%mode, "nothing collected");
            Ok(CycleOutcome::Empty { mode })
        }
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            if !matches!(err, PipelineError::Validation(_)) {
                alerts.notify_failure(
                    "ingestion cycle failed",
                    &AlertContext::new()
                        .with("stage", err.stage())
                        .with("error", &err),
                );
            }
            Err(err.into())
        }
    }
}

fn snapshot_store(config: &PipelineConfig, store: &MarketStore) -> Result<()> {
    let manager = SnapshotManager::new(store.path(), &config.backup_dir, config.max_backups);
    let path = manager.snapshot_store(store)?;
    println!("Snapshot written to {}", path.display());
    Ok(())
}

fn print_statistics(store: &MarketStore, top: usize) -> Result<()> {
    let stats = store.statistics()?;
    println!("\nDatabase statistics:");
    println!("Snapshot rows: {}", stats.snapshot_rows);
    println!("Candle rows: {}", stats.candle_rows);
    println!("Distinct assets: {}", stats.distinct_assets);
    println!(
        "First observation: {}",
        stats.first_observed_at.as_deref().unwrap_or("-")
    );
    println!(
        "Last observation: {}",
        stats.last_observed_at.as_deref().unwrap_or("-")
    );

    print_records("Top by market cap", &store.top_by_market_cap(top)?);
    Ok(())
}

fn print_records(title: &str, records: &[EnrichedRecord]) {
    println!("\n{title}:");
    for record in records {
        let s = &record.snapshot;
        println!(
            "{:>4}. {:<8} ${:>14.4} | cap ${:>18.0} | vol/cap {} | from ATH {}",
            s.market_cap_rank.map(|r| r.to_string()).unwrap_or_default(),
            s.symbol,
            s.current_price,
            s.market_cap,
            record.volume_to_market_cap,
            record.distance_from_ath
        );
    }
}

fn print_summary(records: &[EnrichedRecord]) {
    println!("\nSummary:");
    for column in summary_statistics(records) {
        let show = |v: Option<f64>| v.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<30} n={:<4} mean={} std={} min={} max={}",
            format!("{:?}", column.column),
            column.count,
            show(column.mean),
            show(column.std),
            show(column.min),
            show(column.max)
        );
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<PipelineError>() {
        return err.exit_code();
    }
    if err.downcast_ref::<StorageError>().is_some() {
        return 4;
    }
    if err.downcast_ref::<SnapshotError>().is_some() || err.downcast_ref::<ConfigError>().is_some()
    {
        return 6;
    }
    1
}
