mod archive;
mod cache;
mod candle;
mod cleaner;
mod csv_utils;
mod error;
mod klines;
mod narrative;
mod report;
mod retry;
mod storage_utils;
mod structure;

use anyhow::{Context, Result, bail};
use chrono::{Days, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cache::CacheStore;
use crate::candle::CandleSeries;
use crate::cleaner::Cleaner;
use crate::error::ConfigError;
use crate::klines::{BinanceClient, KlineQuery, validate_interval};
use crate::narrative::GeminiClient;
use crate::report::StructurePayload;
use crate::storage_utils::{AppConfig, AsyncStorageManager};
use crate::structure::{LandmarkKind, StructureDetector};

const DEFAULT_SYMBOL: &str = "ADAUSDC";
const DEFAULT_INTERVAL: &str = "4h";
const CREDENTIAL_VAR: &str = "GOOGLE_API_KEY";
const DAY_MS: i64 = 86_400_000;

#[derive(Parser)]
#[command(
    name = "wyckoff-scout",
    version,
    about = "Fetch, clean and scan candle history for accumulation/distribution structure"
)]
struct Cli {
    /// Storage directory for config.json, the archive cache and outputs.
    /// Defaults to `storage/` next to the binary.
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download candles and write the cleaned CSV
    Fetch(FetchArgs),
    /// Detect structural landmarks in a cleaned CSV
    Detect(DetectArgs),
    /// Ask the completion service for a narrative report
    Analyze(AnalyzeArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FetchMode {
    /// Paginated REST requests, one page at a time
    Rest,
    /// Daily zip archives fetched in parallel, cached on disk
    Archive,
}

#[derive(Parser)]
struct FetchArgs {
    #[arg(default_value = DEFAULT_SYMBOL)]
    symbol: String,

    #[arg(default_value = DEFAULT_INTERVAL)]
    interval: String,

    /// Fetch the last N days instead of starting at --start
    #[arg(long, conflicts_with = "start")]
    days: Option<u32>,

    /// First day to fetch (YYYY-MM-DD)
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day to fetch, inclusive (YYYY-MM-DD)
    #[arg(long)]
    end: Option<NaiveDate>,

    #[arg(long, value_enum, default_value_t = FetchMode::Rest)]
    mode: FetchMode,

    /// Archive worker pool size
    #[arg(long)]
    concurrency: Option<usize>,

    /// Output CSV path; defaults to {SYMBOL}_{INTERVAL}_Cleaned.csv in storage
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Parser)]
struct DetectArgs {
    /// Cleaned CSV; defaults to the ADAUSDC 4h table in storage
    input: Option<PathBuf>,

    /// Number of trailing candles to scan
    #[arg(long)]
    window: Option<usize>,

    /// Range top multiplier used when no rally follows the selling climax
    #[arg(long)]
    fallback_multiplier: Option<f64>,
}

#[derive(Parser)]
struct AnalyzeArgs {
    input: PathBuf,

    /// Prompt template file; a built-in template is used otherwise
    #[arg(long)]
    prompt: Option<PathBuf>,

    /// Where the markdown report goes; defaults to the storage directory
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let storage = match &cli.storage {
        Some(dir) => AsyncStorageManager::new(dir).await,
        None => AsyncStorageManager::new_relative("storage").await,
    }
    .context("Opening storage directory")?;
    let config = storage.load_config().await.context("Loading config.json")?;

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, &storage, config).await,
        Commands::Detect(args) => run_detect(args, &storage, config).await,
        Commands::Analyze(args) => run_analyze(args, &storage, config).await,
    }
}

fn cleaned_file_name(symbol: &str, interval: &str) -> String {
    format!("{}_{}_Cleaned.csv", symbol.to_uppercase(), interval)
}

fn day_start_ms(day: NaiveDate) -> i64 {
    day.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// First day to fetch: `days` before `today`, an explicit start, or 2024-01-01.
fn resolve_start(today: NaiveDate, days: Option<u32>, start: Option<NaiveDate>) -> Result<NaiveDate, ConfigError> {
    match (days, start) {
        (Some(days), _) => today
            .checked_sub_days(Days::new(u64::from(days)))
            .ok_or_else(|| ConfigError::InvalidRange(format!("{days} days before {today}"))),
        (None, Some(start)) => Ok(start),
        (None, None) => NaiveDate::from_ymd_opt(2024, 1, 1)
            .ok_or_else(|| ConfigError::InvalidRange("default start".to_string())),
    }
}

async fn run_fetch(args: FetchArgs, storage: &AsyncStorageManager, mut config: AppConfig) -> Result<()> {
    validate_interval(&args.interval)?;
    if let Some(concurrency) = args.concurrency {
        config.fetch.concurrency = concurrency;
    }

    let today = Utc::now().date_naive();
    let start = resolve_start(today, args.days, args.start)?;
    if args.end.is_some_and(|end| end < start) {
        return Err(ConfigError::InvalidRange(format!("{start} .. {:?}", args.end)).into());
    }

    let symbol = args.symbol.trim().to_uppercase();
    let client = BinanceClient::new(&config.fetch).context("Building HTTP client")?;

    let pages = match args.mode {
        FetchMode::Rest => {
            let end_ms = args.end.map(|end| day_start_ms(end) + DAY_MS - 1);
            let query = KlineQuery::new(&symbol, &args.interval, day_start_ms(start), end_ms)?;
            klines::fetch_paginated(&client, &query, &config.fetch).await
        }
        FetchMode::Archive => {
            let cache = CacheStore::open(storage.base_dir.join("cache"))
                .await
                .context("Opening archive cache")?;
            let end = args.end.unwrap_or(today);
            archive::fetch_archive_days(
                &client,
                &cache,
                &symbol,
                &args.interval,
                start,
                end,
                config.fetch.concurrency,
            )
            .await
        }
    };
    if pages.is_empty() {
        bail!("Nothing to fetch for {symbol} {} from {start}", args.interval);
    }
    if pages.error_count() > 0 {
        warn!(errors = pages.error_count(), "Some pages failed, continuing with partial data");
    }

    let cleaned = Cleaner::new(config.clean).clean(pages.fetched());
    if cleaned.series.is_empty() {
        bail!("No candles fetched for {symbol} {} since {start}", args.interval);
    }

    let out = args
        .out
        .unwrap_or_else(|| storage.base_dir.join(cleaned_file_name(&symbol, &args.interval)));
    csv_utils::write_cleaned_csv(&out, &cleaned.series)
        .with_context(|| format!("Writing {}", out.display()))?;

    let records = cleaned.series.records();
    info!(
        records = records.len(),
        first_open = records.first().map(|r| r.open_time),
        last_open = records.last().map(|r| r.open_time),
        path = %out.display(),
        "Saved cleaned candles"
    );
    println!("{}", out.display());
    Ok(())
}

/// Reads a persisted table and runs it back through the cleaner.
fn load_series(path: &Path, config: &AppConfig) -> Result<CandleSeries> {
    if !path.exists() {
        return Err(ConfigError::MissingInput(path.to_path_buf()).into());
    }
    let page = csv_utils::read_cleaned_csv(path).with_context(|| format!("Reading {}", path.display()))?;
    let cleaned = Cleaner::new(config.clean.clone()).clean([&page]);
    Ok(cleaned.series)
}

async fn run_detect(args: DetectArgs, storage: &AsyncStorageManager, mut config: AppConfig) -> Result<()> {
    let input = args
        .input
        .unwrap_or_else(|| storage.base_dir.join(cleaned_file_name(DEFAULT_SYMBOL, DEFAULT_INTERVAL)));
    if let Some(window) = args.window {
        config.detector.window = window;
    }
    if let Some(multiplier) = args.fallback_multiplier {
        config.detector.rally_fallback_multiplier = multiplier;
    }

    let series = load_series(&input, &config)?;
    let report = StructureDetector::new(config.detector).detect(&series);
    if report.band.is_none() {
        warn!(records = series.len(), "Window too short for a trading range");
    } else if report.event(LandmarkKind::AutomaticRally).is_none() {
        info!("No rally after the selling climax, range top uses the fallback multiplier");
    }

    let payload = StructurePayload::build(&input, &series, &report);
    let path = report::emit(storage, &report::base_name(&input), &payload).await?;

    println!("\n{}\n{}", input.display(), report::render_table(&payload));
    println!("{}", path.display());
    Ok(())
}

async fn run_analyze(args: AnalyzeArgs, storage: &AsyncStorageManager, config: AppConfig) -> Result<()> {
    let series = load_series(&args.input, &config)?;
    let api_key = std::env::var(CREDENTIAL_VAR).map_err(|_| ConfigError::MissingCredential(CREDENTIAL_VAR))?;

    let template = narrative::load_template(args.prompt.as_deref()).await?;
    let prompt = narrative::build_prompt(&template, &series, config.narrative.recent_rows)?;
    let client = GeminiClient::new(&config.narrative, api_key).context("Building HTTP client")?;

    let text = narrative::generate_narrative(&client, &config.narrative.retry, &prompt)
        .await
        .context("No narrative report produced")?;

    let out_dir = args.out_dir.unwrap_or_else(|| storage.base_dir.clone());
    let path = narrative::write_report(&out_dir, &report::base_name(&args.input), &text).await?;
    println!("{}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_start_from_relative_days() {
        let today = date(2024, 3, 10);
        assert_eq!(resolve_start(today, Some(9), None).unwrap(), date(2024, 3, 1));
        assert_eq!(resolve_start(today, Some(0), Some(date(2020, 1, 1))).unwrap(), today);
    }

    #[test]
    fn test_start_defaults_and_explicit() {
        let today = date(2024, 3, 10);
        assert_eq!(resolve_start(today, None, None).unwrap(), date(2024, 1, 1));
        assert_eq!(resolve_start(today, None, Some(date(2023, 6, 1))).unwrap(), date(2023, 6, 1));
    }

    #[test]
    fn test_huge_day_count_is_a_range_error() {
        let err = resolve_start(date(2024, 3, 10), Some(200_000_000), None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRange(_)));
    }

    #[test]
    fn test_day_start_and_file_name() {
        assert_eq!(day_start_ms(date(2024, 1, 1)), 1_704_067_200_000);
        assert_eq!(cleaned_file_name("adausdc", "4h"), "ADAUSDC_4h_Cleaned.csv");
    }
}
