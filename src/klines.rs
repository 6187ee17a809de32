use crate::candle::{PageKey, PageMap, PageOutcome, RawPage, RawRow, parse_millis};
use crate::error::{ConfigError, SourceError};
use crate::retry::RetryFailure;
use crate::storage_utils::FetchConfig;
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Field index of the close time within a raw kline row.
const CLOSE_TIME_FIELD: usize = 6;
/// Most rows the kline endpoint returns per request.
pub const MAX_PAGE_LIMIT: usize = 1000;

static INTERVAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9][0-9]*[smhdwM]$").expect("interval regex"));
static BAN_UNTIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"until\s+(\d+)").expect("ban regex"));

/// What to fetch: one symbol and interval from `start_ms`, optionally up to
/// `end_ms` (inclusive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlineQuery {
    pub symbol: String,
    pub interval: String,
    pub start_ms: i64,
    pub end_ms: Option<i64>,
}

impl KlineQuery {
    pub fn new(
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: Option<i64>,
    ) -> Result<Self, ConfigError> {
        validate_interval(interval)?;
        if end_ms.is_some_and(|end| end < start_ms) {
            return Err(ConfigError::InvalidRange(format!(
                "end {:?} is before start {}",
                end_ms, start_ms
            )));
        }
        Ok(Self {
            symbol: symbol.trim().to_uppercase(),
            interval: interval.trim().to_string(),
            start_ms,
            end_ms,
        })
    }
}

pub fn validate_interval(interval: &str) -> Result<(), ConfigError> {
    if INTERVAL_RE.is_match(interval.trim()) {
        Ok(())
    } else {
        Err(ConfigError::InvalidInterval(interval.to_string()))
    }
}

/// A paginated kline endpoint.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Up to `limit` rows opening at or after `cursor`, oldest first.
    async fn fetch_page(
        &self,
        query: &KlineQuery,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<RawRow>, SourceError>;
}

// --- HTTP client ---

/// Binance public market data over HTTP: the REST kline endpoint and the
/// daily archive bucket.
#[derive(Clone)]
pub struct BinanceClient {
    pub(crate) client: Client,
    rest_base_url: String,
    archive_base_url: String,
}

impl BinanceClient {
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(config.concurrency.max(1))
            .build()?;
        Ok(Self {
            client,
            rest_base_url: config.rest_base_url.trim_end_matches('/').to_string(),
            archive_base_url: config.archive_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn klines_url(&self) -> String {
        format!("{}/api/v3/klines", self.rest_base_url)
    }

    pub(crate) fn archive_url(&self, symbol: &str, interval: &str, day: chrono::NaiveDate) -> String {
        let date = day.format("%Y-%m-%d");
        format!(
            "{}/data/spot/daily/klines/{symbol}/{interval}/{symbol}-{interval}-{date}.zip",
            self.archive_base_url
        )
    }
}

#[async_trait]
impl KlineSource for BinanceClient {
    async fn fetch_page(
        &self,
        query: &KlineQuery,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<RawRow>, SourceError> {
        let mut params = vec![
            ("symbol", query.symbol.clone()),
            ("interval", query.interval.clone()),
            ("startTime", cursor.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(end) = query.end_ms {
            params.push(("endTime", end.to_string()));
        }

        let response = self.client.get(self.klines_url()).query(&params).send().await?;
        let status = response.status();

        if is_rate_limit(status) {
            return Err(rate_limit_error(response).await);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let raw_klines: Vec<Vec<Value>> = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(raw_klines.iter().map(|k| RawRow::from_json(k)).collect())
    }
}

pub(crate) fn is_rate_limit(status: StatusCode) -> bool {
    status == 418 || status == 429
}

/// Builds a rate-limit error, extracting how long to wait from either the
/// `Retry-After` header or a `-1003 ... banned until <ms>` body.
pub(crate) async fn rate_limit_error(response: Response) -> SourceError {
    let header_hint = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let body = response.text().await.unwrap_or_default();
    let retry_after = header_hint.or_else(|| ban_wait(&body, chrono::Utc::now().timestamp_millis()));
    SourceError::RateLimited { retry_after }
}

fn ban_wait(body: &str, now_ms: i64) -> Option<Duration> {
    if !body.contains("-1003") {
        return None;
    }
    let ban_until: i64 = BAN_UNTIL_RE.captures(body)?.get(1)?.as_str().parse().ok()?;
    (ban_until > now_ms).then(|| Duration::from_millis((ban_until - now_ms) as u64) + Duration::from_secs(5))
}

// --- Paginated strategy ---

/// Walks the kline endpoint from `query.start_ms`, one page at a time.
///
/// The cursor advances to the last row's close time + 1. The walk ends on an
/// empty or short page, at `query.end_ms`, or on a failure; failures are
/// recorded as an `Error` entry at the cursor and the pages gathered so far
/// are returned.
pub async fn fetch_paginated<S>(source: &S, query: &KlineQuery, config: &FetchConfig) -> PageMap
where
    S: KlineSource + ?Sized,
{
    let limit = config.page_limit.clamp(1, MAX_PAGE_LIMIT);
    if limit != config.page_limit {
        warn!(configured = config.page_limit, used = limit, "Page limit out of range, clamped");
    }
    let pause = Duration::from_millis(config.page_pause_ms);
    let mut pages = PageMap::new();
    let mut cursor = query.start_ms;
    let mut total_rows = 0usize;

    info!(
        symbol = %query.symbol,
        interval = %query.interval,
        start_ms = query.start_ms,
        "Starting paginated kline fetch"
    );

    loop {
        if query.end_ms.is_some_and(|end| cursor > end) {
            debug!(cursor, "Reached end bound");
            break;
        }

        let result = config
            .retry
            .run("klines page", move || source.fetch_page(query, cursor, limit))
            .await;

        let rows = match result {
            Ok(rows) => rows,
            Err(RetryFailure::Fatal(e)) => {
                error!(symbol = %query.symbol, cursor, error = %e, "Kline request failed");
                pages.insert(PageKey::Cursor(cursor), PageOutcome::Error(e.to_string()));
                break;
            }
            Err(e @ RetryFailure::Exhausted { .. }) => {
                warn!(symbol = %query.symbol, cursor, error = %e, "Giving up, returning partial results");
                pages.insert(PageKey::Cursor(cursor), PageOutcome::Error(e.to_string()));
                break;
            }
        };

        if rows.is_empty() {
            debug!(cursor, "Empty page, no more data");
            break;
        }

        let page_len = rows.len();
        let next_cursor = rows
            .last()
            .and_then(|row| row.fields().get(CLOSE_TIME_FIELD))
            .and_then(|s| parse_millis(s))
            .map(|close_time| close_time + 1);

        total_rows += page_len;
        pages.insert(PageKey::Cursor(cursor), PageOutcome::Fetched(RawPage::new(rows)));
        info!(symbol = %query.symbol, cursor, rows = page_len, total = total_rows, "Fetched kline page");

        if page_len < limit {
            debug!("Short page, history exhausted");
            break;
        }
        match next_cursor {
            Some(next) if next > cursor => cursor = next,
            _ => {
                warn!(cursor, "Cursor did not advance, stopping");
                break;
            }
        }

        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    pages
}
