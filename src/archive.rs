//! Parallel per-day archive strategy.
//!
//! Every calendar day is an independent unit: cache first, then network.
//! A day that fails only costs that day.

use crate::cache::CacheStore;
use crate::candle::{PageKey, PageMap, PageOutcome};
use crate::csv_utils::decode_zip_page;
use crate::error::SourceError;
use crate::klines::{BinanceClient, is_rate_limit, rate_limit_error};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

/// A store of daily kline archives.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// The raw archive bytes for `day`, or `None` when no archive exists.
    async fn fetch_day(
        &self,
        symbol: &str,
        interval: &str,
        day: NaiveDate,
    ) -> Result<Option<Vec<u8>>, SourceError>;
}

#[async_trait]
impl ArchiveSource for BinanceClient {
    async fn fetch_day(
        &self,
        symbol: &str,
        interval: &str,
        day: NaiveDate,
    ) -> Result<Option<Vec<u8>>, SourceError> {
        let url = self.archive_url(symbol, interval, day);
        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if is_rate_limit(status) {
            return Err(rate_limit_error(response).await);
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                body: url,
            });
        }

        let bytes = response.bytes().await?;
        Ok(Some(bytes.to_vec()))
    }
}

/// Every day from `start` to `end`, both inclusive.
pub fn days_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|day| *day <= end).collect()
}

/// Fetches one page per day in `[start, end]` with at most `concurrency`
/// days in flight. Results arrive in completion order and are keyed by day.
pub async fn fetch_archive_days<A>(
    source: &A,
    cache: &CacheStore,
    symbol: &str,
    interval: &str,
    start: NaiveDate,
    end: NaiveDate,
    concurrency: usize,
) -> PageMap
where
    A: ArchiveSource + ?Sized,
{
    let days = days_between(start, end);
    info!(
        symbol = %symbol,
        interval = %interval,
        days = days.len(),
        concurrency,
        "Starting archive fetch"
    );

    let results: Vec<(NaiveDate, PageOutcome)> = futures::stream::iter(days)
        .map(|day| fetch_day_cached(source, cache, symbol, interval, day))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let pages: PageMap = results
        .into_iter()
        .map(|(day, outcome)| (PageKey::Day(day), outcome))
        .collect();

    info!(
        symbol = %symbol,
        days = pages.len(),
        rows = pages.fetched_rows(),
        missing = pages.missing_count(),
        errors = pages.error_count(),
        "Archive fetch finished"
    );
    pages
}

async fn fetch_day_cached<A>(
    source: &A,
    cache: &CacheStore,
    symbol: &str,
    interval: &str,
    day: NaiveDate,
) -> (NaiveDate, PageOutcome)
where
    A: ArchiveSource + ?Sized,
{
    if let Some(page) = cache.get(symbol, interval, day).await {
        return (day, PageOutcome::Fetched(page));
    }

    let outcome = match source.fetch_day(symbol, interval, day).await {
        Ok(None) => {
            debug!(%day, "No archive for day");
            PageOutcome::Missing
        }
        Ok(Some(bytes)) => match decode_zip_page(&bytes) {
            Ok(page) if page.is_empty() => {
                warn!(%day, "Archive holds no rows, treating day as missing");
                PageOutcome::Missing
            }
            Ok(page) => {
                if let Err(e) = cache.put(symbol, interval, day, &bytes).await {
                    warn!(%day, error = %e, "Could not cache archive");
                }
                PageOutcome::Fetched(page)
            }
            Err(e) => {
                warn!(%day, error = %e, "Downloaded archive is unreadable");
                PageOutcome::Error(e.to_string())
            }
        },
        Err(SourceError::Status { status, .. }) => {
            warn!(%day, status, "Archive request rejected, treating day as missing");
            PageOutcome::Missing
        }
        Err(e) => {
            warn!(%day, error = %e, "Archive request failed");
            PageOutcome::Error(e.to_string())
        }
    };
    (day, outcome)
}
