//! Candle data model: raw pages as they come off the wire, the typed
//! `CandleRecord`, and the canonical `CandleSeries` produced by the cleaner.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Column names of the twelve raw kline fields, in wire order.
pub const KLINE_COLUMNS: [&str; 12] = [
    "Open_time",
    "Open",
    "High",
    "Low",
    "Close",
    "Volume",
    "Close_time",
    "Quote_asset_volume",
    "Number_of_trades",
    "Taker_buy_base_asset_volume",
    "Taker_buy_quote_asset_volume",
    "Ignore",
];

/// Number of leading fields a row must carry to become a record. The trailing
/// "ignore" field may be absent.
const REQUIRED_FIELDS: usize = 11;

/// Timestamps at or above this value are microseconds, not milliseconds.
const MICROS_THRESHOLD: i64 = 1_000_000_000_000_000;

// --- Raw pages ---

/// One untyped kline row: the string form of every field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow(pub Vec<String>);

impl RawRow {
    /// Builds a row from a JSON array element of the REST response. Numbers
    /// keep their textual representation so no precision is lost before
    /// parsing.
    pub fn from_json(values: &[Value]) -> Self {
        let fields = values
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect();
        RawRow(fields)
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }
}

/// A batch of raw rows: one REST response chunk or one archive day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPage {
    pub rows: Vec<RawRow>,
}

impl RawPage {
    pub fn new(rows: Vec<RawRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Identifies a page within a fetch: the cursor a REST request started from,
/// or the calendar day of an archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageKey {
    Cursor(i64),
    Day(NaiveDate),
}

/// What a fetch obtained for one page key.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Fetched(RawPage),
    /// The source has no data for this key (e.g. archive 404).
    Missing,
    /// The page could not be obtained; the reason is kept for reporting.
    Error(String),
}

/// Fetch output shared by both acquisition strategies, ordered by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMap {
    pages: BTreeMap<PageKey, PageOutcome>,
}

impl PageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: PageKey, outcome: PageOutcome) {
        self.pages.insert(key, outcome);
    }

    #[cfg(test)]
    pub fn get(&self, key: &PageKey) -> Option<&PageOutcome> {
        self.pages.get(key)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PageKey, &PageOutcome)> {
        self.pages.iter()
    }

    /// All successfully fetched pages, in key order.
    pub fn fetched(&self) -> impl Iterator<Item = &RawPage> {
        self.iter().filter_map(|(_, outcome)| match outcome {
            PageOutcome::Fetched(page) => Some(page),
            _ => None,
        })
    }

    pub fn fetched_rows(&self) -> usize {
        self.fetched().map(RawPage::len).sum()
    }

    pub fn missing_count(&self) -> usize {
        self.iter()
            .filter(|(_, o)| matches!(o, PageOutcome::Missing))
            .count()
    }

    pub fn error_count(&self) -> usize {
        self.iter()
            .filter(|(_, o)| matches!(o, PageOutcome::Error(_)))
            .count()
    }
}

impl FromIterator<(PageKey, PageOutcome)> for PageMap {
    fn from_iter<I: IntoIterator<Item = (PageKey, PageOutcome)>>(iter: I) -> Self {
        Self {
            pages: iter.into_iter().collect(),
        }
    }
}

// --- Typed records ---

/// Why a raw row was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("open time is not a number")]
    BadTimestamp,
    #[error("row has {0} fields, expected at least {REQUIRED_FIELDS}")]
    TooShort(usize),
    #[error("field {0} is not a finite number")]
    BadField(&'static str),
    #[error("record violates invariant: {0}")]
    Invariant(&'static str),
}

/// One fixed-shape OHLCV candle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandleRecord {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub trade_count: u64,
    pub quote_volume: f64,
    pub taker_buy_base: f64,
    pub taker_buy_quote: f64,
}

impl CandleRecord {
    /// Parses and validates a raw row. Any malformed field or broken
    /// invariant rejects the whole row.
    pub fn from_raw(row: &RawRow) -> Result<Self, RowError> {
        let f = row.fields();

        // The open time decides whether a row is usable at all, so it is
        // checked before the length.
        let open_time = f
            .first()
            .and_then(|s| parse_millis(s))
            .ok_or(RowError::BadTimestamp)?;
        if f.len() < REQUIRED_FIELDS {
            return Err(RowError::TooShort(f.len()));
        }

        let record = CandleRecord {
            open_time,
            open: parse_price(&f[1], "open")?,
            high: parse_price(&f[2], "high")?,
            low: parse_price(&f[3], "low")?,
            close: parse_price(&f[4], "close")?,
            volume: parse_price(&f[5], "volume")?,
            close_time: parse_millis(&f[6]).ok_or(RowError::BadField("close_time"))?,
            quote_volume: parse_price(&f[7], "quote_volume")?,
            trade_count: parse_count(&f[8]).ok_or(RowError::BadField("trade_count"))?,
            taker_buy_base: parse_price(&f[9], "taker_buy_base")?,
            taker_buy_quote: parse_price(&f[10], "taker_buy_quote")?,
        };
        record.check_invariants()?;
        Ok(record)
    }

    fn check_invariants(&self) -> Result<(), RowError> {
        if self.open_time >= self.close_time {
            return Err(RowError::Invariant("open_time < close_time"));
        }
        if self.low > self.high {
            return Err(RowError::Invariant("low <= high"));
        }
        if self.open < self.low || self.open > self.high {
            return Err(RowError::Invariant("low <= open <= high"));
        }
        if self.close < self.low || self.close > self.high {
            return Err(RowError::Invariant("low <= close <= high"));
        }
        Ok(())
    }

    /// Signed body of the candle; negative for a down candle.
    pub fn body(&self) -> f64 {
        self.close - self.open
    }

    /// The row this record would have arrived as, in wire order.
    pub fn to_raw(&self) -> RawRow {
        RawRow(vec![
            self.open_time.to_string(),
            self.open.to_string(),
            self.high.to_string(),
            self.low.to_string(),
            self.close.to_string(),
            self.volume.to_string(),
            self.close_time.to_string(),
            self.quote_volume.to_string(),
            self.trade_count.to_string(),
            self.taker_buy_base.to_string(),
            self.taker_buy_quote.to_string(),
            "0".to_string(),
        ])
    }
}

/// Parses an epoch timestamp, accepting integer or integral float text, and
/// folds microsecond values down to milliseconds.
pub fn parse_millis(s: &str) -> Option<i64> {
    let s = s.trim();
    let value = match s.parse::<i64>() {
        Ok(v) => v,
        Err(_) => {
            let f = s.parse::<f64>().ok()?;
            if !f.is_finite() || f.fract() != 0.0 || f.abs() > i64::MAX as f64 {
                return None;
            }
            f as i64
        }
    };
    if value >= MICROS_THRESHOLD {
        Some(value / 1000)
    } else {
        Some(value)
    }
}

fn parse_price(s: &str, field: &'static str) -> Result<f64, RowError> {
    match s.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(RowError::BadField(field)),
    }
}

fn parse_count(s: &str) -> Option<u64> {
    let s = s.trim();
    s.parse::<u64>().ok().or_else(|| {
        let f = s.parse::<f64>().ok()?;
        (f.is_finite() && f >= 0.0 && f.fract() == 0.0).then_some(f as u64)
    })
}

// --- Canonical series ---

/// Cleaned candles, strictly increasing and unique by `open_time`.
///
/// Only the cleaner builds these, which is what upholds the ordering
/// invariant. Each record carries an optional presentation timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleSeries {
    records: Vec<CandleRecord>,
    display_times: Vec<Option<NaiveDateTime>>,
}

impl CandleSeries {
    pub(crate) fn from_parts(
        records: Vec<CandleRecord>,
        display_times: Vec<Option<NaiveDateTime>>,
    ) -> Self {
        debug_assert_eq!(records.len(), display_times.len());
        debug_assert!(records.windows(2).all(|w| w[0].open_time < w[1].open_time));
        Self {
            records,
            display_times,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[CandleRecord] {
        &self.records
    }

    /// The trailing `n` records (all of them when the series is shorter).
    pub fn tail(&self, n: usize) -> &[CandleRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    /// Presentation timestamp of the record at `index`, when derivable.
    pub fn display_time(&self, index: usize) -> Option<NaiveDateTime> {
        self.display_times.get(index).copied().flatten()
    }

    /// The trailing `n` records together with their presentation timestamps.
    pub fn tail_with_display(&self, n: usize) -> impl Iterator<Item = (&CandleRecord, Option<NaiveDateTime>)> {
        let start = self.records.len().saturating_sub(n);
        self.records[start..]
            .iter()
            .zip(self.display_times[start..].iter().copied())
    }

    /// Index of the record opened at `open_time`.
    pub fn position(&self, open_time: i64) -> Option<usize> {
        self.records
            .binary_search_by_key(&open_time, |r| r.open_time)
            .ok()
    }
}
