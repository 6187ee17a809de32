//! Turns an unordered pile of raw pages into the canonical `CandleSeries`.
//!
//! Every step is a pure transformation; malformed or implausible rows are
//! counted and dropped, never propagated.

use crate::candle::{CandleRecord, CandleSeries, RawPage, RowError};
use crate::storage_utils::CleanConfig;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use tracing::{info, warn};

/// What happened to the rows during cleaning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanStats {
    pub rows_seen: usize,
    /// Open time missing or not a number.
    pub unparsable: usize,
    /// Other fields malformed or record invariants broken.
    pub malformed: usize,
    /// Open time outside the plausibility bound.
    pub implausible: usize,
    pub duplicates: usize,
    /// Records left without a presentation timestamp.
    pub display_failures: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cleaned {
    pub series: CandleSeries,
    pub stats: CleanStats,
}

#[derive(Debug, Clone)]
pub struct Cleaner {
    config: CleanConfig,
}

impl Cleaner {
    pub fn new(config: CleanConfig) -> Self {
        Self { config }
    }

    /// Flattens and parses every page, then normalizes the resulting records.
    pub fn clean<'a, I>(&self, pages: I) -> Cleaned
    where
        I: IntoIterator<Item = &'a RawPage>,
    {
        let mut stats = CleanStats::default();
        let mut records = Vec::new();

        for row in pages.into_iter().flat_map(|page| page.rows.iter()) {
            stats.rows_seen += 1;
            match CandleRecord::from_raw(row) {
                Ok(record) => records.push(record),
                Err(RowError::BadTimestamp) => stats.unparsable += 1,
                Err(_) => stats.malformed += 1,
            }
        }

        let cleaned = self.normalize(records, stats);
        info!(
            rows = cleaned.stats.rows_seen,
            kept = cleaned.series.len(),
            unparsable = cleaned.stats.unparsable,
            malformed = cleaned.stats.malformed,
            implausible = cleaned.stats.implausible,
            duplicates = cleaned.stats.duplicates,
            "Cleaned candle pages"
        );
        cleaned
    }

    /// Runs the record-level steps on already typed records.
    #[cfg(test)]
    pub fn clean_records(&self, records: Vec<CandleRecord>) -> Cleaned {
        let stats = CleanStats {
            rows_seen: records.len(),
            ..CleanStats::default()
        };
        self.normalize(records, stats)
    }

    fn normalize(&self, mut records: Vec<CandleRecord>, mut stats: CleanStats) -> Cleaned {
        let before = records.len();
        records.retain(|r| self.is_plausible(r.open_time));
        stats.implausible += before - records.len();

        // Stable sort, so dedup keeps the first occurrence in input order.
        records.sort_by_key(|r| r.open_time);
        let before = records.len();
        records.dedup_by_key(|r| r.open_time);
        stats.duplicates += before - records.len();

        let display_times = self.display_times(&records);
        stats.display_failures = display_times.iter().filter(|t| t.is_none()).count();
        if stats.display_failures > 0 {
            warn!(
                count = stats.display_failures,
                "Could not derive presentation time for some records"
            );
        }

        Cleaned {
            series: CandleSeries::from_parts(records, display_times),
            stats,
        }
    }

    fn is_plausible(&self, open_time: i64) -> bool {
        open_time >= self.config.min_open_time_ms && open_time < self.config.max_open_time_ms
    }

    fn display_times(&self, records: &[CandleRecord]) -> Vec<Option<NaiveDateTime>> {
        let Some(offset) = FixedOffset::east_opt(self.config.display_offset_hours * 3600) else {
            warn!(
                hours = self.config.display_offset_hours,
                "Invalid display offset, skipping presentation times"
            );
            return vec![None; records.len()];
        };
        records
            .iter()
            .map(|r| {
                DateTime::from_timestamp_millis(r.open_time)
                    .map(|utc| utc.with_timezone(&offset).naive_local())
            })
            .collect()
    }
}

impl Default for Cleaner {
    fn default() -> Self {
        Self::new(CleanConfig::default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::candle::RawRow;
    use proptest::prelude::*;

    const FOUR_HOURS_MS: i64 = 4 * 60 * 60 * 1000;
    const BASE_MS: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z

    pub(crate) fn record(open_time: i64, open: f64, high: f64, low: f64, close: f64) -> CandleRecord {
        CandleRecord {
            open_time,
            open,
            high,
            low,
            close,
            volume: 100.0,
            close_time: open_time + FOUR_HOURS_MS - 1,
            trade_count: 10,
            quote_volume: 100.0 * close,
            taker_buy_base: 50.0,
            taker_buy_quote: 50.0 * close,
        }
    }

    /// Cleaned series from `(open_time, open, high, low, close)` tuples.
    pub(crate) fn series_from(rows: &[(i64, f64, f64, f64, f64)]) -> CandleSeries {
        let records = rows
            .iter()
            .map(|&(t, o, h, l, c)| record(t, o, h, l, c))
            .collect();
        Cleaner::default().clean_records(records).series
    }

    fn raw(open_time: i64, close: f64) -> RawRow {
        record(open_time, close, close + 0.1, close - 0.1, close).to_raw()
    }

    fn open_times(series: &CandleSeries) -> Vec<i64> {
        series.records().iter().map(|r| r.open_time).collect()
    }

    #[test]
    fn test_overlapping_pages_merge_without_duplicates() {
        let day_a = RawPage::new(vec![raw(BASE_MS, 1.0), raw(BASE_MS + FOUR_HOURS_MS, 1.1)]);
        let day_b = RawPage::new(vec![
            raw(BASE_MS + FOUR_HOURS_MS, 1.1),
            raw(BASE_MS + 2 * FOUR_HOURS_MS, 1.2),
        ]);
        let cleaned = Cleaner::default().clean([&day_b, &day_a]);

        assert_eq!(
            open_times(&cleaned.series),
            vec![BASE_MS, BASE_MS + FOUR_HOURS_MS, BASE_MS + 2 * FOUR_HOURS_MS]
        );
        assert_eq!(cleaned.stats.duplicates, 1);
    }

    #[test]
    fn test_duplicate_keeps_first_occurrence() {
        let first = RawPage::new(vec![raw(BASE_MS, 1.0)]);
        let second = RawPage::new(vec![raw(BASE_MS, 2.0)]);
        let cleaned = Cleaner::default().clean([&first, &second]);

        assert_eq!(cleaned.series.len(), 1);
        assert_eq!(cleaned.series.records()[0].close, 1.0);
    }

    #[test]
    fn test_epoch_zero_is_dropped() {
        let page = RawPage::new(vec![raw(0, 1.0), raw(BASE_MS, 1.0)]);
        let cleaned = Cleaner::default().clean([&page]);

        assert_eq!(open_times(&cleaned.series), vec![BASE_MS]);
        assert_eq!(cleaned.stats.implausible, 1);
    }

    #[test]
    fn test_far_future_is_dropped() {
        let page = RawPage::new(vec![raw(9_000_000_000_000, 1.0), raw(BASE_MS, 1.0)]);
        let cleaned = Cleaner::default().clean([&page]);
        assert_eq!(open_times(&cleaned.series), vec![BASE_MS]);
    }

    #[test]
    fn test_bound_is_configurable() {
        let cleaner = Cleaner::new(CleanConfig {
            min_open_time_ms: 0,
            ..CleanConfig::default()
        });
        let page = RawPage::new(vec![raw(0, 1.0)]);
        assert_eq!(cleaner.clean([&page]).series.len(), 1);
    }

    #[test]
    fn test_malformed_rows_are_counted_and_dropped() {
        let page = RawPage::new(vec![
            RawRow(vec!["Open_time".into(), "Open".into()]),
            RawRow(vec![BASE_MS.to_string(), "x".into()]),
            raw(BASE_MS, 1.0),
        ]);
        let cleaned = Cleaner::default().clean([&page]);

        assert_eq!(cleaned.series.len(), 1);
        assert_eq!(cleaned.stats.rows_seen, 3);
        assert_eq!(cleaned.stats.unparsable, 1);
        assert_eq!(cleaned.stats.malformed, 1);
    }

    #[test]
    fn test_display_time_uses_fixed_offset() {
        let series = series_from(&[(BASE_MS, 1.0, 1.1, 0.9, 1.0)]);
        let shown = series.display_time(0).unwrap();
        assert_eq!(shown.to_string(), "2024-01-01 08:00:00");
    }

    #[test]
    fn test_bad_display_offset_does_not_abort() {
        let cleaner = Cleaner::new(CleanConfig {
            display_offset_hours: 48,
            ..CleanConfig::default()
        });
        let page = RawPage::new(vec![raw(BASE_MS, 1.0)]);
        let cleaned = cleaner.clean([&page]);

        assert_eq!(cleaned.series.len(), 1);
        assert!(cleaned.series.display_time(0).is_none());
        assert_eq!(cleaned.stats.display_failures, 1);
    }

    #[test]
    fn test_empty_input_gives_empty_series() {
        let cleaned = Cleaner::default().clean(std::iter::empty::<&RawPage>());
        assert!(cleaned.series.is_empty());
        assert_eq!(cleaned.stats, CleanStats::default());
    }

    fn arb_pages() -> impl Strategy<Value = Vec<Vec<(u16, f64)>>> {
        prop::collection::vec(prop::collection::vec((0u16..300, 0.5f64..100.0), 0..40), 0..6)
    }

    fn build_pages(layout: &[Vec<(u16, f64)>]) -> Vec<RawPage> {
        layout.iter()
            .map(|rows| {
                RawPage::new(
                    rows.iter()
                        .map(|&(slot, close)| raw(BASE_MS + i64::from(slot) * FOUR_HOURS_MS, close))
                        .collect(),
                )
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_output_is_strictly_increasing(layout in arb_pages()) {
            let pages = build_pages(&layout);
            let series = Cleaner::default().clean(&pages).series;
            prop_assert!(series.records().windows(2).all(|w| w[0].open_time < w[1].open_time));
        }

        #[test]
        fn prop_every_input_slot_survives_once(layout in arb_pages()) {
            let pages = build_pages(&layout);
            let series = Cleaner::default().clean(&pages).series;
            let mut slots: Vec<u16> = layout.iter().flatten().map(|&(slot, _)| slot).collect();
            slots.sort_unstable();
            slots.dedup();
            prop_assert_eq!(series.len(), slots.len());
        }

        #[test]
        fn prop_cleaning_is_idempotent(layout in arb_pages()) {
            let pages = build_pages(&layout);
            let cleaner = Cleaner::default();
            let once = cleaner.clean(&pages).series;

            let again = cleaner.clean_records(once.records().to_vec()).series;
            prop_assert_eq!(&again, &once);

            let reparsed_page = RawPage::new(once.records().iter().map(CandleRecord::to_raw).collect());
            let reparsed = cleaner.clean([&reparsed_page]).series;
            prop_assert_eq!(&reparsed, &once);
        }
    }
}
