//! Heuristic accumulation/distribution landmarks over a trailing window.
//!
//! The detector is a pure function of the window: no state is kept between
//! calls, so identical windows always yield identical events.

use crate::candle::{CandleRecord, CandleSeries};
use crate::storage_utils::DetectorConfig;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LandmarkKind {
    ClimaxHigh,
    SellingClimax,
    AutomaticRally,
    WeaknessSignal,
}

impl LandmarkKind {
    /// Short chart label.
    pub fn label(self) -> &'static str {
        match self {
            LandmarkKind::ClimaxHigh => "BC/UT",
            LandmarkKind::SellingClimax => "SC",
            LandmarkKind::AutomaticRally => "AR",
            LandmarkKind::WeaknessSignal => "SOW",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            LandmarkKind::ClimaxHigh => "Buying climax / upthrust",
            LandmarkKind::SellingClimax => "Selling climax",
            LandmarkKind::AutomaticRally => "Automatic rally",
            LandmarkKind::WeaknessSignal => "Sign of weakness",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LandmarkEvent {
    pub kind: LandmarkKind,
    /// Open time of the candle carrying the landmark (epoch ms).
    pub timestamp: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TradingRangeBand {
    pub top: f64,
    pub bottom: f64,
    /// Open time of the selling climax (epoch ms).
    pub anchor_start: i64,
    /// True when `top` came from the fallback multiplier rather than a rally.
    pub top_is_fallback: bool,
}

/// Everything the detector found in one window.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StructureReport {
    pub window_len: usize,
    pub events: Vec<LandmarkEvent>,
    pub band: Option<TradingRangeBand>,
    pub last_close: Option<f64>,
}

impl StructureReport {
    pub fn event(&self, kind: LandmarkKind) -> Option<&LandmarkEvent> {
        self.events.iter().find(|e| e.kind == kind)
    }
}

#[derive(Debug, Clone)]
pub struct StructureDetector {
    config: DetectorConfig,
}

impl StructureDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Runs the detector over the trailing `window` records of `series`.
    pub fn detect(&self, series: &CandleSeries) -> StructureReport {
        self.detect_window(series.tail(self.config.window))
    }

    /// Runs the detector over an explicit window, oldest record first.
    pub fn detect_window(&self, window: &[CandleRecord]) -> StructureReport {
        let mut report = StructureReport {
            window_len: window.len(),
            last_close: window.last().map(|r| r.close),
            ..StructureReport::default()
        };

        let (Some(climax_idx), Some(selling_idx)) = (
            first_extreme(window, |r| r.high, |a, b| a > b),
            first_extreme(window, |r| r.low, |a, b| a < b),
        ) else {
            return report;
        };

        let climax = &window[climax_idx];
        let selling = &window[selling_idx];
        report.events.push(LandmarkEvent {
            kind: LandmarkKind::ClimaxHigh,
            timestamp: climax.open_time,
            price: climax.high,
        });
        report.events.push(LandmarkEvent {
            kind: LandmarkKind::SellingClimax,
            timestamp: selling.open_time,
            price: selling.low,
        });

        let after_selling = &window[selling_idx + 1..];
        let rally = first_extreme(after_selling, |r| r.high, |a, b| a > b).map(|i| &after_selling[i]);
        if let Some(rally) = rally {
            report.events.push(LandmarkEvent {
                kind: LandmarkKind::AutomaticRally,
                timestamp: rally.open_time,
                price: rally.high,
            });
        }

        if climax_idx < selling_idx {
            let between = &window[climax_idx + 1..selling_idx];
            if let Some(i) = first_extreme(between, CandleRecord::body, |a, b| a < b) {
                let weak = &between[i];
                report.events.push(LandmarkEvent {
                    kind: LandmarkKind::WeaknessSignal,
                    timestamp: weak.open_time,
                    price: weak.low,
                });
            }
        }

        report.band = Some(TradingRangeBand {
            top: rally.map_or(selling.low * self.config.rally_fallback_multiplier, |r| r.high),
            bottom: selling.low,
            anchor_start: selling.open_time,
            top_is_fallback: rally.is_none(),
        });
        report
    }
}

impl Default for StructureDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

/// Index of the first record whose key beats every earlier one under
/// `better`. Ties keep the earliest record.
fn first_extreme<K, B>(records: &[CandleRecord], key: K, better: B) -> Option<usize>
where
    K: Fn(&CandleRecord) -> f64,
    B: Fn(f64, f64) -> bool,
{
    let mut best: Option<(usize, f64)> = None;
    for (i, record) in records.iter().enumerate() {
        let value = key(record);
        match best {
            Some((_, current)) if !better(value, current) => {}
            _ => best = Some((i, value)),
        }
    }
    best.map(|(i, _)| i)
}
