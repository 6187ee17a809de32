//! Structure payload for the chart emitter, plus the console summary.

use crate::candle::CandleSeries;
use crate::csv_utils::HUMAN_TIME_FORMAT;
use crate::storage_utils::AsyncStorageManager;
use crate::structure::{LandmarkKind, StructureReport, TradingRangeBand};
use anyhow::Result;
use chrono::DateTime;
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

const CLEANED_SUFFIX: &str = "_Cleaned";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmittedEvent {
    pub kind: LandmarkKind,
    pub label: &'static str,
    pub timestamp: i64,
    /// Presentation time of the candle, when the series has one.
    pub human_time: Option<String>,
    pub price: f64,
}

/// What the chart emitter receives: landmarks, band and current price.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructurePayload {
    pub series_path: String,
    pub window_len: usize,
    pub events: Vec<EmittedEvent>,
    pub band: Option<TradingRangeBand>,
    pub last_close: Option<f64>,
}

impl StructurePayload {
    pub fn build(series_path: &Path, series: &CandleSeries, report: &StructureReport) -> Self {
        let events = report
            .events
            .iter()
            .map(|e| EmittedEvent {
                kind: e.kind,
                label: e.kind.label(),
                timestamp: e.timestamp,
                human_time: series
                    .position(e.timestamp)
                    .and_then(|i| series.display_time(i))
                    .map(|t| t.format(HUMAN_TIME_FORMAT).to_string()),
                price: e.price,
            })
            .collect();

        Self {
            series_path: series_path.display().to_string(),
            window_len: report.window_len,
            events,
            band: report.band,
            last_close: report.last_close,
        }
    }
}

/// `ADAUSDC_4h_Cleaned.csv` -> `ADAUSDC_4h`.
pub fn base_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.strip_suffix(CLEANED_SUFFIX) {
        Some(base) => base.to_string(),
        None => stem,
    }
}

/// Writes `{base}_structure.json` into the storage directory.
pub async fn emit(storage: &AsyncStorageManager, base: &str, payload: &StructurePayload) -> Result<PathBuf> {
    let path = storage.save(&format!("{base}_structure"), payload).await?;
    info!(path = %path.display(), events = payload.events.len(), "Wrote structure payload");
    Ok(path)
}

fn format_timestamp(ts_ms: i64) -> String {
    match DateTime::from_timestamp_millis(ts_ms) {
        Some(dt) => format!("{} UTC", dt.format("%Y-%m-%d %H:%M")),
        None => "Unknown Time".to_string(),
    }
}

fn event_color(kind: LandmarkKind) -> Color {
    match kind {
        LandmarkKind::ClimaxHigh => Color::Red,
        LandmarkKind::SellingClimax => Color::Green,
        LandmarkKind::AutomaticRally => Color::Cyan,
        LandmarkKind::WeaknessSignal => Color::Yellow,
    }
}

fn price_cell(price: f64) -> Cell {
    Cell::new(format!("{price:.4}")).set_alignment(CellAlignment::Right)
}

pub fn render_table(payload: &StructurePayload) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Label").add_attribute(Attribute::Bold),
            Cell::new("Event").add_attribute(Attribute::Bold),
            Cell::new("Time").add_attribute(Attribute::Bold),
            Cell::new("Price")
                .add_attribute(Attribute::Bold)
                .set_alignment(CellAlignment::Right),
        ]);

    for event in &payload.events {
        let time = event
            .human_time
            .clone()
            .unwrap_or_else(|| format_timestamp(event.timestamp));
        table.add_row(vec![
            Cell::new(event.label).fg(event_color(event.kind)),
            Cell::new(event.kind.description()),
            Cell::new(time).fg(Color::DarkGrey),
            price_cell(event.price),
        ]);
    }

    if let Some(band) = &payload.band {
        let top_note = if band.top_is_fallback { "Range top (fallback)" } else { "Range top" };
        table.add_row(vec![
            Cell::new("TR").fg(Color::Magenta),
            Cell::new(top_note),
            Cell::new(""),
            price_cell(band.top),
        ]);
        table.add_row(vec![
            Cell::new("TR").fg(Color::Magenta),
            Cell::new("Range bottom"),
            Cell::new(format_timestamp(band.anchor_start)).fg(Color::DarkGrey),
            price_cell(band.bottom),
        ]);
    }

    if let Some(close) = payload.last_close {
        table.add_row(vec![
            Cell::new("NOW").add_attribute(Attribute::Bold),
            Cell::new("Current price"),
            Cell::new(""),
            price_cell(close),
        ]);
    }
    table
}
