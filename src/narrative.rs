//! Narrative report: a recent slice of the series sent to a text-completion
//! service, with the answer written out as markdown.

use crate::candle::CandleSeries;
use crate::csv_utils::render_recent_csv;
use crate::error::{NarrativeError, SourceError};
use crate::klines::{is_rate_limit, rate_limit_error};
use crate::retry::{RetryFailure, RetryPolicy};
use crate::storage_utils::NarrativeConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const DEFAULT_TEMPLATE: &str = "\
You are a market structure analyst working in the Wyckoff tradition.
The data below is a CSV of recent candles for one symbol, oldest first.
Human_Time is UTC+8; Open_time and Close_time are epoch milliseconds.

Identify the current phase (accumulation, markup, distribution or markdown)
and point out any selling climax, automatic rally, secondary test, spring,
upthrust or sign of weakness you can see, quoting times and prices.
Describe the trading range bounds and what would confirm or invalidate the
reading. Answer in markdown with short sections.";

const DATA_SEPARATOR: &str = "\n\n--- DATA (CSV) ---\n";
const TEXT_POINTER: &str = "/candidates/0/content/parts/0/text";

/// A service that answers a prompt with free-form text.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, SourceError>;
}

// --- Gemini ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    max_output_tokens: u32,
}

/// `generateContent` endpoint of the Gemini API.
pub struct GeminiClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f64,
    max_output_tokens: u32,
}

impl GeminiClient {
    pub fn new(config: &NarrativeConfig, api_key: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        })
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

#[async_trait]
impl TextCompletion for GeminiClient {
    async fn complete(&self, prompt: &str) -> Result<String, SourceError> {
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        };

        let response = self
            .client
            .post(self.url())
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

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

        let value: Value = response.json().await?;
        value
            .pointer(TEXT_POINTER)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SourceError::Decode(format!("no text at {TEXT_POINTER}")))
    }
}

// --- Prompt and report ---

/// Template, separator, then the trailing `recent_rows` records as CSV.
pub fn build_prompt(template: &str, series: &CandleSeries, recent_rows: usize) -> Result<String> {
    let slice = render_recent_csv(series, recent_rows).context("Rendering recent candles")?;
    Ok(format!("{}{DATA_SEPARATOR}{slice}", template.trim_end()))
}

/// Asks `service` for a narrative over the recent slice of `series`,
/// retrying rate limits and transport failures under `policy`.
pub async fn generate_narrative<C>(
    service: &C,
    policy: &RetryPolicy,
    prompt: &str,
) -> Result<String, NarrativeError>
where
    C: TextCompletion + ?Sized,
{
    info!(chars = prompt.len(), "Requesting narrative");
    let text = policy
        .run("narrative", || service.complete(prompt))
        .await
        .map_err(|failure| match failure {
            RetryFailure::Fatal(SourceError::Decode(reason)) => NarrativeError::Malformed(reason),
            RetryFailure::Fatal(err) => NarrativeError::Request(err),
            RetryFailure::Exhausted { attempts, last } => NarrativeError::Exhausted { attempts, last },
        })?;

    if text.trim().is_empty() {
        warn!("Completion service returned empty text");
        return Err(NarrativeError::Malformed("empty text".to_string()));
    }
    Ok(text)
}

pub async fn load_template(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(path)
            .await
            .with_context(|| format!("Reading prompt template {}", path.display())),
        None => Ok(DEFAULT_TEMPLATE.to_string()),
    }
}

pub fn chart_file_name(base: &str) -> String {
    format!("{base}_Wyckoff_Chart.png")
}

/// Puts a title and the chart image in front of `text`, unless the text
/// already references the chart.
pub fn render_report(base: &str, text: &str) -> String {
    let chart = chart_file_name(base);
    if text.contains(&chart) {
        return text.to_string();
    }
    format!("# {base} Wyckoff Analysis\n\n![{base} chart]({chart})\n\n{}\n", text.trim())
}

/// Writes `{base}_Wyckoff_Analysis.md` into `out_dir`.
pub async fn write_report(out_dir: &Path, base: &str, text: &str) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("Creating {}", out_dir.display()))?;

    let final_path = out_dir.join(format!("{base}_Wyckoff_Analysis.md"));
    let tmp_path = out_dir.join(format!("{base}_Wyckoff_Analysis.md.tmp"));
    fs::write(&tmp_path, render_report(base, text)).await?;
    fs::rename(&tmp_path, &final_path).await?;

    info!(path = %final_path.display(), "Wrote narrative report");
    Ok(final_path)
}
