use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

// CONFIGURATION STRUCTS
// `config.json` in the storage directory deserializes into these. Every field
// has a default so a partial file (or no file) is fine.

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub page_limit: usize,         // records per REST request, clamped to 1..=1000
    pub concurrency: usize,        // archive worker pool size
    pub request_timeout_secs: u64, // per-request timeout
    pub page_pause_ms: u64,        // pause between REST pages
    pub rest_base_url: String,
    pub archive_base_url: String,
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_limit: 1000,
            concurrency: 20,
            request_timeout_secs: 10,
            page_pause_ms: 100,
            rest_base_url: "https://data-api.binance.vision".to_string(),
            archive_base_url: "https://data.binance.vision".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CleanConfig {
    /// Inclusive lower bound for a plausible open time (epoch ms).
    pub min_open_time_ms: i64,
    /// Exclusive upper bound for a plausible open time (epoch ms).
    pub max_open_time_ms: i64,
    /// Offset applied to the presentation timestamp.
    pub display_offset_hours: i32,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            min_open_time_ms: 1_483_228_800_000, // 2017-01-01T00:00:00Z
            max_open_time_ms: 4_102_444_800_000, // 2100-01-01T00:00:00Z
            display_offset_hours: 8,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    /// Trailing records the detector looks at.
    pub window: usize,
    /// Band top = selling climax low × this, when no rally follows it.
    pub rally_fallback_multiplier: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: 1000,
            rally_fallback_multiplier: 1.15,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NarrativeConfig {
    pub endpoint: String,
    pub model: String,
    pub recent_rows: usize,
    pub temperature: f64,
    pub max_output_tokens: u32,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-flash-latest".to_string(),
            recent_rows: 100,
            temperature: 0.3,
            max_output_tokens: 8192,
            request_timeout_secs: 60,
            retry: RetryPolicy {
                max_attempts: 6,
                base_delay_ms: 10_000,
                backoff_multiplier: 2.0,
                max_delay_ms: 320_000,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub fetch: FetchConfig,
    pub clean: CleanConfig,
    pub detector: DetectorConfig,
    pub narrative: NarrativeConfig,
}

// STORAGE MANAGER

pub struct AsyncStorageManager {
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// Uses `base_dir` as given, creating it if needed.
    pub async fn new<P: AsRef<Path>>(base_dir: P) -> anyhow::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).await?;
        }
        Ok(Self { base_dir })
    }

    /// Resolves `relative_path` against the directory of the running binary.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        let exe_path = std::env::current_exe()?;
        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);
        Self::new(base_dir).await
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", filename))
    }

    /// Serializes `data` as pretty JSON. Writes to a `.tmp` sibling first and
    /// renames it into place, so readers never see a half-written file.
    pub async fn save<T: Serialize>(&self, filename: &str, data: &T) -> anyhow::Result<PathBuf> {
        let final_path = self.path_for(filename);
        let tmp_path = self.base_dir.join(format!("{}.json.tmp", filename));

        let json_bytes = serde_json::to_vec_pretty(data)?;
        fs::write(&tmp_path, json_bytes).await?;
        fs::rename(&tmp_path, &final_path).await?;

        debug!(path = %final_path.display(), "Saved JSON");
        Ok(final_path)
    }

    pub async fn load<T: DeserializeOwned>(&self, filename: &str) -> anyhow::Result<T> {
        let content = fs::read(self.path_for(filename)).await?;
        let data = serde_json::from_slice(&content)?;
        Ok(data)
    }

    /// Loads `config.json`, falling back to defaults when the file is absent.
    /// A file that exists but does not parse is an error.
    pub async fn load_config(&self) -> anyhow::Result<AppConfig> {
        if !self.path_for("config").exists() {
            info!(dir = %self.base_dir.display(), "No config.json, using defaults");
            return Ok(AppConfig::default());
        }
        self.load("config").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
        let config = storage.load_config().await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.fetch.page_limit, 1000);
        assert_eq!(config.detector.rally_fallback_multiplier, 1.15);
    }

    #[tokio::test]
    async fn test_partial_config_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{ "detector": { "window": 400 }, "fetch": { "concurrency": 4 } }"#,
        )
        .unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
        let config = storage.load_config().await.unwrap();

        assert_eq!(config.detector.window, 400);
        assert_eq!(config.detector.rally_fallback_multiplier, 1.15);
        assert_eq!(config.fetch.concurrency, 4);
        assert_eq!(config.fetch.page_limit, 1000);
        assert_eq!(config.narrative.recent_rows, 100);
    }

    #[tokio::test]
    async fn test_broken_config_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
        assert!(storage.load_config().await.is_err());
    }

    #[tokio::test]
    async fn test_save_then_load_leaves_no_tmp_file() {
        let dir = tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path().join("nested")).await.unwrap();
        let path = storage.save("config", &AppConfig::default()).await.unwrap();

        assert!(path.exists());
        assert!(!storage.base_dir.join("config.json.tmp").exists());
        let loaded: AppConfig = storage.load("config").await.unwrap();
        assert_eq!(loaded, AppConfig::default());
    }
}
