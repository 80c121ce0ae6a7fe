use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "road_damage.db";
const DEFAULT_SOURCE_PATH: &str = "detections.jsonl";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_OVERLAP_THRESHOLD_PERCENT: f32 = 50.0;
const DEFAULT_FRAME_SKIP_INTERVAL: u64 = 3;
const DEFAULT_ENRICHMENT_INTERVAL_SECS: f64 = 5.0;
const DEFAULT_ANALYSIS_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CONCURRENT_ENRICHMENTS: usize = 4;

#[derive(Debug, Deserialize, Default)]
struct RoadwatchConfigFile {
    db_path: Option<String>,
    source_path: Option<String>,
    confidence_threshold: Option<f32>,
    overlap_threshold_percent: Option<f32>,
    frame_skip_interval: Option<u64>,
    analysis: Option<AnalysisConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct AnalysisConfigFile {
    endpoint: Option<String>,
    enrichment_interval_secs: Option<f64>,
    timeout_secs: Option<u64>,
    max_concurrent: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RoadwatchConfig {
    pub db_path: String,
    /// Path to the JSONL detection stream produced by the vision model.
    pub source_path: String,
    /// Detections below this confidence are dropped before dedup.
    pub confidence_threshold: f32,
    /// Overlap percentage above which a same-class duplicate is suppressed.
    pub overlap_threshold_percent: f32,
    /// Process every Nth frame of the stream.
    pub frame_skip_interval: u64,
    pub analysis: AnalysisSettings,
}

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    /// Content-analysis endpoint. `None` runs with the stub client
    /// (fallback-style verdicts, no network).
    pub endpoint: Option<String>,
    /// Minimum spacing between enrichment dispatches per track. Zero means
    /// every eligible observation dispatches.
    pub enrichment_interval_secs: f64,
    pub timeout: Duration,
    /// Worker pool size for enrichment calls.
    pub max_concurrent: usize,
}

impl RoadwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RoadwatchConfigFile) -> Self {
        let analysis_file = file.analysis.unwrap_or_default();
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            source_path: file
                .source_path
                .unwrap_or_else(|| DEFAULT_SOURCE_PATH.to_string()),
            confidence_threshold: file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            overlap_threshold_percent: file
                .overlap_threshold_percent
                .unwrap_or(DEFAULT_OVERLAP_THRESHOLD_PERCENT),
            frame_skip_interval: file
                .frame_skip_interval
                .unwrap_or(DEFAULT_FRAME_SKIP_INTERVAL),
            analysis: AnalysisSettings {
                endpoint: analysis_file.endpoint,
                enrichment_interval_secs: analysis_file
                    .enrichment_interval_secs
                    .unwrap_or(DEFAULT_ENRICHMENT_INTERVAL_SECS),
                timeout: Duration::from_secs(
                    analysis_file
                        .timeout_secs
                        .unwrap_or(DEFAULT_ANALYSIS_TIMEOUT_SECS),
                ),
                max_concurrent: analysis_file
                    .max_concurrent
                    .unwrap_or(DEFAULT_MAX_CONCURRENT_ENRICHMENTS),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("ROADWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(path) = std::env::var("ROADWATCH_SOURCE") {
            if !path.trim().is_empty() {
                self.source_path = path;
            }
        }
        if let Ok(value) = std::env::var("ROADWATCH_CONFIDENCE_THRESHOLD") {
            self.confidence_threshold = value
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_CONFIDENCE_THRESHOLD must be a number"))?;
        }
        if let Ok(value) = std::env::var("ROADWATCH_OVERLAP_THRESHOLD") {
            self.overlap_threshold_percent = value
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_OVERLAP_THRESHOLD must be a number"))?;
        }
        if let Ok(value) = std::env::var("ROADWATCH_FRAME_SKIP") {
            self.frame_skip_interval = value
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_FRAME_SKIP must be an integer"))?;
        }
        if let Ok(url) = std::env::var("ROADWATCH_ANALYSIS_ENDPOINT") {
            if !url.trim().is_empty() {
                self.analysis.endpoint = Some(url);
            }
        }
        if let Ok(value) = std::env::var("ROADWATCH_ENRICHMENT_INTERVAL_SECS") {
            self.analysis.enrichment_interval_secs = value
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_ENRICHMENT_INTERVAL_SECS must be a number"))?;
        }
        if let Ok(value) = std::env::var("ROADWATCH_ANALYSIS_TIMEOUT_SECS") {
            let seconds: u64 = value
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_ANALYSIS_TIMEOUT_SECS must be an integer"))?;
            self.analysis.timeout = Duration::from_secs(seconds);
        }
        if let Ok(value) = std::env::var("ROADWATCH_MAX_CONCURRENT_ENRICHMENTS") {
            self.analysis.max_concurrent = value
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_MAX_CONCURRENT_ENRICHMENTS must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within 0..=1"));
        }
        if !(0.0..=100.0).contains(&self.overlap_threshold_percent) {
            return Err(anyhow!("overlap_threshold_percent must be within 0..=100"));
        }
        if self.frame_skip_interval == 0 {
            return Err(anyhow!("frame_skip_interval must be at least 1"));
        }
        if self.analysis.max_concurrent == 0 {
            return Err(anyhow!("analysis.max_concurrent must be at least 1"));
        }
        if self.analysis.timeout.as_secs() == 0 {
            return Err(anyhow!("analysis.timeout_secs must be greater than zero"));
        }
        if let Some(endpoint) = &self.analysis.endpoint {
            url::Url::parse(endpoint)
                .map_err(|e| anyhow!("invalid analysis endpoint '{}': {}", endpoint, e))?;
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RoadwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
