// Track configuration management for the gradebox worker
use anyhow::{bail, Context, Result};
use gradebox_common::types::Track;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/tracks.json";

/// Per-track sandbox settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackConfig {
    pub track: Track,
    pub image: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    pub default_timeout_seconds: u64,
    /// Ceiling for any challenge or request timeout on this track
    #[serde(default = "default_max_timeout")]
    pub max_timeout_seconds: u64,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    #[serde(default = "default_scratch_mb")]
    pub scratch_size_mb: u32,
}

/// Thresholds of the heuristic insight bonus for data challenges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightConfig {
    pub markers: Vec<String>,
    pub result_names: Vec<String>,
    pub marker_points: f64,
    pub bonus_cap: f64,
    pub result_name_points: f64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            markers: [
                "correlation",
                "p-value",
                "p_value",
                "accuracy",
                "r-squared",
                "regression",
                "significant",
                "trend",
                "outlier",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            result_names: ["result", "final_df", "summary", "model", "prediction"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            marker_points: 5.0,
            bonus_cap: 20.0,
            result_name_points: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Read-only dataset directory baked into the data image
    pub datasets_dir: String,
    #[serde(default)]
    pub insight: InsightConfig,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            datasets_dir: "/datasets".to_string(),
            insight: InsightConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Name of the long-lived emulator container on this host
    pub emulator_container: String,
    /// Hostname the emulator answers to on each per-run network
    pub emulator_alias: String,
    pub emulator_port: u16,
    pub region: String,
    /// Provider plugins baked into the cloud image
    pub terraform_plugin_dir: String,
    pub destroy_timeout_seconds: u64,
    pub destroy_retries: u32,
    pub docker_startup_grace_ms: u64,
    pub port_probe_timeout_ms: u64,
    pub build_memory_limit_mb: u32,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            emulator_container: "gradebox-localstack".to_string(),
            emulator_alias: "emulator".to_string(),
            emulator_port: 4566,
            region: "us-east-1".to_string(),
            terraform_plugin_dir: "/opt/terraform/plugins".to_string(),
            destroy_timeout_seconds: 60,
            destroy_retries: 1,
            docker_startup_grace_ms: 2000,
            port_probe_timeout_ms: 1500,
            build_memory_limit_mb: 1024,
        }
    }
}

impl CloudConfig {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.emulator_alias, self.emulator_port)
    }
}

fn default_pids_limit() -> i64 {
    128
}

fn default_max_timeout() -> u64 {
    900
}

fn default_pass_threshold() -> f64 {
    70.0
}

fn default_scratch_mb() -> u32 {
    64
}

#[derive(Debug, Serialize, Deserialize)]
struct TracksJson {
    tracks: Vec<TrackConfig>,
    #[serde(default)]
    data: DataConfig,
    #[serde(default)]
    cloud: CloudConfig,
}

/// Track configuration manager
#[derive(Debug, Clone)]
pub struct TrackConfigManager {
    configs: HashMap<Track, TrackConfig>,
    data: DataConfig,
    cloud: CloudConfig,
}

impl TrackConfigManager {
    /// Load track configurations from a tracks.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Track config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let parsed: TracksJson = serde_json::from_str(content)?;

        let mut configs = HashMap::new();
        for track in parsed.tracks {
            if configs.insert(track.track, track.clone()).is_some() {
                bail!("Track '{}' is configured more than once", track.track);
            }
        }

        Ok(Self {
            configs,
            data: parsed.data,
            cloud: parsed.cloud,
        })
    }

    /// Load from GRADEBOX_TRACKS_CONFIG or config/tracks.json.
    /// Falls back to the built-in defaults when no file exists.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("GRADEBOX_TRACKS_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);

        if path.exists() {
            Self::load(path)
        } else {
            warn!(path = %path.display(), "Track config not found, using built-in defaults");
            Ok(Self::built_in())
        }
    }

    pub fn built_in() -> Self {
        let tracks = vec![
            TrackConfig {
                track: Track::Web,
                image: "gradebox-web:latest".to_string(),
                memory_limit_mb: 512,
                cpu_limit: 1.0,
                pids_limit: 256,
                default_timeout_seconds: 30,
                max_timeout_seconds: 300,
                pass_threshold: default_pass_threshold(),
                scratch_size_mb: 128,
            },
            TrackConfig {
                track: Track::Data,
                image: "gradebox-data:latest".to_string(),
                memory_limit_mb: 1024,
                cpu_limit: 1.0,
                pids_limit: default_pids_limit(),
                default_timeout_seconds: 30,
                max_timeout_seconds: 300,
                pass_threshold: default_pass_threshold(),
                scratch_size_mb: default_scratch_mb(),
            },
            TrackConfig {
                track: Track::Cloud,
                image: "gradebox-cloud:latest".to_string(),
                memory_limit_mb: 1024,
                cpu_limit: 1.0,
                pids_limit: 256,
                default_timeout_seconds: 120,
                max_timeout_seconds: default_max_timeout(),
                pass_threshold: default_pass_threshold(),
                scratch_size_mb: 256,
            },
        ];

        Self {
            configs: tracks.into_iter().map(|t| (t.track, t)).collect(),
            data: DataConfig::default(),
            cloud: CloudConfig::default(),
        }
    }

    /// Get configuration for a specific track
    pub fn get_config(&self, track: Track) -> Result<&TrackConfig> {
        self.configs
            .get(&track)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for track: {}", track))
    }

    pub fn data(&self) -> &DataConfig {
        &self.data
    }

    pub fn cloud(&self) -> &CloudConfig {
        &self.cloud
    }

    /// List all configured tracks
    pub fn list_tracks(&self) -> Vec<Track> {
        let mut tracks: Vec<Track> = self.configs.keys().copied().collect();
        tracks.sort_by_key(|t| t.to_string());
        tracks
    }
}

/// Process-level worker settings read from the environment
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub status_addr: String,
    pub max_concurrent_runs: usize,
    pub pull_missing_images: bool,
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        Self {
            status_addr: std::env::var("STATUS_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:9100".to_string()),
            max_concurrent_runs: std::env::var("MAX_CONCURRENT_RUNS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(4),
            pull_missing_images: std::env::var("PULL_MISSING_IMAGES")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }
}
