//! Configuration surface
//!
//! The options the core consumes, loadable from a YAML file in the app
//! directory (`~/.pixly/config.yaml`). The interactive front-end owns flags
//! and environment plumbing; this module only defines the shape, defaults,
//! and file loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const APP_DIR_NAME: &str = ".pixly";
pub const KNOWLEDGE_DB_FILE: &str = "knowledge.db";
pub const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMode {
    #[serde(rename = "auto+")]
    AutoPlus,
    Auto,
    Quality,
    Emoji,
    Smart,
    Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub conversion: ConversionConfig,
    pub concurrency: ConcurrencyConfig,
    pub output: OutputConfig,
    pub resume: ResumeConfig,
    pub security: SecurityConfig,
    pub advanced: AdvancedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub default_mode: ConversionMode,
    pub predictor: PredictorConfig,
    pub formats: FormatDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub enable_knowledge_base: bool,
    /// Predictions at or above this confidence skip exploration.
    pub confidence_threshold: f64,
    pub enable_exploration: bool,
    /// Candidate sets tried per exploration, clamped to 2..=3.
    pub exploration_candidates: usize,
}

/// Per-format encoder defaults. A zero effort/speed means "use the rule".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatDefaults {
    pub jxl_effort: u8,
    pub avif_crf: u8,
    pub avif_speed: u8,
    pub webp_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// 0 = derive from CPU count.
    pub conversion_workers: usize,
    pub scan_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub keep_original: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    pub enable: bool,
    /// Persist the resume point every N processed files.
    pub save_interval: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Files larger than this are skipped. 0 disables the guard.
    pub max_file_size_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub magic_byte_check: bool,
    /// Outputs larger than `max_size_ratio * original` are rejected.
    pub max_size_ratio: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conversion: ConversionConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            output: OutputConfig::default(),
            resume: ResumeConfig::default(),
            security: SecurityConfig::default(),
            advanced: AdvancedConfig::default(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            default_mode: ConversionMode::AutoPlus,
            predictor: PredictorConfig::default(),
            formats: FormatDefaults::default(),
        }
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            enable_knowledge_base: true,
            confidence_threshold: 0.7,
            enable_exploration: true,
            exploration_candidates: 3,
        }
    }
}

impl Default for FormatDefaults {
    fn default() -> Self {
        Self {
            jxl_effort: 0,
            avif_crf: 0,
            avif_speed: 0,
            webp_quality: 0,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            conversion_workers: 0,
            scan_workers: 0,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { keep_original: false }
    }
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            enable: true,
            save_interval: 10,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { max_file_size_mb: 0 }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            validation: ValidationConfig::default(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            magic_byte_check: true,
            max_size_ratio: 10.0,
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.as_ref().display()))?;
        Ok(config)
    }

    /// Load `~/.pixly/config.yaml` if present, defaults otherwise.
    pub fn load_default() -> Self {
        let path = app_dir().join(CONFIG_FILE);
        if path.exists() {
            match Self::load_from_file(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("ignoring unreadable config {}: {:#}", path.display(), e);
                }
            }
        }
        Self::default()
    }

    /// Effective worker count for the conversion pool: configured value, or
    /// `min(8, 2 * cpus)` when set to auto.
    pub fn effective_workers(&self) -> usize {
        if self.concurrency.conversion_workers > 0 {
            self.concurrency.conversion_workers
        } else {
            (num_cpus::get() * 2).clamp(1, 8)
        }
    }

    /// Exploration candidate cap, clamped to the supported 2..=3 range.
    pub fn exploration_candidates(&self) -> usize {
        self.conversion.predictor.exploration_candidates.clamp(2, 3)
    }
}

/// User-local application directory (`~/.pixly`), created on first use.
pub fn app_dir() -> PathBuf {
    let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join(APP_DIR_NAME);
    let _ = fs::create_dir_all(&dir);
    dir
}

/// Default knowledge database path (`~/.pixly/knowledge.db`).
pub fn default_knowledge_path() -> PathBuf {
    app_dir().join(KNOWLEDGE_DB_FILE)
}
