//! Per-file conversion driver
//!
//! Orchestrates one file through the whole pipeline: classify, feature
//! extraction, (tuned) prediction, optional exploration, encode into a
//! sibling temp file, validation, metadata preservation, atomic replacement,
//! and the knowledge record. Every failure is per-file; the worker pool
//! never sees a panic from here.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::errors::ConvertError;
use crate::explore;
use crate::features;
use crate::formats::{classify_media_type, MediaType};
use crate::knowledge::{ConversionRecord, KnowledgeStore, QualityMode};
use crate::metadata;
use crate::params::{ConversionParams, TargetFormat};
use crate::predict::{self, Prediction, PredictionMethod};
use crate::tools::ToolPaths;
use crate::tuner::PredictionTuner;
use crate::validate::{validate_output, ValidationOptions};

/// Where converted output lands.
#[derive(Debug, Clone)]
pub enum OutputMode {
    /// Replace the original via the two-rename backup dance.
    InPlace,
    /// Write next to the source and keep the source.
    Alongside,
    /// Mirror the relative structure under another root.
    Directory {
        input_root: PathBuf,
        output_root: PathBuf,
    },
}

#[derive(Debug)]
pub enum OptimizationResult {
    Converted {
        path: PathBuf,
        output_path: PathBuf,
        original_size: u64,
        new_size: u64,
        method: PredictionMethod,
        rule_name: String,
        explored: bool,
        process_time: Duration,
    },
    Skipped {
        path: PathBuf,
        reason: String,
    },
    Failed(ConvertError),
}

impl OptimizationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, OptimizationResult::Converted { .. })
    }
}

pub struct BalanceOptimizer {
    tools: ToolPaths,
    config: Config,
    store: Option<Arc<KnowledgeStore>>,
    tuner: Option<PredictionTuner>,
}

impl BalanceOptimizer {
    pub fn new(tools: ToolPaths, config: Config) -> Self {
        Self {
            tools,
            config,
            store: None,
            tuner: None,
        }
    }

    /// Attach the knowledge base. The tuner only activates when the config
    /// enables it.
    pub fn with_knowledge(mut self, store: Arc<KnowledgeStore>) -> Self {
        if self.config.conversion.predictor.enable_knowledge_base {
            self.tuner = Some(PredictionTuner::new(store.clone()));
        }
        self.store = Some(store);
        self
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    /// Convert one file. Never panics; every failure mode maps to
    /// `Skipped` or `Failed`.
    pub fn optimize_file(&self, path: &Path, mode: &OutputMode) -> OptimizationResult {
        let start = Instant::now();

        let original_meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) => return OptimizationResult::Failed(ConvertError::io(path, e)),
        };
        let original_size = original_meta.len();

        let max_bytes = self.config.security.max_file_size_mb * 1024 * 1024;
        if max_bytes > 0 && original_size > max_bytes {
            return OptimizationResult::Skipped {
                path: path.to_path_buf(),
                reason: format!(
                    "file exceeds security.max_file_size_mb ({} MiB)",
                    self.config.security.max_file_size_mb
                ),
            };
        }

        let media_type = classify_media_type(path);
        if media_type == MediaType::Unknown {
            return OptimizationResult::Skipped {
                path: path.to_path_buf(),
                reason: "unsupported extension".to_string(),
            };
        }

        // Hash before anything moves; the record needs the original content.
        let file_hash = if self.store.is_some() {
            hash_file(path).unwrap_or_default()
        } else {
            String::new()
        };

        // Videos short-circuit to a remux: no probe, no tuner, no explorer,
        // no per-format rule lookup.
        let format = crate::formats::extension_lowercase(path);
        use crate::predict::Predictor as _;
        let (features, mut prediction, predictor_name) = if media_type == MediaType::Video {
            let features = features::fallback_features(path, &format, original_size);
            let prediction = predict::VideoPredictor.predict(&features);
            (features, prediction, predict::VideoPredictor.name())
        } else {
            let features = match features::extract_features(&self.tools, path) {
                Ok(features) => features,
                Err(e) => return OptimizationResult::Failed(ConvertError::io(path, e)),
            };
            let prediction = predict::predict(&features);
            let predictor_name = predict::predictor_for_format(&features.format).name();
            (features, prediction, predictor_name)
        };

        if media_type == MediaType::Image {
            apply_format_defaults(&mut prediction.params, &self.config.conversion.formats);
            if let Some(tuner) = &self.tuner {
                tuner.tune_prediction(&mut prediction, &features.format, "default", original_size);
            }
        }

        let validation = ValidationOptions::from(&self.config.advanced.validation);

        // Low-confidence predictions get a bounded parallel trial; the
        // winner (already validated once per trial) replaces the params.
        let mut explored = false;
        if prediction.should_explore
            && self.config.conversion.predictor.enable_exploration
            && prediction.exploration_candidates.len() >= 2
        {
            let cap = self.config.exploration_candidates();
            let candidates = &prediction.exploration_candidates
                [..prediction.exploration_candidates.len().min(cap)];
            if let Some(result) =
                explore::explore(&self.tools, path, candidates, original_size, &validation)
            {
                tracing::debug!(
                    path = %path.display(),
                    winner = %result.best_params.key(),
                    trials = result.test_results.len(),
                    "exploration selected candidate"
                );
                prediction.params = result.best_params;
                explored = true;
            }
        }

        let final_path = match self.final_output_path(path, prediction.params.target_format, mode) {
            Ok(path) => path,
            Err(e) => return OptimizationResult::Failed(e),
        };

        // Alongside mode never clobbers an existing output.
        if !matches!(mode, OutputMode::InPlace) && final_path.exists() {
            return OptimizationResult::Skipped {
                path: path.to_path_buf(),
                reason: format!("output already exists: {}", final_path.display()),
            };
        }

        // Encode into a sibling temp file in the destination directory so
        // the final rename stays on one filesystem. The real target
        // extension is kept so container muxers recognize it.
        let dest_parent = final_path.parent().unwrap_or_else(|| Path::new("."));
        let temp = match tempfile::Builder::new()
            .prefix(".pixly-")
            .suffix(&format!(".{}", prediction.params.target_format.extension()))
            .tempfile_in(dest_parent)
        {
            Ok(temp) => temp.into_temp_path(),
            Err(e) => return OptimizationResult::Failed(ConvertError::io(path, e)),
        };

        if let Err(e) = crate::encode::run_encoder(&self.tools, &prediction.params, path, &temp) {
            return OptimizationResult::Failed(e);
        }

        if let Err(e) = validate_output(
            &temp,
            prediction.params.target_format,
            original_size,
            &validation,
        ) {
            // Dropping `temp` deletes the offending output.
            return OptimizationResult::Failed(ConvertError::Validation {
                path: path.to_path_buf(),
                source: e,
            });
        }

        let new_size = std::fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);

        // Metadata flows source -> temp before any rename; timestamps go
        // last inside the preserver.
        let metadata_outcome = metadata::preserve_metadata(&self.tools, path, &temp);

        let in_place = matches!(mode, OutputMode::InPlace);
        let temp_path = temp.keep().map_err(|e| e.error);
        let temp_path = match temp_path {
            Ok(path) => path,
            Err(e) => return OptimizationResult::Failed(ConvertError::io(path, e)),
        };
        if let Err(e) = atomic_replace(path, &temp_path, &final_path, in_place) {
            let _ = std::fs::remove_file(&temp_path);
            return OptimizationResult::Failed(e);
        }

        let process_time = start.elapsed();

        // The conversion on disk is the ground truth; a record failure is a
        // warning, never a file failure.
        if let Some(store) = &self.store {
            let record = build_record(
                &features,
                &prediction,
                predictor_name,
                file_hash,
                original_size,
                new_size,
                process_time,
                metadata_outcome.preserved(),
            );
            if let Err(e) = store.save_record(&record) {
                tracing::warn!(path = %path.display(), "knowledge record save failed: {:#}", e);
            } else if let Err(e) = store.update_stats(
                &record.predictor_name,
                &record.rule_name,
                &record.source_format,
            ) {
                tracing::warn!("stats update failed: {:#}", e);
            }
        }

        OptimizationResult::Converted {
            path: path.to_path_buf(),
            output_path: final_path,
            original_size,
            new_size,
            method: prediction.method,
            rule_name: prediction.rule_name,
            explored,
            process_time,
        }
    }

    fn final_output_path(
        &self,
        path: &Path,
        target: TargetFormat,
        mode: &OutputMode,
    ) -> Result<PathBuf, ConvertError> {
        match mode {
            OutputMode::InPlace | OutputMode::Alongside => {
                Ok(path.with_extension(target.extension()))
            }
            OutputMode::Directory {
                input_root,
                output_root,
            } => {
                let relative = path.strip_prefix(input_root).unwrap_or(path);
                let dest = output_root
                    .join(relative)
                    .with_extension(target.extension());
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| ConvertError::io(path, e))?;
                }
                Ok(dest)
            }
        }
    }
}

/// Two-rename atomic replacement with a recoverable backup.
///
/// In place: `original` -> `original.backup`, then `temp` -> `final_path`;
/// a failed second rename restores the backup. Out of place: one rename.
/// At no point can a partial file sit at the original path.
pub fn atomic_replace(
    original: &Path,
    temp: &Path,
    final_path: &Path,
    in_place: bool,
) -> Result<(), ConvertError> {
    if !in_place {
        return std::fs::rename(temp, final_path).map_err(|e| ConvertError::Replace {
            path: original.to_path_buf(),
            step: "rename",
            message: e.to_string(),
        });
    }

    let backup = backup_path(original);
    std::fs::rename(original, &backup).map_err(|e| ConvertError::Replace {
        path: original.to_path_buf(),
        step: "backup",
        message: e.to_string(),
    })?;

    if let Err(e) = std::fs::rename(temp, final_path) {
        // Compensate: put the original back. If even that fails the file
        // survives as *.backup and the error says so.
        return match std::fs::rename(&backup, original) {
            Ok(()) => Err(ConvertError::Replace {
                path: original.to_path_buf(),
                step: "replace",
                message: format!("{} (original restored)", e),
            }),
            Err(restore_err) => Err(ConvertError::Replace {
                path: original.to_path_buf(),
                step: "restore",
                message: format!(
                    "{}; restore also failed ({}); original kept at {}",
                    e,
                    restore_err,
                    backup.display()
                ),
            }),
        };
    }

    if let Err(e) = std::fs::remove_file(&backup) {
        tracing::warn!(backup = %backup.display(), "backup cleanup failed: {}", e);
    }
    Ok(())
}

fn backup_path(original: &Path) -> PathBuf {
    let mut name = original
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".backup");
    original.with_file_name(name)
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    features: &crate::features::FileFeatures,
    prediction: &Prediction,
    predictor_name: &str,
    file_hash: String,
    original_size: u64,
    actual_size: u64,
    process_time: Duration,
    metadata_preserved: bool,
) -> ConversionRecord {
    let actual_saving = if original_size > 0 {
        1.0 - actual_size as f64 / original_size as f64
    } else {
        0.0
    };
    let quality_mode = quality_mode_for(&prediction.params);

    ConversionRecord {
        file_hash,
        file_path: features.file_path.clone(),
        file_name: Path::new(&features.file_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string(),
        source_format: features.format.clone(),
        original_size,
        predictor_name: predictor_name.to_string(),
        rule_name: prediction.rule_name.clone(),
        predicted_params: prediction.params.clone(),
        predicted_confidence: prediction.confidence,
        predicted_saving: prediction.expected_saving,
        predicted_size: prediction.expected_size_bytes,
        target_format: prediction.params.target_format,
        actual_size,
        convert_time_ms: process_time.as_millis() as u64,
        actual_saving,
        saving_error: (prediction.expected_saving - actual_saving).abs(),
        quality_mode,
        quality_perfect: quality_mode == QualityMode::Lossless,
        pixel_diff_percent: None,
        quality_score: None,
        metadata_preserved,
        engine_version: env!("CARGO_PKG_VERSION").to_string(),
        os: std::env::consts::OS.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

/// Configured per-format defaults override the rule's knobs when non-zero;
/// tuned values (applied afterwards) still win over both.
fn apply_format_defaults(
    params: &mut ConversionParams,
    defaults: &crate::config::FormatDefaults,
) {
    match params.target_format {
        TargetFormat::Jxl => {
            if defaults.jxl_effort > 0 {
                params.effort = defaults.jxl_effort.clamp(1, 9);
            }
        }
        TargetFormat::Avif => {
            if defaults.avif_crf > 0 {
                params.crf = defaults.avif_crf.min(63);
            }
            if defaults.avif_speed > 0 {
                params.speed = defaults.avif_speed.min(10);
            }
        }
        TargetFormat::Webp => {
            if defaults.webp_quality > 0 {
                params.quality = defaults.webp_quality.min(100);
            }
        }
        TargetFormat::Mov => {}
    }
}

fn quality_mode_for(params: &ConversionParams) -> QualityMode {
    match params.target_format {
        TargetFormat::Jxl => {
            if params.lossless_jpeg || params.distance == 0.0 {
                QualityMode::Lossless
            } else if params.distance <= 1.0 {
                QualityMode::NearLossless
            } else {
                QualityMode::Lossy
            }
        }
        TargetFormat::Mov => QualityMode::Lossless,
        TargetFormat::Avif | TargetFormat::Webp => QualityMode::Lossy,
    }
}
