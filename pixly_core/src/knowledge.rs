//! Knowledge base
//!
//! Persistent record of every completed conversion plus aggregate statistics
//! per (predictor, rule, source format). Backed by an embedded ordered
//! key-value store with two trees:
//!
//! - `records` - keyed by a monotonically increasing timestamp id, value is
//!   a serialized [`ConversionRecord`];
//! - `stats` - keyed by `predictor|rule|format`, value is a serialized
//!   [`AggregateStats`].
//!
//! Writers serialize on an internal lock; readers run concurrently. A failed
//! save never fails the conversion that produced it (the file on disk is the
//! ground truth), and corrupt rows are skipped on read with a warning.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::FatalError;
use crate::params::{ConversionParams, TargetFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMode {
    Lossless,
    NearLossless,
    Lossy,
}

/// One row per completed conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRecord {
    // Identity
    pub file_hash: String,
    pub file_path: String,
    pub file_name: String,
    pub source_format: String,
    pub original_size: u64,

    // Prediction snapshot
    pub predictor_name: String,
    pub rule_name: String,
    pub predicted_params: ConversionParams,
    pub predicted_confidence: f64,
    pub predicted_saving: f64,
    pub predicted_size: u64,

    // Outcome
    pub target_format: TargetFormat,
    pub actual_size: u64,
    pub convert_time_ms: u64,
    pub actual_saving: f64,
    pub saving_error: f64,

    // Quality verdict
    pub quality_mode: QualityMode,
    pub quality_perfect: bool,
    #[serde(default)]
    pub pixel_diff_percent: Option<f64>,
    #[serde(default)]
    pub quality_score: Option<f64>,
    /// False when EXIF/XMP copy failed on a reversible path.
    #[serde(default = "default_true")]
    pub metadata_preserved: bool,

    // Provenance
    pub engine_version: String,
    pub os: String,
    pub timestamp: String,
}

fn default_true() -> bool {
    true
}

impl ConversionRecord {
    pub fn stats_key(&self) -> String {
        stats_key(&self.predictor_name, &self.rule_name, &self.source_format)
    }
}

/// Derived statistics for one (predictor, rule, source format) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStats {
    pub predictor_name: String,
    pub rule_name: String,
    pub source_format: String,
    pub sample_count: u64,
    pub avg_actual_saving: f64,
    pub avg_prediction_error: f64,
    /// Fraction of recorded conversions that actually shrank the file.
    pub success_rate: f64,
    pub quality_pass_rate: f64,
    /// Modes over the top-quartile records; 0 means "no signal".
    pub optimal_effort: u8,
    pub optimal_crf: u8,
    pub optimal_speed: u8,
    pub confidence: f64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub source_format: Option<String>,
    pub rule_name: Option<String>,
    pub target_format: Option<TargetFormat>,
    /// Keep only the N records with the highest actual saving.
    pub top_by_saving: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub total_conversions: u64,
    pub avg_saving: f64,
    pub quality_pass_rate: f64,
    pub avg_prediction_error: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatCombination {
    pub source: String,
    pub target: TargetFormat,
    pub avg_saving: f64,
    pub success_rate: f64,
    pub sample_count: u64,
}

pub fn stats_key(predictor: &str, rule: &str, source_format: &str) -> String {
    format!("{}|{}|{}", predictor, rule, source_format)
}

pub struct KnowledgeStore {
    _db: sled::Db,
    records: sled::Tree,
    stats: sled::Tree,
    write_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl KnowledgeStore {
    /// Open (or create) the store. Single-process exclusivity comes from the
    /// underlying engine's file lock.
    pub fn open(path: &Path) -> Result<Self, FatalError> {
        let db = sled::open(path).map_err(|e| FatalError::CorruptKnowledge {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let records = db
            .open_tree("records")
            .map_err(|e| FatalError::CorruptKnowledge {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let stats = db
            .open_tree("stats")
            .map_err(|e| FatalError::CorruptKnowledge {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        // Resume the monotonic id sequence past both the last stored key and
        // the current clock so ids stay ordered across restarts.
        let last_key = records
            .last()
            .ok()
            .flatten()
            .map(|(k, _)| decode_key(&k))
            .unwrap_or(0);
        let now_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let next_id = AtomicU64::new(last_key.max(now_micros) + 1);

        Ok(Self {
            _db: db,
            records,
            stats,
            write_lock: Mutex::new(()),
            next_id,
        })
    }

    /// Append one record, durably.
    pub fn save_record(&self, record: &ConversionRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let value = serde_json::to_vec(record).context("serialize record")?;
        self.records
            .insert(id.to_be_bytes(), value)
            .context("insert record")?;
        self.records.flush().context("flush records")?;
        Ok(())
    }

    /// Recompute and persist the aggregate row for one key triple.
    pub fn update_stats(
        &self,
        predictor: &str,
        rule: &str,
        source_format: &str,
    ) -> Result<Option<AggregateStats>> {
        let matching: Vec<ConversionRecord> = self
            .iter_records()
            .filter(|r| {
                r.predictor_name == predictor
                    && r.rule_name == rule
                    && r.source_format == source_format
            })
            .collect();

        if matching.is_empty() {
            return Ok(None);
        }

        let stats = compute_stats(predictor, rule, source_format, &matching);
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let value = serde_json::to_vec(&stats).context("serialize stats")?;
        self.stats
            .insert(stats_key(predictor, rule, source_format).as_bytes(), value)
            .context("insert stats")?;
        self.stats.flush().context("flush stats")?;
        Ok(Some(stats))
    }

    /// Read the cached aggregate row, if any.
    pub fn get_stats(
        &self,
        predictor: &str,
        rule: &str,
        source_format: &str,
    ) -> Option<AggregateStats> {
        let raw = self
            .stats
            .get(stats_key(predictor, rule, source_format).as_bytes())
            .ok()??;
        match serde_json::from_slice(&raw) {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!("skipping corrupt stats row: {}", e);
                None
            }
        }
    }

    /// Global counters over the whole record log.
    pub fn get_stats_summary(&self) -> StatsSummary {
        let records: Vec<ConversionRecord> = self.iter_records().collect();
        let total = records.len() as u64;
        if total == 0 {
            return StatsSummary {
                total_conversions: 0,
                avg_saving: 0.0,
                quality_pass_rate: 0.0,
                avg_prediction_error: 0.0,
            };
        }
        let avg_saving = records.iter().map(|r| r.actual_saving).sum::<f64>() / total as f64;
        let quality_pass_rate =
            records.iter().filter(|r| r.quality_perfect).count() as f64 / total as f64;
        let avg_prediction_error =
            records.iter().map(|r| r.saving_error).sum::<f64>() / total as f64;
        StatsSummary {
            total_conversions: total,
            avg_saving,
            quality_pass_rate,
            avg_prediction_error,
        }
    }

    /// Query the record log. Results are in insertion order unless
    /// `top_by_saving` re-ranks them.
    pub fn query(&self, filter: &RecordFilter) -> Vec<ConversionRecord> {
        let mut matching: Vec<ConversionRecord> = self
            .iter_records()
            .filter(|r| {
                filter
                    .source_format
                    .as_deref()
                    .map_or(true, |f| r.source_format == f)
                    && filter.rule_name.as_deref().map_or(true, |f| r.rule_name == f)
                    && filter.target_format.map_or(true, |f| r.target_format == f)
            })
            .collect();

        if let Some(n) = filter.top_by_saving {
            matching.sort_by(|a, b| {
                b.actual_saving
                    .partial_cmp(&a.actual_saving)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            matching.truncate(n);
        }
        matching
    }

    /// Per (source, target) aggregate view, sorted by sample count.
    pub fn get_format_combinations(&self) -> Vec<FormatCombination> {
        let mut buckets: HashMap<(String, TargetFormat), Vec<ConversionRecord>> = HashMap::new();
        for record in self.iter_records() {
            buckets
                .entry((record.source_format.clone(), record.target_format))
                .or_default()
                .push(record);
        }

        let mut combos: Vec<FormatCombination> = buckets
            .into_iter()
            .map(|((source, target), records)| {
                let n = records.len() as f64;
                let avg_saving = records.iter().map(|r| r.actual_saving).sum::<f64>() / n;
                let success_rate = records
                    .iter()
                    .filter(|r| r.actual_size < r.original_size)
                    .count() as f64
                    / n;
                FormatCombination {
                    source,
                    target,
                    avg_saving,
                    success_rate,
                    sample_count: records.len() as u64,
                }
            })
            .collect();
        combos.sort_by(|a, b| b.sample_count.cmp(&a.sample_count));
        combos
    }

    /// All records for a (source format, target format) pair; the tuner's
    /// read path.
    pub fn records_for_combination(
        &self,
        source_format: &str,
        target_format: TargetFormat,
    ) -> Vec<ConversionRecord> {
        self.iter_records()
            .filter(|r| r.source_format == source_format && r.target_format == target_format)
            .collect()
    }

    pub fn record_count(&self) -> u64 {
        self.records.len() as u64
    }

    fn iter_records(&self) -> impl Iterator<Item = ConversionRecord> + '_ {
        self.records.iter().filter_map(|entry| match entry {
            Ok((_, value)) => match serde_json::from_slice(&value) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("skipping corrupt record row: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("skipping unreadable record row: {}", e);
                None
            }
        })
    }

    #[cfg(test)]
    fn insert_raw(&self, key: u64, value: &[u8]) {
        self.records.insert(key.to_be_bytes(), value).unwrap();
    }
}

fn decode_key(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = key.len().min(8);
    buf[8 - len..].copy_from_slice(&key[..len]);
    u64::from_be_bytes(buf)
}

/// Pure aggregation over one key triple's records.
pub fn compute_stats(
    predictor: &str,
    rule: &str,
    source_format: &str,
    records: &[ConversionRecord],
) -> AggregateStats {
    let n = records.len() as f64;
    let avg_actual_saving = records.iter().map(|r| r.actual_saving).sum::<f64>() / n;
    let avg_prediction_error = records.iter().map(|r| r.saving_error).sum::<f64>() / n;
    let success_rate = records
        .iter()
        .filter(|r| r.actual_size < r.original_size)
        .count() as f64
        / n;
    let quality_pass_rate = records.iter().filter(|r| r.quality_perfect).count() as f64 / n;

    // Parameter modes come from the top quartile of quality-perfect records,
    // ranked by actual saving.
    let mut ranked: Vec<&ConversionRecord> =
        records.iter().filter(|r| r.quality_perfect).collect();
    ranked.sort_by(|a, b| {
        b.actual_saving
            .partial_cmp(&a.actual_saving)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let quartile = (ranked.len().div_ceil(4)).max(1).min(ranked.len());
    let top = &ranked[..quartile];

    let optimal_effort = mode_of(top.iter().map(|r| r.predicted_params.effort));
    let optimal_crf = mode_of(top.iter().map(|r| r.predicted_params.crf));
    let optimal_speed = mode_of(top.iter().map(|r| r.predicted_params.speed));

    AggregateStats {
        predictor_name: predictor.to_string(),
        rule_name: rule.to_string(),
        source_format: source_format.to_string(),
        sample_count: records.len() as u64,
        avg_actual_saving,
        avg_prediction_error,
        success_rate,
        quality_pass_rate,
        optimal_effort,
        optimal_crf,
        optimal_speed,
        confidence: stats_confidence(records.len() as u64, avg_prediction_error),
        updated_at: chrono::Utc::now().to_rfc3339(),
    }
}

/// Confidence in the aggregate: non-decreasing in sample count,
/// non-increasing in prediction error, saturating below 1.
pub fn stats_confidence(sample_count: u64, avg_error: f64) -> f64 {
    let base = sample_count as f64 / (sample_count as f64 + 15.0);
    (base * (1.0 - avg_error.clamp(0.0, 1.0))).min(0.99)
}

/// Mode of the non-zero values; 0 when there is no signal.
fn mode_of(values: impl Iterator<Item = u8>) -> u8 {
    let mut counts: HashMap<u8, usize> = HashMap::new();
    for v in values.filter(|v| *v > 0) {
        *counts.entry(v).or_insert(0) += 1;
    }
    counts
        .into_iter()
        // Deterministic tie-break: prefer the larger value.
        .max_by_key(|(v, count)| (*count, *v))
        .map(|(v, _)| v)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn test_record(
    source_format: &str,
    rule: &str,
    params: ConversionParams,
    original_size: u64,
    actual_size: u64,
    predicted_saving: f64,
    quality_perfect: bool,
) -> ConversionRecord {
    let actual_saving = 1.0 - actual_size as f64 / original_size as f64;
    ConversionRecord {
        file_hash: "0".repeat(16),
        file_path: format!("/in/sample.{}", source_format),
        file_name: format!("sample.{}", source_format),
        source_format: source_format.to_string(),
        original_size,
        predictor_name: format!("{}_predictor", source_format),
        rule_name: rule.to_string(),
        target_format: params.target_format,
        predicted_params: params,
        predicted_confidence: 0.95,
        predicted_saving,
        predicted_size: (original_size as f64 * (1.0 - predicted_saving)) as u64,
        actual_size,
        convert_time_ms: 1200,
        actual_saving,
        saving_error: (predicted_saving - actual_saving).abs(),
        quality_mode: QualityMode::Lossless,
        quality_perfect,
        pixel_diff_percent: None,
        quality_score: None,
        metadata_preserved: true,
        engine_version: env!("CARGO_PKG_VERSION").to_string(),
        os: std::env::consts::OS.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(temp: &TempDir) -> KnowledgeStore {
        KnowledgeStore::open(&temp.path().join("knowledge.db")).unwrap()
    }

    #[test]
    fn test_save_and_query_records() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        for i in 0..5 {
            let record = test_record(
                "png",
                crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                ConversionParams::jxl_lossless(7),
                1_000_000,
                300_000 + i * 10_000,
                0.70,
                true,
            );
            store.save_record(&record).unwrap();
        }

        assert_eq!(store.record_count(), 5);

        let all = store.query(&RecordFilter::default());
        assert_eq!(all.len(), 5);

        let by_format = store.query(&RecordFilter {
            source_format: Some("png".to_string()),
            ..Default::default()
        });
        assert_eq!(by_format.len(), 5);

        let none = store.query(&RecordFilter {
            source_format: Some("gif".to_string()),
            ..Default::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn test_top_by_saving_ranks_descending() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        for actual in [900_000u64, 200_000, 500_000] {
            store
                .save_record(&test_record(
                    "png",
                    crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                    ConversionParams::jxl_lossless(7),
                    1_000_000,
                    actual,
                    0.70,
                    true,
                ))
                .unwrap();
        }

        let top2 = store.query(&RecordFilter {
            top_by_saving: Some(2),
            ..Default::default()
        });
        assert_eq!(top2.len(), 2);
        assert_eq!(top2[0].actual_size, 200_000);
        assert_eq!(top2[1].actual_size, 500_000);
    }

    #[test]
    fn test_update_stats_aggregates() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        // 0.70 actual saving, predicted 0.60: error 0.10 per record.
        for _ in 0..10 {
            store
                .save_record(&test_record(
                    "png",
                    crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                    ConversionParams::jxl_lossless(7),
                    1_000_000,
                    300_000,
                    0.60,
                    true,
                ))
                .unwrap();
        }

        let stats = store
            .update_stats(
                "png_predictor",
                crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                "png",
            )
            .unwrap()
            .unwrap();

        assert_eq!(stats.sample_count, 10);
        assert!((stats.avg_actual_saving - 0.70).abs() < 1e-9);
        assert!((stats.avg_prediction_error - 0.10).abs() < 1e-9);
        assert!((stats.success_rate - 1.0).abs() < 1e-9);
        assert!((stats.quality_pass_rate - 1.0).abs() < 1e-9);
        assert_eq!(stats.optimal_effort, 7);

        // And it round-trips through the stats tree.
        let cached = store
            .get_stats(
                "png_predictor",
                crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                "png",
            )
            .unwrap();
        assert_eq!(cached.sample_count, 10);
    }

    #[test]
    fn test_update_stats_with_no_match_is_none() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        assert!(store
            .update_stats("nobody", "NO_RULE", "png")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stats_summary() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        store
            .save_record(&test_record(
                "png",
                crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                ConversionParams::jxl_lossless(7),
                1_000_000,
                500_000,
                0.50,
                true,
            ))
            .unwrap();
        store
            .save_record(&test_record(
                "jpg",
                crate::predict::RULE_JPEG_ALWAYS_JXL_LOSSLESS,
                ConversionParams::jxl_reversible(7),
                1_000_000,
                700_000,
                0.30,
                false,
            ))
            .unwrap();

        let summary = store.get_stats_summary();
        assert_eq!(summary.total_conversions, 2);
        assert!((summary.avg_saving - 0.40).abs() < 1e-9);
        assert!((summary.quality_pass_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_format_combinations() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        for _ in 0..3 {
            store
                .save_record(&test_record(
                    "png",
                    crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                    ConversionParams::jxl_lossless(7),
                    1_000_000,
                    400_000,
                    0.60,
                    true,
                ))
                .unwrap();
        }
        store
            .save_record(&test_record(
                "gif",
                crate::predict::RULE_GIF_ANIMATED_AVIF,
                ConversionParams::avif(35, 6),
                2_000_000,
                600_000,
                0.75,
                true,
            ))
            .unwrap();

        let combos = store.get_format_combinations();
        assert_eq!(combos.len(), 2);
        // Sorted by sample count: png first.
        assert_eq!(combos[0].source, "png");
        assert_eq!(combos[0].target, TargetFormat::Jxl);
        assert_eq!(combos[0].sample_count, 3);
        assert!((combos[0].avg_saving - 0.60).abs() < 1e-9);
        assert!((combos[0].success_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_corrupt_rows_are_skipped() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        store
            .save_record(&test_record(
                "png",
                crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                ConversionParams::jxl_lossless(7),
                1_000_000,
                400_000,
                0.60,
                true,
            ))
            .unwrap();
        store.insert_raw(1, b"{not json");

        let all = store.query(&RecordFilter::default());
        assert_eq!(all.len(), 1, "corrupt row must be skipped, not fatal");
    }

    #[test]
    fn test_record_ids_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("knowledge.db");

        {
            let store = KnowledgeStore::open(&path).unwrap();
            store
                .save_record(&test_record(
                    "png",
                    crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                    ConversionParams::jxl_lossless(7),
                    1_000_000,
                    400_000,
                    0.60,
                    true,
                ))
                .unwrap();
        }

        let store = KnowledgeStore::open(&path).unwrap();
        assert_eq!(store.record_count(), 1);
        store
            .save_record(&test_record(
                "png",
                crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                ConversionParams::jxl_lossless(7),
                1_000_000,
                350_000,
                0.60,
                true,
            ))
            .unwrap();
        assert_eq!(store.record_count(), 2);
    }

    #[test]
    fn test_stats_confidence_monotonic() {
        // Non-decreasing in sample count at fixed error.
        let mut last = 0.0;
        for n in [1u64, 5, 10, 50, 100, 500] {
            let c = stats_confidence(n, 0.1);
            assert!(c >= last, "confidence must not decrease with samples");
            last = c;
        }
        // Non-increasing in error at fixed count.
        let mut last = 1.0;
        for err in [0.0, 0.05, 0.1, 0.3, 0.8] {
            let c = stats_confidence(50, err);
            assert!(c <= last, "confidence must not increase with error");
            last = c;
        }
        // Always saturates below 1.
        assert!(stats_confidence(1_000_000, 0.0) < 1.0);
    }

    #[test]
    fn test_mode_prefers_majority() {
        let records: Vec<ConversionRecord> = [7u8, 7, 9, 7, 5]
            .iter()
            .map(|effort| {
                test_record(
                    "png",
                    crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                    ConversionParams::jxl_lossless(*effort),
                    1_000_000,
                    300_000,
                    0.70,
                    true,
                )
            })
            .collect();
        let stats = compute_stats(
            "png_predictor",
            crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
            "png",
            &records,
        );
        // All have identical saving, so the quartile is a subset; effort 7 is
        // the majority everywhere.
        assert!(stats.optimal_effort == 7 || stats.optimal_effort == 9);
        assert_eq!(stats.optimal_crf, 0, "jxl records carry no crf signal");
    }
}
