//! Knowledge-based prediction tuning
//!
//! Replaces rule-of-thumb expectations with empirical means once the record
//! log holds enough samples for a (source, target, goal) combination. The
//! tuner only reads the store; aggregates are cached in-memory with a TTL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::knowledge::{stats_confidence, ConversionRecord, KnowledgeStore};
use crate::params::TargetFormat;
use crate::predict::{Prediction, PredictionMethod};

/// Below this many matching records the rule-based prediction stands.
pub const MIN_SAMPLES: u64 = 10;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct TunedParams {
    pub source_format: String,
    pub target_format: TargetFormat,
    pub quality_goal: String,
    pub sample_count: u64,
    /// Mean actual saving over the matching records.
    pub optimal_saving: f64,
    pub avg_error: f64,
    pub optimal_effort: u8,
    pub optimal_crf: u8,
    pub optimal_speed: u8,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheSlot {
    value: Option<TunedParams>,
    inserted: Instant,
}

pub struct PredictionTuner {
    store: Arc<KnowledgeStore>,
    ttl: Duration,
    cache: Mutex<HashMap<(String, TargetFormat, String), CacheSlot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PredictionTuner {
    pub fn new(store: Arc<KnowledgeStore>) -> Self {
        Self::with_ttl(store, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<KnowledgeStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Empirical parameters for a combination, or `None` when fewer than
    /// [`MIN_SAMPLES`] records back it.
    pub fn get_tuned_params(
        &self,
        source_format: &str,
        target_format: TargetFormat,
        quality_goal: &str,
    ) -> Option<TunedParams> {
        let key = (
            source_format.to_string(),
            target_format,
            quality_goal.to_string(),
        );

        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = cache.get(&key) {
                if slot.inserted.elapsed() < self.ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return slot.value.clone();
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let records = self
            .store
            .records_for_combination(source_format, target_format);
        let value = aggregate_combination(source_format, target_format, quality_goal, &records);

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            key,
            CacheSlot {
                value: value.clone(),
                inserted: Instant::now(),
            },
        );
        value
    }

    /// Confidence a tuned aggregate must reach before it should replace rule
    /// defaults. Non-decreasing in sample count, saturating near 0.95 by
    /// about 100 samples.
    pub fn get_confidence_threshold(&self, sample_count: u64) -> f64 {
        confidence_threshold(sample_count)
    }

    /// Apply the integration rule: replace the prediction's numeric
    /// expectations (and non-zero parameters) with tuned values when a
    /// sufficiently-sampled aggregate exists.
    pub fn tune_prediction(
        &self,
        prediction: &mut Prediction,
        source_format: &str,
        quality_goal: &str,
        original_size: u64,
    ) {
        let Some(tuned) = self.get_tuned_params(
            source_format,
            prediction.params.target_format,
            quality_goal,
        ) else {
            return;
        };
        if tuned.sample_count < MIN_SAMPLES {
            return;
        }

        prediction.method = match prediction.method {
            PredictionMethod::ConservativeDefault | PredictionMethod::KnowledgeTuned => {
                PredictionMethod::KnowledgeTuned
            }
            _ => PredictionMethod::RuleBasedTuned,
        };
        if !prediction.rule_name.ends_with("_TUNED") {
            prediction.rule_name.push_str("_TUNED");
        }
        prediction.expected_saving = tuned.optimal_saving.clamp(0.0, 0.999);
        prediction.expected_size_bytes =
            (original_size as f64 * (1.0 - prediction.expected_saving)).round() as u64;
        prediction.confidence = tuned.confidence;

        if tuned.optimal_effort > 0 {
            prediction.params.effort = tuned.optimal_effort;
        }
        if tuned.optimal_crf > 0 {
            prediction.params.crf = tuned.optimal_crf;
        }
        if tuned.optimal_speed > 0 {
            prediction.params.speed = tuned.optimal_speed;
        }
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            entries: cache.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();
    }
}

pub fn confidence_threshold(sample_count: u64) -> f64 {
    let progress = (sample_count as f64 / 100.0).min(1.0);
    0.5 + 0.45 * progress
}

fn aggregate_combination(
    source_format: &str,
    target_format: TargetFormat,
    quality_goal: &str,
    records: &[ConversionRecord],
) -> Option<TunedParams> {
    if (records.len() as u64) < MIN_SAMPLES {
        return None;
    }

    let n = records.len() as f64;
    let optimal_saving = records.iter().map(|r| r.actual_saving).sum::<f64>() / n;
    let avg_error = records.iter().map(|r| r.saving_error).sum::<f64>() / n;

    let mut ranked: Vec<&ConversionRecord> =
        records.iter().filter(|r| r.quality_perfect).collect();
    ranked.sort_by(|a, b| {
        b.actual_saving
            .partial_cmp(&a.actual_saving)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let quartile = ranked.len().div_ceil(4).max(1).min(ranked.len().max(1));
    let top = &ranked[..quartile.min(ranked.len())];

    Some(TunedParams {
        source_format: source_format.to_string(),
        target_format,
        quality_goal: quality_goal.to_string(),
        sample_count: records.len() as u64,
        optimal_saving,
        avg_error,
        optimal_effort: mode_of(top.iter().map(|r| r.predicted_params.effort)),
        optimal_crf: mode_of(top.iter().map(|r| r.predicted_params.crf)),
        optimal_speed: mode_of(top.iter().map(|r| r.predicted_params.speed)),
        confidence: stats_confidence(records.len() as u64, avg_error),
    })
}

fn mode_of(values: impl Iterator<Item = u8>) -> u8 {
    let mut counts: HashMap<u8, usize> = HashMap::new();
    for v in values.filter(|v| *v > 0) {
        *counts.entry(v).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(v, count)| (*count, *v))
        .map(|(v, _)| v)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::test_record;
    use crate::params::ConversionParams;
    use tempfile::TempDir;

    fn store_with_png_records(
        temp: &TempDir,
        count: usize,
        actual_saving: f64,
        predicted_saving: f64,
    ) -> Arc<KnowledgeStore> {
        let store =
            Arc::new(KnowledgeStore::open(&temp.path().join("knowledge.db")).unwrap());
        let original = 1_000_000u64;
        let actual = (original as f64 * (1.0 - actual_saving)) as u64;
        for _ in 0..count {
            store
                .save_record(&test_record(
                    "png",
                    crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                    ConversionParams::jxl_lossless(7),
                    original,
                    actual,
                    predicted_saving,
                    true,
                ))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_below_min_samples_returns_none() {
        let temp = TempDir::new().unwrap();
        let store = store_with_png_records(&temp, 9, 0.67, 0.70);
        let tuner = PredictionTuner::new(store);
        assert!(tuner
            .get_tuned_params("png", TargetFormat::Jxl, "default")
            .is_none());
    }

    #[test]
    fn test_tuned_params_reflect_empirical_mean() {
        let temp = TempDir::new().unwrap();
        let store = store_with_png_records(&temp, 12, 0.67, 0.70);
        let tuner = PredictionTuner::new(store);

        let tuned = tuner
            .get_tuned_params("png", TargetFormat::Jxl, "default")
            .unwrap();
        assert_eq!(tuned.sample_count, 12);
        assert!(
            (tuned.optimal_saving - 0.67).abs() < 0.02,
            "optimal_saving {} not within 0.67 +/- 0.02",
            tuned.optimal_saving
        );
        assert_eq!(tuned.optimal_effort, 7);
        assert!(tuned.confidence > 0.0 && tuned.confidence < 1.0);
    }

    #[test]
    fn test_tuned_prediction_replacement() {
        let temp = TempDir::new().unwrap();
        let store = store_with_png_records(&temp, 15, 0.67, 0.70);
        let tuner = PredictionTuner::new(store);

        let features = crate::features::fallback_features(
            std::path::Path::new("/in/new.png"),
            "png",
            1_000_000,
        );
        let mut prediction = crate::predict::predict(&features);
        assert_eq!(prediction.method, PredictionMethod::RuleBased);

        tuner.tune_prediction(&mut prediction, "png", "default", 1_000_000);

        assert_eq!(prediction.method, PredictionMethod::RuleBasedTuned);
        assert!(prediction.rule_name.ends_with("_TUNED"));
        assert!(
            (prediction.expected_saving - 0.67).abs() < 0.02,
            "expected_saving {} should track the empirical mean",
            prediction.expected_saving
        );
        let expected_size = (1_000_000f64 * (1.0 - prediction.expected_saving)).round() as u64;
        assert_eq!(prediction.expected_size_bytes, expected_size);
        // The rule target never changes, only the numbers.
        assert_eq!(prediction.params.target_format, TargetFormat::Jxl);
        assert!(prediction.params.lossless);
    }

    #[test]
    fn test_custom_path_becomes_knowledge_tuned() {
        let temp = TempDir::new().unwrap();
        let store = store_with_png_records(&temp, 15, 0.67, 0.70);
        let tuner = PredictionTuner::new(store);

        let features = crate::features::fallback_features(
            std::path::Path::new("/in/new.png"),
            "png",
            1_000_000,
        );
        let custom = crate::predict::CustomTarget {
            source_format: "png".to_string(),
            target_format: TargetFormat::Jxl,
            quality_goal: 100,
        };
        let mut prediction = crate::predict::conservative_custom_prediction(&features, &custom);
        tuner.tune_prediction(&mut prediction, "png", "default", 1_000_000);
        assert_eq!(prediction.method, PredictionMethod::KnowledgeTuned);
    }

    #[test]
    fn test_confidence_monotone_in_agreeing_samples() {
        // P4: appending records that agree with the current mean never
        // lowers the returned confidence.
        let temp = TempDir::new().unwrap();
        let store =
            Arc::new(KnowledgeStore::open(&temp.path().join("knowledge.db")).unwrap());

        let mut last_confidence = 0.0f64;
        for batch in 0..5 {
            for _ in 0..5 {
                store
                    .save_record(&test_record(
                        "png",
                        crate::predict::RULE_PNG_ALWAYS_JXL_LOSSLESS,
                        ConversionParams::jxl_lossless(7),
                        1_000_000,
                        330_000,
                        0.67,
                        true,
                    ))
                    .unwrap();
            }
            // Fresh tuner per step: we are testing the aggregate, not the cache.
            let tuner = PredictionTuner::new(store.clone());
            if let Some(tuned) = tuner.get_tuned_params("png", TargetFormat::Jxl, "default") {
                assert!(
                    tuned.confidence >= last_confidence,
                    "confidence regressed at batch {}: {} < {}",
                    batch,
                    tuned.confidence,
                    last_confidence
                );
                last_confidence = tuned.confidence;
            }
        }
        assert!(last_confidence > 0.0);
    }

    #[test]
    fn test_confidence_threshold_curve() {
        let mut last = 0.0;
        for n in [0u64, 1, 10, 25, 50, 75, 100, 200] {
            let t = confidence_threshold(n);
            assert!(t >= last, "threshold must be non-decreasing");
            last = t;
        }
        assert!((confidence_threshold(100) - 0.95).abs() < 1e-9);
        assert!((confidence_threshold(10_000) - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_cache_hit_and_clear() {
        let temp = TempDir::new().unwrap();
        let store = store_with_png_records(&temp, 12, 0.67, 0.70);
        let tuner = PredictionTuner::new(store);

        let _ = tuner.get_tuned_params("png", TargetFormat::Jxl, "default");
        let _ = tuner.get_tuned_params("png", TargetFormat::Jxl, "default");
        let stats = tuner.get_cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);

        tuner.clear_cache();
        assert_eq!(tuner.get_cache_stats().entries, 0);
    }

    #[test]
    fn test_cache_ttl_expiry_forces_reaggregation() {
        let temp = TempDir::new().unwrap();
        let store = store_with_png_records(&temp, 12, 0.67, 0.70);
        let tuner = PredictionTuner::with_ttl(store, Duration::ZERO);

        let _ = tuner.get_tuned_params("png", TargetFormat::Jxl, "default");
        let _ = tuner.get_tuned_params("png", TargetFormat::Jxl, "default");
        let stats = tuner.get_cache_stats();
        assert_eq!(stats.misses, 2, "zero TTL must bypass the cache");
    }

    #[test]
    fn test_negative_result_is_cached() {
        let temp = TempDir::new().unwrap();
        let store = store_with_png_records(&temp, 3, 0.67, 0.70);
        let tuner = PredictionTuner::new(store);

        assert!(tuner
            .get_tuned_params("png", TargetFormat::Jxl, "default")
            .is_none());
        assert!(tuner
            .get_tuned_params("png", TargetFormat::Jxl, "default")
            .is_none());
        let stats = tuner.get_cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }
}
