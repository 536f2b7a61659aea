//! Rule-based format predictors
//!
//! A predictor is a stateless pure function from [`FileFeatures`] to a
//! [`Prediction`]. One specialized predictor per source format; selection is
//! by `features.format`. The per-format rules here are the hard contracts
//! the conversion pipeline is tested against; the knowledge tuner only
//! *replaces numbers* on top of them, never the target choice.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::features::FileFeatures;
use crate::params::{ConversionParams, TargetFormat};

pub const RULE_PNG_ALWAYS_JXL_LOSSLESS: &str = "PNG_ALWAYS_JXL_LOSSLESS";
pub const RULE_JPEG_ALWAYS_JXL_LOSSLESS: &str = "JPEG_ALWAYS_JXL_LOSSLESS";
pub const RULE_GIF_ANIMATED_AVIF: &str = "GIF_ANIMATED_AVIF";
pub const RULE_GIF_STATIC_JXL: &str = "GIF_STATIC_JXL";
pub const RULE_WEBP_ANIMATED_AVIF: &str = "WEBP_ANIMATED_AVIF";
pub const RULE_WEBP_STATIC_JXL: &str = "WEBP_STATIC_JXL";
pub const RULE_VIDEO_REMUX_MOV: &str = "VIDEO_REMUX_MOV";
pub const RULE_UNKNOWN_FORMAT_FALLBACK: &str = "UNKNOWN_FORMAT_FALLBACK";
pub const RULE_CUSTOM_TARGET: &str = "CUSTOM_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMethod {
    RuleBased,
    RuleBasedTuned,
    KnowledgeTuned,
    ConservativeDefault,
    DefaultFallback,
}

impl PredictionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionMethod::RuleBased => "rule_based",
            PredictionMethod::RuleBasedTuned => "rule_based_tuned",
            PredictionMethod::KnowledgeTuned => "knowledge_tuned",
            PredictionMethod::ConservativeDefault => "conservative_default",
            PredictionMethod::DefaultFallback => "default_fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub params: ConversionParams,
    /// 0..=1.
    pub confidence: f64,
    pub method: PredictionMethod,
    pub rule_name: String,
    /// Fraction of the original size expected to be saved, in [0, 1).
    pub expected_saving: f64,
    pub expected_size_bytes: u64,
    pub should_explore: bool,
    /// Non-empty (2..=3 entries) iff `should_explore`.
    pub exploration_candidates: Vec<ConversionParams>,
    #[serde(skip, default)]
    pub prediction_time: Duration,
}

impl Prediction {
    fn new(
        features: &FileFeatures,
        params: ConversionParams,
        confidence: f64,
        rule_name: &str,
        expected_saving: f64,
    ) -> Self {
        let expected_size_bytes =
            (features.file_size as f64 * (1.0 - expected_saving)).round().max(0.0) as u64;
        Self {
            params,
            confidence,
            method: PredictionMethod::RuleBased,
            rule_name: rule_name.to_string(),
            expected_saving,
            expected_size_bytes,
            should_explore: false,
            exploration_candidates: Vec::new(),
            prediction_time: Duration::ZERO,
        }
    }
}

/// A stateless per-format rule set.
pub trait Predictor: Send + Sync {
    fn name(&self) -> &'static str;
    fn predict(&self, features: &FileFeatures) -> Prediction;
}

/// JXL effort from the file-size curve. The cutoffs are fixed; only a
/// non-zero tuned `optimal_effort` overrides the result downstream.
pub fn effort_for_size(file_size: u64) -> u8 {
    const LARGE: u64 = 10 * 1024 * 1024;
    const SMALL: u64 = 100 * 1024;
    if file_size > LARGE {
        5
    } else if file_size < SMALL {
        9
    } else {
        7
    }
}

pub struct PngPredictor;

impl Predictor for PngPredictor {
    fn name(&self) -> &'static str {
        "png_predictor"
    }

    fn predict(&self, features: &FileFeatures) -> Prediction {
        let params = ConversionParams::jxl_lossless(effort_for_size(features.file_size));
        let bpp = features.bytes_per_pixel;
        let expected_saving = if features.has_alpha {
            if bpp < 0.5 {
                0.95
            } else if bpp > 3.0 {
                0.70
            } else {
                0.85
            }
        } else if bpp < 0.3 {
            0.90
        } else if bpp > 2.0 {
            0.60
        } else {
            0.75
        };
        Prediction::new(features, params, 0.95, RULE_PNG_ALWAYS_JXL_LOSSLESS, expected_saving)
    }
}

pub struct JpegPredictor;

impl Predictor for JpegPredictor {
    fn name(&self) -> &'static str {
        "jpeg_predictor"
    }

    fn predict(&self, features: &FileFeatures) -> Prediction {
        let params = ConversionParams::jxl_reversible(effort_for_size(features.file_size));
        let expected_saving = if features.pix_fmt.contains("444") {
            0.32
        } else if features.pix_fmt.contains("422") {
            0.23
        } else if features.pix_fmt.contains("420") {
            0.25
        } else {
            0.20
        };
        Prediction::new(features, params, 0.95, RULE_JPEG_ALWAYS_JXL_LOSSLESS, expected_saving)
    }
}

pub struct GifPredictor;

impl Predictor for GifPredictor {
    fn name(&self) -> &'static str {
        "gif_predictor"
    }

    fn predict(&self, features: &FileFeatures) -> Prediction {
        if features.is_animated && features.frame_count > 1 {
            let crf = if features.frame_count > 50 { 38 } else { 35 };
            Prediction::new(
                features,
                ConversionParams::avif(crf, 6),
                0.90,
                RULE_GIF_ANIMATED_AVIF,
                0.75,
            )
        } else {
            Prediction::new(
                features,
                ConversionParams::jxl_lossless(7),
                0.90,
                RULE_GIF_STATIC_JXL,
                0.60,
            )
        }
    }
}

pub struct WebpPredictor;

impl Predictor for WebpPredictor {
    fn name(&self) -> &'static str {
        "webp_predictor"
    }

    fn predict(&self, features: &FileFeatures) -> Prediction {
        if features.is_animated && features.frame_count > 1 {
            let crf = if features.frame_count > 50 { 38 } else { 35 };
            Prediction::new(
                features,
                ConversionParams::avif(crf, 6),
                0.85,
                RULE_WEBP_ANIMATED_AVIF,
                0.50,
            )
        } else {
            Prediction::new(
                features,
                ConversionParams::jxl_lossless(7),
                0.85,
                RULE_WEBP_STATIC_JXL,
                0.40,
            )
        }
    }
}

pub struct VideoPredictor;

impl Predictor for VideoPredictor {
    fn name(&self) -> &'static str {
        "video_predictor"
    }

    fn predict(&self, features: &FileFeatures) -> Prediction {
        Prediction::new(
            features,
            ConversionParams::mov_remux(),
            0.95,
            RULE_VIDEO_REMUX_MOV,
            0.02,
        )
    }
}

/// Catch-all for formats without a dedicated rule. Low confidence, so the
/// optimizer explores a small effort ladder instead of trusting the guess.
pub struct FallbackPredictor;

impl Predictor for FallbackPredictor {
    fn name(&self) -> &'static str {
        "fallback_predictor"
    }

    fn predict(&self, features: &FileFeatures) -> Prediction {
        let mut p = Prediction::new(
            features,
            ConversionParams::jxl_distance(0.0, 7),
            0.50,
            RULE_UNKNOWN_FORMAT_FALLBACK,
            0.20,
        );
        p.method = PredictionMethod::DefaultFallback;
        p.should_explore = true;
        p.exploration_candidates = vec![
            ConversionParams::jxl_distance(0.0, 5),
            ConversionParams::jxl_distance(0.0, 7),
            ConversionParams::jxl_distance(0.0, 9),
        ];
        p
    }
}

const VIDEO_FORMATS: &[&str] = &["mp4", "mov", "avi", "mkv", "wmv", "flv", "m4v"];

/// Select the predictor for a source format.
pub fn predictor_for_format(format: &str) -> &'static dyn Predictor {
    static PNG: PngPredictor = PngPredictor;
    static JPEG: JpegPredictor = JpegPredictor;
    static GIF: GifPredictor = GifPredictor;
    static WEBP: WebpPredictor = WebpPredictor;
    static VIDEO: VideoPredictor = VideoPredictor;
    static FALLBACK: FallbackPredictor = FallbackPredictor;

    match format {
        "png" => &PNG,
        "jpg" | "jpeg" => &JPEG,
        "gif" => &GIF,
        "webp" => &WEBP,
        f if VIDEO_FORMATS.contains(&f) => &VIDEO,
        _ => &FALLBACK,
    }
}

/// Run the rule predictor for `features`, stamping the wall-clock time.
pub fn predict(features: &FileFeatures) -> Prediction {
    let start = Instant::now();
    let mut prediction = predictor_for_format(&features.format).predict(features);
    prediction.prediction_time = start.elapsed();
    prediction
}

/// Caller-supplied override of the rule selection.
#[derive(Debug, Clone)]
pub struct CustomTarget {
    pub source_format: String,
    pub target_format: TargetFormat,
    /// 0..=100; interpreted per target.
    pub quality_goal: u8,
}

/// Conservative starting point for a custom target with no knowledge-base
/// backing: explore a small ladder around sane defaults.
pub fn conservative_custom_prediction(
    features: &FileFeatures,
    custom: &CustomTarget,
) -> Prediction {
    let (params, candidates): (ConversionParams, Vec<ConversionParams>) =
        match custom.target_format {
            TargetFormat::Jxl => (
                ConversionParams::jxl_distance(0.0, 7),
                vec![
                    ConversionParams::jxl_distance(0.0, 5),
                    ConversionParams::jxl_distance(0.0, 7),
                    ConversionParams::jxl_distance(0.0, 9),
                ],
            ),
            TargetFormat::Avif => (
                ConversionParams::avif(30, 6),
                vec![
                    ConversionParams::avif(25, 6),
                    ConversionParams::avif(30, 6),
                    ConversionParams::avif(35, 6),
                ],
            ),
            TargetFormat::Webp => (
                ConversionParams::webp(90),
                vec![
                    ConversionParams::webp(85),
                    ConversionParams::webp(90),
                    ConversionParams::webp(95),
                ],
            ),
            TargetFormat::Mov => (ConversionParams::mov_remux(), Vec::new()),
        };

    let should_explore = candidates.len() >= 2;
    let mut p = Prediction::new(features, params, 0.40, RULE_CUSTOM_TARGET, 0.20);
    p.method = PredictionMethod::ConservativeDefault;
    p.should_explore = should_explore;
    p.exploration_candidates = candidates;
    p
}
