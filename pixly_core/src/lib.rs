//! pixly_core - intelligent media recompression pipeline
//!
//! Given a directory of mixed images and videos, chooses a modern target
//! per file (JPEG XL, AVIF, or a remuxed MOV), drives the external encoders
//! to produce it, verifies the output, preserves metadata, swaps files
//! atomically, and records every outcome in a persistent knowledge base
//! that feeds future parameter choices.
//!
//! Components:
//! - Tool registry: locate cjxl/djxl/avifenc/ffmpeg/ffprobe/exiftool
//! - Feature extraction: ffprobe-backed per-file descriptors
//! - Predictors: per-source-format conversion rules with confidence
//! - Knowledge base: record log + aggregate stats, tuner on top
//! - Exploration: bounded parallel trials for low-confidence predictions
//! - Balance optimizer: the per-file pipeline with atomic replacement
//! - Batch driver: scan, worker pool, timeouts, resumable checkpoints

pub mod batch;
pub mod config;
pub mod encode;
pub mod errors;
pub mod explore;
pub mod features;
pub mod formats;
pub mod knowledge;
pub mod logging;
pub mod metadata;
pub mod optimizer;
pub mod params;
pub mod predict;
pub mod progress;
pub mod report;
pub mod resume;
pub mod tools;
pub mod tuner;
pub mod validate;

pub use batch::{
    scan_directory, BatchDriver, BatchOptions, CancelToken, ConversionRecap, MAX_RECAP_ERRORS,
};
pub use config::{default_knowledge_path, Config};
pub use errors::{ConvertError, FatalError};
pub use explore::{explore, ExplorationResult};
pub use features::{extract_features, FileFeatures};
pub use knowledge::{
    AggregateStats, ConversionRecord, FormatCombination, KnowledgeStore, QualityMode,
    RecordFilter, StatsSummary,
};
pub use logging::{init_logging, LogConfig};
pub use metadata::{preserve_metadata, MetadataOutcome};
pub use optimizer::{BalanceOptimizer, OptimizationResult, OutputMode};
pub use params::{ConversionParams, TargetFormat};
pub use predict::{predict, CustomTarget, Prediction, PredictionMethod, Predictor};
pub use progress::{AutoConfirm, ConfirmHook, NullProgress, ProgressSink, TerminalProgress};
pub use report::{print_simple_summary, print_summary_report};
pub use resume::{ResumePoint, ResumeStore};
pub use tools::{check_all_tools, ToolPaths};
pub use tuner::{PredictionTuner, TunedParams, MIN_SAMPLES};
pub use validate::{validate_output, RoundTrip, ValidationError, ValidationOptions};
