//! Unified error types
//!
//! Two altitudes: `FatalError` aborts batch startup (missing tool, unreadable
//! input root, corrupt knowledge database); `ConvertError` is per-file and
//! never poisons the worker pool. Every per-file error carries the stage it
//! came from so batch logs alone are enough to diagnose a failure.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::validate::ValidationError;

/// Errors that abort batch startup. Nothing here is retried.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("required tool '{tool}' not found on PATH. {hint}")]
    ToolMissing { tool: String, hint: String },

    #[error("input root is not a readable directory: {}", .path.display())]
    UnreadableInput { path: PathBuf },

    #[error("knowledge database at {} cannot be opened: {message}", .path.display())]
    CorruptKnowledge { path: PathBuf, message: String },
}

/// Pipeline stage a per-file error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probe,
    Predict,
    Explore,
    Encode,
    Validate,
    Metadata,
    Replace,
    Record,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Probe => "probe",
            Stage::Predict => "predict",
            Stage::Explore => "explore",
            Stage::Encode => "encode",
            Stage::Validate => "validate",
            Stage::Metadata => "metadata",
            Stage::Replace => "replace",
            Stage::Record => "record",
        }
    }
}

/// Per-file conversion error. Recorded against the file, then the batch
/// moves on; only cancellation or a `FatalError` stops the run.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("[{}] timed out after {elapsed:?}", .path.display())]
    Timeout { path: PathBuf, elapsed: Duration },

    #[error("[{}] {tool} exited with {code:?}: {stderr}", .path.display())]
    EncoderFailed {
        path: PathBuf,
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("[{}] output validation failed: {source}", .path.display())]
    Validation {
        path: PathBuf,
        #[source]
        source: ValidationError,
    },

    #[error("[{}] atomic replace failed at '{step}': {message}", .path.display())]
    Replace {
        path: PathBuf,
        step: &'static str,
        message: String,
    },

    #[error("[{}] {stage} failed: {message}", .path.display())]
    Stage {
        path: PathBuf,
        stage: &'static str,
        message: String,
    },

    #[error("[{}] io error: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConvertError {
    pub fn stage(path: &std::path::Path, stage: Stage, message: impl Into<String>) -> Self {
        ConvertError::Stage {
            path: path.to_path_buf(),
            stage: stage.as_str(),
            message: message.into(),
        }
    }

    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        ConvertError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// The path this error is attached to.
    pub fn path(&self) -> &std::path::Path {
        match self {
            ConvertError::Timeout { path, .. }
            | ConvertError::EncoderFailed { path, .. }
            | ConvertError::Validation { path, .. }
            | ConvertError::Replace { path, .. }
            | ConvertError::Stage { path, .. }
            | ConvertError::Io { path, .. } => path,
        }
    }
}
