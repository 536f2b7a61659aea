//! Logging setup
//!
//! Tracing-based logging shared by the binary and tests: daily-rolling file
//! appender plus an env-filtered stderr layer. Rotation beyond the daily
//! roll is left to the environment.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: PathBuf,
    pub level: Level,
    pub log_to_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: std::env::temp_dir(),
            level: Level::INFO,
            log_to_stderr: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.log_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_stderr(mut self, enabled: bool) -> Self {
        self.log_to_stderr = enabled;
        self
    }
}

/// Initialize the global subscriber. Returns the appender guard; dropping it
/// flushes buffered log lines, so the caller keeps it alive for the run.
pub fn init_logging(program_name: &str, config: LogConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", config.log_dir))?;

    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        &config.log_dir,
        format!("{}.log", program_name),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{}={},pixly_core={}", program_name, config.level, config.level))
    });

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    if config.log_to_stderr {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
            .ok();
    } else {
        registry.try_init().ok();
    }

    Ok(guard)
}

/// Log one external tool invocation with its outcome. Stdout is never
/// logged (it can be binary); stderr is truncated to one line.
pub fn log_external_tool(tool: &str, args: &[String], exit_code: Option<i32>, stderr: &str) {
    let first_line = stderr.lines().next().unwrap_or("");
    match exit_code {
        Some(0) => {
            tracing::debug!(tool, ?args, "external tool succeeded");
        }
        code => {
            tracing::warn!(tool, ?args, ?code, stderr = first_line, "external tool failed");
        }
    }
}
