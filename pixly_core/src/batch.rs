//! Batch driver
//!
//! Scans a directory tree, feeds the per-file optimizer through a fixed
//! worker pool, enforces a per-file timeout, keeps shared counters, and
//! persists a resume point every few files so an interrupted run restarts
//! where it stopped. Processing order within a batch is unspecified.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use walkdir::WalkDir;

use crate::config::Config;
use crate::errors::{ConvertError, FatalError};
use crate::formats;
use crate::optimizer::{BalanceOptimizer, OptimizationResult, OutputMode};
use crate::progress::{ConfirmHook, ProgressSink};
use crate::resume::{ResumePoint, ResumeStore};

/// First this many error messages are kept verbatim in the recap.
pub const MAX_RECAP_ERRORS: usize = 10;

pub const DEFAULT_FILE_TIMEOUT: Duration = Duration::from_secs(300);

pub type CancelToken = Arc<AtomicBool>;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub input_dir: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub in_place: bool,
    /// 0 = derive from config / CPU count.
    pub workers: usize,
    pub file_timeout: Duration,
    pub resume: bool,
}

impl BatchOptions {
    pub fn in_place(input_dir: PathBuf) -> Self {
        Self {
            input_dir,
            output_dir: None,
            in_place: true,
            workers: 0,
            file_timeout: DEFAULT_FILE_TIMEOUT,
            resume: true,
        }
    }

    pub fn to_directory(input_dir: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            input_dir,
            output_dir: Some(output_dir),
            in_place: false,
            workers: 0,
            file_timeout: DEFAULT_FILE_TIMEOUT,
            resume: true,
        }
    }
}

/// Final result of one batch.
#[derive(Debug, Clone)]
pub struct ConversionRecap {
    pub scanned: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub elapsed: Duration,
    /// Per-extension counts from the scan.
    pub histogram: BTreeMap<String, usize>,
    /// First [`MAX_RECAP_ERRORS`] messages verbatim.
    pub errors: Vec<String>,
    pub total_errors: u64,
    pub cancelled: bool,
    pub resumed_from: Option<usize>,
}

struct BatchState {
    succeeded: u64,
    failed: u64,
    skipped: u64,
    input_bytes: u64,
    output_bytes: u64,
    errors: Vec<String>,
    total_errors: u64,
    processed: HashSet<String>,
    since_save: usize,
}

impl BatchState {
    fn record_error(&mut self, message: String) {
        self.total_errors += 1;
        if self.errors.len() < MAX_RECAP_ERRORS {
            self.errors.push(message);
        }
    }
}

/// Collect supported media files under `dir`, skipping hidden entries and
/// symbolic links, together with a per-extension histogram.
pub fn scan_directory(dir: &Path) -> (Vec<PathBuf>, BTreeMap<String, usize>) {
    let mut files = Vec::new();
    let mut histogram: BTreeMap<String, usize> = BTreeMap::new();

    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !formats::is_hidden(e.path()))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path_is_symlink() {
            continue;
        }
        let path = entry.path();
        if !formats::is_supported(path) {
            continue;
        }
        *histogram
            .entry(formats::extension_lowercase(path))
            .or_insert(0) += 1;
        files.push(path.to_path_buf());
    }

    (files, histogram)
}

pub struct BatchDriver {
    optimizer: Arc<BalanceOptimizer>,
    config: Config,
    resume_store: Arc<ResumeStore>,
}

impl BatchDriver {
    pub fn new(optimizer: BalanceOptimizer, config: Config) -> Self {
        Self {
            optimizer: Arc::new(optimizer),
            config,
            resume_store: Arc::new(ResumeStore::default_location()),
        }
    }

    pub fn with_resume_store(mut self, store: ResumeStore) -> Self {
        self.resume_store = Arc::new(store);
        self
    }

    /// Convert every supported file under `options.input_dir`.
    ///
    /// Only startup problems and external cancellation stop the run;
    /// per-file errors are tallied and the pool keeps going.
    pub fn convert_directory(
        &self,
        options: &BatchOptions,
        progress: Arc<dyn ProgressSink>,
        confirm: &dyn ConfirmHook,
        cancel: CancelToken,
    ) -> Result<ConversionRecap, FatalError> {
        let start = Instant::now();

        if !options.input_dir.is_dir() {
            return Err(FatalError::UnreadableInput {
                path: options.input_dir.clone(),
            });
        }

        // Resume handshake before any work.
        let mut seed: Option<ResumePoint> = None;
        if options.resume && self.config.resume.enable {
            if let Some(point) = self.resume_store.load(&options.input_dir) {
                let prompt = format!(
                    "Resume previous run? ({}/{} files done)",
                    point.processed_count(),
                    point.all_files.len()
                );
                if confirm.confirm(&prompt, Duration::from_secs(30)) {
                    seed = Some(point);
                } else {
                    let _ = self.resume_store.clear(&options.input_dir);
                }
            }
        }

        let (files, histogram) = scan_directory(&options.input_dir);
        tracing::info!(
            dir = %options.input_dir.display(),
            files = files.len(),
            histogram = ?histogram,
            "scan complete"
        );

        let output_mode = self.output_mode(options);
        let resumed_from = seed.as_ref().map(|p| p.processed_count());

        let mut point = seed.clone().unwrap_or_else(|| {
            ResumePoint::new(
                &options.input_dir,
                options.output_dir.as_deref(),
                options.in_place,
            )
        });
        point.all_files = files.iter().map(|p| p.display().to_string()).collect();

        let state = Arc::new(Mutex::new(BatchState {
            succeeded: seed.as_ref().map_or(0, |p| p.success_count),
            failed: seed.as_ref().map_or(0, |p| p.fail_count),
            skipped: seed.as_ref().map_or(0, |p| p.skip_count),
            input_bytes: 0,
            output_bytes: 0,
            errors: Vec::new(),
            total_errors: 0,
            processed: seed.as_ref().map(|p| p.processed_set()).unwrap_or_default(),
            since_save: 0,
        }));
        let point = Arc::new(Mutex::new(point));

        let resume_enabled = options.resume && self.config.resume.enable;
        if resume_enabled {
            self.persist_point(&point, &state);
        }

        let workers = if options.workers > 0 {
            options.workers
        } else {
            self.config.effective_workers()
        };
        let queue: Arc<Mutex<VecDeque<PathBuf>>> =
            Arc::new(Mutex::new(files.iter().cloned().collect()));

        let save_interval = self.config.resume.save_interval.max(1);

        std::thread::scope(|scope| {
            for _ in 0..workers.max(1) {
                let queue = queue.clone();
                let state = state.clone();
                let point = point.clone();
                let optimizer = self.optimizer.clone();
                let output_mode = output_mode.clone();
                let progress = progress.clone();
                let cancel = cancel.clone();
                let resume_store = self.resume_store.clone();
                let timeout = options.file_timeout;

                scope.spawn(move || {
                    loop {
                        if cancel.load(Ordering::Relaxed) {
                            break;
                        }
                        let path = {
                            let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                            queue.pop_front()
                        };
                        let Some(path) = path else { break };

                        let key = path.display().to_string();
                        let already_done = {
                            let state = state.lock().unwrap_or_else(|e| e.into_inner());
                            state.processed.contains(&key)
                        };
                        if already_done {
                            progress.increment();
                            continue;
                        }

                        progress.set_message(&key);
                        let result = run_with_timeout(&optimizer, &path, &output_mode, timeout);

                        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                        match result {
                            OptimizationResult::Converted {
                                original_size,
                                new_size,
                                ..
                            } => {
                                state.succeeded += 1;
                                state.input_bytes += original_size;
                                state.output_bytes += new_size;
                            }
                            OptimizationResult::Skipped { reason, .. } => {
                                tracing::debug!(path = %key, "skipped: {}", reason);
                                state.skipped += 1;
                            }
                            OptimizationResult::Failed(err) => {
                                tracing::warn!("{}", err);
                                state.failed += 1;
                                state.record_error(err.to_string());
                            }
                        }
                        state.processed.insert(key.clone());
                        state.since_save += 1;

                        let should_save = resume_enabled && state.since_save >= save_interval;
                        if should_save {
                            state.since_save = 0;
                            let mut point = point.lock().unwrap_or_else(|e| e.into_inner());
                            update_point(&mut point, &state);
                            point.last_file = Some(key);
                            if let Err(e) = resume_store.save(&point) {
                                tracing::warn!("resume point save failed: {}", e);
                            }
                        }
                        drop(state);

                        progress.increment();
                    }
                });
            }
        });

        progress.finish();

        let cancelled = cancel.load(Ordering::Relaxed);
        let state = state.lock().unwrap_or_else(|e| e.into_inner());

        if resume_enabled {
            if cancelled {
                let mut point = point.lock().unwrap_or_else(|e| e.into_inner());
                update_point(&mut point, &state);
                if let Err(e) = self.resume_store.save(&point) {
                    tracing::warn!("final resume point save failed: {}", e);
                }
            } else if let Err(e) = self.resume_store.clear(&options.input_dir) {
                tracing::warn!("resume point cleanup failed: {}", e);
            }
        }

        Ok(ConversionRecap {
            scanned: files.len(),
            succeeded: state.succeeded,
            failed: state.failed,
            skipped: state.skipped,
            input_bytes: state.input_bytes,
            output_bytes: state.output_bytes,
            elapsed: start.elapsed(),
            histogram,
            errors: state.errors.clone(),
            total_errors: state.total_errors,
            cancelled,
            resumed_from,
        })
    }

    fn output_mode(&self, options: &BatchOptions) -> OutputMode {
        if let Some(output_dir) = &options.output_dir {
            OutputMode::Directory {
                input_root: options.input_dir.clone(),
                output_root: output_dir.clone(),
            }
        } else if options.in_place && !self.config.output.keep_original {
            OutputMode::InPlace
        } else {
            OutputMode::Alongside
        }
    }

    fn persist_point(&self, point: &Arc<Mutex<ResumePoint>>, state: &Arc<Mutex<BatchState>>) {
        let state = state.lock().unwrap_or_else(|e| e.into_inner());
        let mut point = point.lock().unwrap_or_else(|e| e.into_inner());
        update_point(&mut point, &state);
        if let Err(e) = self.resume_store.save(&point) {
            tracing::warn!("resume point save failed: {}", e);
        }
    }
}

fn update_point(point: &mut ResumePoint, state: &BatchState) {
    point.processed_files = state.processed.iter().cloned().collect();
    point.success_count = state.succeeded;
    point.fail_count = state.failed;
    point.skip_count = state.skipped;
    point.timestamp = chrono::Utc::now().to_rfc3339();
}

/// Race the optimizer against a timer. On expiry the file is marked failed
/// and the worker moves on; the straggler thread finishes in the background
/// and its late result is dropped.
fn run_with_timeout(
    optimizer: &Arc<BalanceOptimizer>,
    path: &Path,
    mode: &OutputMode,
    timeout: Duration,
) -> OptimizationResult {
    let (tx, rx) = mpsc::channel();
    let optimizer = optimizer.clone();
    let path_owned = path.to_path_buf();
    let mode = mode.clone();

    std::thread::spawn(move || {
        let result = optimizer.optimize_file(&path_owned, &mode);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => OptimizationResult::Failed(ConvertError::Timeout {
            path: path.to_path_buf(),
            elapsed: timeout,
        }),
    }
}
