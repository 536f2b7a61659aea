//! Progress and confirmation seams
//!
//! The core never touches the terminal. The batch driver talks to a
//! [`ProgressSink`] and asks resume questions through a [`ConfirmHook`];
//! the binary plugs in indicatif-backed implementations, tests plug in
//! nulls. A rate-limiting wrapper enforces the minimum update interval so
//! fast batches cannot flood a rendering sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

pub trait ProgressSink: Send + Sync {
    fn increment(&self);
    fn set_message(&self, text: &str);
    fn finish(&self);
}

pub trait ConfirmHook: Send + Sync {
    /// Ask the collaborator a yes/no question; `timeout` bounds the wait.
    fn confirm(&self, prompt: &str, timeout: Duration) -> bool;
}

/// Sink that drops everything. Default for tests and library use.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn increment(&self) {}
    fn set_message(&self, _text: &str) {}
    fn finish(&self) {}
}

/// Hook that always answers the same way (non-interactive runs).
pub struct AutoConfirm(pub bool);

impl ConfirmHook for AutoConfirm {
    fn confirm(&self, _prompt: &str, _timeout: Duration) -> bool {
        self.0
    }
}

/// indicatif-backed sink for terminal runs.
pub struct TerminalProgress {
    bar: indicatif::ProgressBar,
}

impl TerminalProgress {
    pub fn new(total: u64) -> Self {
        let bar = indicatif::ProgressBar::new(total);
        bar.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:32.cyan/blue}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        Self { bar }
    }
}

impl ProgressSink for TerminalProgress {
    fn increment(&self) {
        self.bar.inc(1);
    }

    fn set_message(&self, text: &str) {
        self.bar.set_message(text.to_string());
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Rate-limits a sink: increments are batched and flushed at most every
/// `min_interval`; `finish` flushes whatever is pending.
pub struct RateLimited<S: ProgressSink> {
    inner: S,
    min_interval: Duration,
    pending: AtomicU64,
    last_flush: Mutex<Instant>,
}

impl<S: ProgressSink> RateLimited<S> {
    pub fn new(inner: S) -> Self {
        Self::with_interval(inner, MIN_UPDATE_INTERVAL)
    }

    pub fn with_interval(inner: S, min_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            inner,
            min_interval,
            pending: AtomicU64::new(0),
            last_flush: Mutex::new(now.checked_sub(min_interval).unwrap_or(now)),
        }
    }

    fn flush_if_due(&self, force: bool) {
        let mut last = self.last_flush.lock().unwrap_or_else(|e| e.into_inner());
        if !force && last.elapsed() < self.min_interval {
            return;
        }
        let pending = self.pending.swap(0, Ordering::AcqRel);
        for _ in 0..pending {
            self.inner.increment();
        }
        *last = Instant::now();
    }
}

impl<S: ProgressSink> ProgressSink for RateLimited<S> {
    fn increment(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.flush_if_due(false);
    }

    fn set_message(&self, text: &str) {
        let last = self.last_flush.lock().unwrap_or_else(|e| e.into_inner());
        if last.elapsed() >= self.min_interval {
            drop(last);
            self.inner.set_message(text);
        }
    }

    fn finish(&self) {
        self.flush_if_due(true);
        self.inner.finish();
    }
}
