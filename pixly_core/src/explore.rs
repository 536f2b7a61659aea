//! Exploration engine
//!
//! When a prediction is low-confidence, 2-3 candidate parameter sets are
//! tried in parallel on the same input, each writing to its own scratch
//! file. Only validated outputs compete; the smallest one wins, and only if
//! it beats the original by at least 1 KiB and 5%. Scratch files are removed
//! unconditionally when the trial set is done.

use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::params::ConversionParams;
use crate::tools::ToolPaths;
use crate::validate::{validate_output, ValidationOptions};

/// Trying more than this many sets is diminishing returns for wall-clock.
pub const MAX_CANDIDATES: usize = 3;

/// A trial must save at least this many bytes to count.
pub const MIN_ABSOLUTE_GAIN: u64 = 1024;

/// ... and at least this fraction of the original size.
pub const MIN_RELATIVE_GAIN: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct ExplorationResult {
    pub best_params: ConversionParams,
    pub best_size: u64,
    pub tested_params: Vec<ConversionParams>,
    /// Candidate key -> validated output size. Failed trials are absent.
    pub test_results: HashMap<String, u64>,
    pub explore_time: Duration,
}

/// Run the candidate trials. Returns `None` when no candidate produces a
/// validated output that clears the selection thresholds; the caller then
/// falls back to the rule-based prediction as-is.
pub fn explore(
    tools: &ToolPaths,
    input: &Path,
    candidates: &[ConversionParams],
    original_size: u64,
    validation: &ValidationOptions,
) -> Option<ExplorationResult> {
    if candidates.len() < 2 {
        return None;
    }
    let start = Instant::now();
    let candidates = &candidates[..candidates.len().min(MAX_CANDIDATES)];

    let scratch = match tempfile::Builder::new().prefix("pixly-explore-").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!("exploration scratch dir failed: {}", e);
            return None;
        }
    };

    // One trial per candidate, in parallel. Failures are ignored here; a
    // trial only participates if its output validates.
    let trials: Vec<Option<(ConversionParams, u64)>> = candidates
        .par_iter()
        .enumerate()
        .map(|(index, params)| {
            let out_path = scratch.path().join(format!(
                "trial-{}-{}.{}",
                index,
                params.key().replace(':', "_"),
                params.target_format.extension()
            ));
            if let Err(e) = crate::encode::run_encoder(tools, params, input, &out_path) {
                tracing::debug!(candidate = %params.key(), "trial failed: {}", e);
                return None;
            }
            if let Err(e) = validate_output(&out_path, params.target_format, original_size, validation)
            {
                tracing::debug!(candidate = %params.key(), "trial output invalid: {}", e);
                return None;
            }
            let size = std::fs::metadata(&out_path).ok()?.len();
            Some((params.clone(), size))
        })
        .collect();

    let test_results: HashMap<String, u64> = trials
        .iter()
        .flatten()
        .map(|(params, size)| (params.key(), *size))
        .collect();

    let best = pick_best(&trials, original_size)?;

    // Scratch dir (and every trial output, winner included) goes away here;
    // the optimizer re-encodes the winner through its normal output path.
    drop(scratch);

    Some(ExplorationResult {
        best_params: best.0,
        best_size: best.1,
        tested_params: candidates.to_vec(),
        test_results,
        explore_time: start.elapsed(),
    })
}

/// Selection rule over completed trials: discard results below the absolute
/// or relative gain thresholds, then take the smallest survivor.
pub fn pick_best(
    trials: &[Option<(ConversionParams, u64)>],
    original_size: u64,
) -> Option<(ConversionParams, u64)> {
    trials
        .iter()
        .flatten()
        .filter(|(_, size)| {
            let gain = original_size.saturating_sub(*size);
            gain >= MIN_ABSOLUTE_GAIN && gain as f64 >= original_size as f64 * MIN_RELATIVE_GAIN
        })
        .min_by_key(|(_, size)| *size)
        .cloned()
}
