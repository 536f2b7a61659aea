//! External encoder invocation
//!
//! Builds the exact command lines for cjxl and ffmpeg and runs them under a
//! process semaphore so batch-level parallelism cannot oversubscribe the
//! machine with encoder processes. Stdout/stderr are captured for
//! diagnostics; exit status is the success signal.

use std::path::Path;
use std::process::Command;
use std::sync::{Condvar, Mutex, OnceLock};

use crate::errors::ConvertError;
use crate::params::{ConversionParams, TargetFormat};
use crate::tools::ToolPaths;

/// Counting semaphore (mutex + condvar). Guards release on drop.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            available: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(|e| e.into_inner());
        }
        *permits -= 1;
        SemaphoreGuard { semaphore: self }
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let mut permits = self
            .semaphore
            .permits
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *permits += 1;
        self.semaphore.available.notify_one();
    }
}

/// Bound on concurrently running encoder processes: half the cores, clamped
/// to 2..=4.
pub fn process_semaphore() -> &'static Semaphore {
    static SEMAPHORE: OnceLock<Semaphore> = OnceLock::new();
    SEMAPHORE.get_or_init(|| Semaphore::new((num_cpus::get() / 2).clamp(2, 4)))
}

/// Bound on concurrent file opens for magic/round-trip reads: twice the
/// process bound.
pub fn fd_semaphore() -> &'static Semaphore {
    static SEMAPHORE: OnceLock<Semaphore> = OnceLock::new();
    SEMAPHORE.get_or_init(|| Semaphore::new((num_cpus::get() / 2).clamp(2, 4) * 2))
}

/// Which binary a parameter set encodes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderTool {
    Cjxl,
    Ffmpeg,
}

/// Build the argument vector for one encode. Paths are passed positionally;
/// the caller resolves the binary via [`ToolPaths`].
pub fn build_encode_args(
    params: &ConversionParams,
    input: &Path,
    output: &Path,
) -> (EncoderTool, Vec<String>) {
    let input = input.display().to_string();
    let output = output.display().to_string();

    match params.target_format {
        TargetFormat::Jxl => {
            let mut args = Vec::new();
            if params.lossless_jpeg {
                args.push("--lossless_jpeg=1".to_string());
            } else {
                args.push("-d".to_string());
                args.push(format!("{}", params.distance));
            }
            args.push("-e".to_string());
            args.push(params.effort.to_string());
            args.push(input);
            args.push(output);
            (EncoderTool::Cjxl, args)
        }
        TargetFormat::Avif => (
            EncoderTool::Ffmpeg,
            vec![
                "-i".to_string(),
                input,
                "-c:v".to_string(),
                "libaom-av1".to_string(),
                "-crf".to_string(),
                params.crf.to_string(),
                "-cpu-used".to_string(),
                params.speed.to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
                "-movflags".to_string(),
                "+faststart".to_string(),
                "-y".to_string(),
                output,
            ],
        ),
        // The metadata-preserving flags are required, not optional.
        TargetFormat::Mov => (
            EncoderTool::Ffmpeg,
            vec![
                "-i".to_string(),
                input,
                "-c".to_string(),
                "copy".to_string(),
                "-map_metadata".to_string(),
                "0".to_string(),
                "-movflags".to_string(),
                "use_metadata_tags".to_string(),
                "-avoid_negative_ts".to_string(),
                "make_zero".to_string(),
                "-f".to_string(),
                "mov".to_string(),
                "-y".to_string(),
                output,
            ],
        ),
        TargetFormat::Webp => (
            EncoderTool::Ffmpeg,
            vec![
                "-i".to_string(),
                input,
                "-c:v".to_string(),
                "libwebp".to_string(),
                "-quality".to_string(),
                params.quality.to_string(),
                "-y".to_string(),
                output,
            ],
        ),
    }
}

/// Run the encoder for `params`, writing `output`. Blocks on the process
/// semaphore first so at most a handful of encoders run at once.
pub fn run_encoder(
    tools: &ToolPaths,
    params: &ConversionParams,
    input: &Path,
    output: &Path,
) -> Result<(), ConvertError> {
    params
        .validate()
        .map_err(|m| ConvertError::stage(input, crate::errors::Stage::Encode, m))?;

    let (tool, args) = build_encode_args(params, input, output);
    let (binary, tool_name) = match tool {
        EncoderTool::Cjxl => (tools.cjxl.as_deref(), "cjxl"),
        EncoderTool::Ffmpeg => (tools.ffmpeg.as_deref(), "ffmpeg"),
    };
    let binary = binary.ok_or_else(|| {
        ConvertError::stage(
            input,
            crate::errors::Stage::Encode,
            format!("{} not available", tool_name),
        )
    })?;

    let _permit = process_semaphore().acquire();
    let result = Command::new(binary).args(&args).output();

    let output_data = result.map_err(|e| ConvertError::io(input, e))?;
    let stderr = String::from_utf8_lossy(&output_data.stderr);
    crate::logging::log_external_tool(tool_name, &args, output_data.status.code(), &stderr);

    if !output_data.status.success() {
        return Err(ConvertError::EncoderFailed {
            path: input.to_path_buf(),
            tool: tool_name.to_string(),
            code: output_data.status.code(),
            stderr: stderr.lines().take(3).collect::<Vec<_>>().join(" | "),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_jxl_lossless_args() {
        let params = ConversionParams::jxl_lossless(7);
        let (tool, args) = build_encode_args(&params, Path::new("/in/a.png"), Path::new("/out/a.jxl"));
        assert_eq!(tool, EncoderTool::Cjxl);
        assert_eq!(args, vec!["-d", "0", "-e", "7", "/in/a.png", "/out/a.jxl"]);
    }

    #[test]
    fn test_jxl_reversible_args() {
        let params = ConversionParams::jxl_reversible(9);
        let (tool, args) = build_encode_args(&params, Path::new("/in/b.jpg"), Path::new("/out/b.jxl"));
        assert_eq!(tool, EncoderTool::Cjxl);
        assert_eq!(
            args,
            vec!["--lossless_jpeg=1", "-e", "9", "/in/b.jpg", "/out/b.jxl"]
        );
    }

    #[test]
    fn test_avif_args() {
        let params = ConversionParams::avif(35, 6);
        let (tool, args) =
            build_encode_args(&params, Path::new("/in/c.gif"), Path::new("/out/c.avif"));
        assert_eq!(tool, EncoderTool::Ffmpeg);
        let joined = args.join(" ");
        assert!(joined.contains("-c:v libaom-av1"));
        assert!(joined.contains("-crf 35"));
        assert!(joined.contains("-cpu-used 6"));
        assert!(joined.contains("-pix_fmt yuv420p"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(joined.ends_with("-y /out/c.avif"));
    }

    #[test]
    fn test_remux_args_preserve_metadata() {
        // Every remux command must carry the metadata-preserving flags.
        let params = ConversionParams::mov_remux();
        let (tool, args) =
            build_encode_args(&params, Path::new("/in/d.mp4"), Path::new("/out/d.mov"));
        assert_eq!(tool, EncoderTool::Ffmpeg);
        let joined = args.join(" ");
        assert!(joined.contains("-c copy"));
        assert!(joined.contains("-map_metadata 0"));
        assert!(joined.contains("-movflags use_metadata_tags"));
        assert!(joined.contains("-avoid_negative_ts make_zero"));
        assert!(joined.contains("-f mov"));
    }

    #[test]
    fn test_invalid_params_rejected_before_spawn() {
        let tools = ToolPaths {
            cjxl: Some("/bin/true".into()),
            djxl: None,
            avifenc: None,
            ffmpeg: Some("/bin/true".into()),
            ffprobe: None,
            exiftool: None,
        };
        let mut params = ConversionParams::jxl_lossless(7);
        params.distance = 2.0; // breaks the lossless invariant
        let err = run_encoder(&tools, &params, Path::new("/in/x.png"), Path::new("/out/x.jxl"));
        assert!(err.is_err());
    }

    #[test]
    fn test_semaphore_bounds_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let semaphore = Arc::new(Semaphore::new(2));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let semaphore = semaphore.clone();
                let peak = peak.clone();
                let current = current.clone();
                std::thread::spawn(move || {
                    let _permit = semaphore.acquire();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "semaphore breached");
    }

    #[test]
    fn test_process_semaphore_size() {
        // Just exercise the lazy init; the bound itself is machine-dependent.
        let _ = process_semaphore().acquire();
        let _ = fd_semaphore().acquire();
    }
}
