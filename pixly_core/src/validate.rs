//! Output validation
//!
//! Runs after every encode attempt, exploration trials included. Checks are
//! ordered and each is fatal: existence, non-zero size, pathological-growth
//! bound, then magic bytes keyed on the target container. The optional
//! round-trip verification backs the lossless-reversibility guarantees and
//! is only exercised when the decode tools are present.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

use crate::params::{ConversionParams, TargetFormat};
use crate::tools::ToolPaths;

/// JXL container signature (ISO BMFF style box header).
const JXL_CONTAINER_SIG: [u8; 12] = [
    0x00, 0x00, 0x00, 0x0C, 0x4A, 0x58, 0x4C, 0x20, 0x0D, 0x0A, 0x87, 0x0A,
];

/// Typed validation failure naming the check that tripped.
#[derive(Debug, Error)]
#[error("{layer}: {message}")]
pub struct ValidationError {
    pub layer: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(layer: &'static str, message: impl Into<String>) -> Self {
        Self {
            layer,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValidationOptions {
    pub magic_byte_check: bool,
    pub max_size_ratio: f64,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            magic_byte_check: true,
            max_size_ratio: 10.0,
        }
    }
}

impl From<&crate::config::ValidationConfig> for ValidationOptions {
    fn from(config: &crate::config::ValidationConfig) -> Self {
        Self {
            magic_byte_check: config.magic_byte_check,
            max_size_ratio: config.max_size_ratio,
        }
    }
}

/// Validate one encoder output against its original.
pub fn validate_output(
    output: &Path,
    target: TargetFormat,
    original_size: u64,
    options: &ValidationOptions,
) -> Result<(), ValidationError> {
    let metadata = std::fs::metadata(output)
        .map_err(|e| ValidationError::new("exists", format!("{}: {}", output.display(), e)))?;
    if !metadata.is_file() {
        return Err(ValidationError::new(
            "exists",
            format!("not a regular file: {}", output.display()),
        ));
    }

    let new_size = metadata.len();
    if new_size == 0 {
        return Err(ValidationError::new("size", "output is empty (0 bytes)"));
    }

    let max_size = (original_size as f64 * options.max_size_ratio) as u64;
    if new_size > max_size {
        return Err(ValidationError::new(
            "ratio",
            format!(
                "output expanded pathologically: {} > {} ({}x original)",
                new_size, max_size, options.max_size_ratio
            ),
        ));
    }

    if options.magic_byte_check {
        check_magic_bytes(output, target)?;
    }

    Ok(())
}

fn check_magic_bytes(output: &Path, target: TargetFormat) -> Result<(), ValidationError> {
    let _fd = crate::encode::fd_semaphore().acquire();
    let mut header = [0u8; 16];
    let mut file = File::open(output)
        .map_err(|e| ValidationError::new("magic", format!("cannot open output: {}", e)))?;
    let read = file
        .read(&mut header)
        .map_err(|e| ValidationError::new("magic", format!("cannot read output: {}", e)))?;

    let ok = match target {
        TargetFormat::Jxl => {
            (read >= 2 && header[0] == 0xFF && header[1] == 0x0A)
                || (read >= 12 && header[..12] == JXL_CONTAINER_SIG)
        }
        // ISO BMFF: size box then 'ftyp' at offset 4.
        TargetFormat::Avif | TargetFormat::Mov => read >= 8 && &header[4..8] == b"ftyp",
        TargetFormat::Webp => read >= 12 && &header[..4] == b"RIFF" && &header[8..12] == b"WEBP",
    };

    if ok {
        Ok(())
    } else {
        Err(ValidationError::new(
            "magic",
            format!(
                "bad {} signature in {} (first bytes: {:02x?})",
                target,
                output.display(),
                &header[..read.min(12)]
            ),
        ))
    }
}

/// Outcome of the optional lossless round-trip verification.
#[derive(Debug, Clone)]
pub enum RoundTrip {
    Verified { pixel_diff_percent: f64 },
    Skipped { reason: String },
}

/// Verify the reversible paths: JPEG->JXL (`--lossless_jpeg`) must decode to
/// the exact original byte stream; PNG->JXL at distance 0 must decode to the
/// same pixels within a 0.001% tolerance. Requires `djxl` (and `ffmpeg` for
/// the pixel comparison); missing tools skip rather than fail.
pub fn verify_lossless_roundtrip(
    tools: &ToolPaths,
    original: &Path,
    encoded: &Path,
    params: &ConversionParams,
) -> Result<RoundTrip, ValidationError> {
    let Some(djxl) = tools.djxl.as_deref() else {
        return Ok(RoundTrip::Skipped {
            reason: "djxl not available".to_string(),
        });
    };

    let suffix = if params.lossless_jpeg { ".jpg" } else { ".png" };
    let decoded = tempfile::Builder::new()
        .prefix("pixly-roundtrip-")
        .suffix(suffix)
        .tempfile()
        .map_err(|e| ValidationError::new("roundtrip", format!("scratch file: {}", e)))?;

    let status = Command::new(djxl)
        .arg(encoded)
        .arg(decoded.path())
        .output()
        .map_err(|e| ValidationError::new("roundtrip", format!("djxl spawn: {}", e)))?;
    if !status.status.success() {
        return Err(ValidationError::new(
            "roundtrip",
            format!(
                "djxl failed: {}",
                String::from_utf8_lossy(&status.stderr).trim()
            ),
        ));
    }

    if params.lossless_jpeg {
        let original_bytes = std::fs::read(original)
            .map_err(|e| ValidationError::new("roundtrip", e.to_string()))?;
        let decoded_bytes = std::fs::read(decoded.path())
            .map_err(|e| ValidationError::new("roundtrip", e.to_string()))?;
        if original_bytes == decoded_bytes {
            Ok(RoundTrip::Verified {
                pixel_diff_percent: 0.0,
            })
        } else {
            Err(ValidationError::new(
                "roundtrip",
                format!(
                    "reconstructed jpeg differs from original ({} vs {} bytes)",
                    decoded_bytes.len(),
                    original_bytes.len()
                ),
            ))
        }
    } else {
        let Some(ffmpeg) = tools.ffmpeg.as_deref() else {
            return Ok(RoundTrip::Skipped {
                reason: "ffmpeg not available for pixel comparison".to_string(),
            });
        };
        let diff = pixel_diff_percent(ffmpeg, original, decoded.path())?;
        if diff <= 0.001 {
            Ok(RoundTrip::Verified {
                pixel_diff_percent: diff,
            })
        } else {
            Err(ValidationError::new(
                "roundtrip",
                format!("pixel difference {:.5}% exceeds 0.001%", diff),
            ))
        }
    }
}

/// Percentage of differing bytes between the two images decoded to raw RGBA.
fn pixel_diff_percent(ffmpeg: &Path, a: &Path, b: &Path) -> Result<f64, ValidationError> {
    let raw_a = decode_to_raw(ffmpeg, a)?;
    let raw_b = decode_to_raw(ffmpeg, b)?;
    if raw_a.len() != raw_b.len() {
        return Err(ValidationError::new(
            "roundtrip",
            format!(
                "decoded dimensions differ ({} vs {} raw bytes)",
                raw_a.len(),
                raw_b.len()
            ),
        ));
    }
    if raw_a.is_empty() {
        return Err(ValidationError::new("roundtrip", "decoded to zero pixels"));
    }
    let differing = raw_a
        .iter()
        .zip(raw_b.iter())
        .filter(|(x, y)| x != y)
        .count();
    Ok(differing as f64 / raw_a.len() as f64 * 100.0)
}

fn decode_to_raw(ffmpeg: &Path, image: &Path) -> Result<Vec<u8>, ValidationError> {
    let output = Command::new(ffmpeg)
        .args(["-v", "quiet", "-i"])
        .arg(image)
        .args(["-f", "rawvideo", "-pix_fmt", "rgba", "-"])
        .output()
        .map_err(|e| ValidationError::new("roundtrip", format!("ffmpeg spawn: {}", e)))?;
    if !output.status.success() {
        return Err(ValidationError::new(
            "roundtrip",
            format!("ffmpeg decode failed for {}", image.display()),
        ));
    }
    Ok(output.stdout)
}
