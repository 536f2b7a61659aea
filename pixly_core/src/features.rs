//! Feature extraction
//!
//! Runs ffprobe over an input file and projects the first stream into a
//! compact [`FileFeatures`] descriptor consumed by the predictors. Probe
//! failure never fails extraction: a per-format fallback descriptor is
//! produced instead, with a warning.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;

use crate::tools::ToolPaths;

/// Pixel-format substrings that imply an alpha channel.
const ALPHA_PIX_FMTS: &[&str] = &[
    "rgba", "argb", "bgra", "abgr", "yuva", "rgba64", "gbra",
];

/// Immutable descriptor of one input file. Constructed once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFeatures {
    pub file_path: String,
    /// Lowercased extension without the dot.
    pub format: String,
    pub file_size: u64,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: String,
    pub color_space: String,
    pub bit_depth: u8,
    pub has_alpha: bool,
    pub is_animated: bool,
    pub frame_count: u64,
    pub frame_rate: f64,
    /// JPEG-only heuristic, 0-100.
    pub estimated_quality: u8,
    pub bytes_per_pixel: f64,
    /// Coarse complexity bucket derived from bytes-per-pixel.
    pub complexity: f64,
    /// Format-specific pre-compression hint (currently PNG only).
    pub compression: f64,
}

/// Extract features for `path`. Requires `stat` to succeed; the probe itself
/// is allowed to fail and falls back to plausible per-format defaults.
pub fn extract_features(tools: &ToolPaths, path: &Path) -> std::io::Result<FileFeatures> {
    let file_size = std::fs::metadata(path)?.len();
    let format = crate::formats::extension_lowercase(path);

    let probe = tools
        .ffprobe
        .as_deref()
        .and_then(|ffprobe| run_probe(ffprobe, path));

    match probe {
        Some(json) => Ok(features_from_probe(path, &format, file_size, &json)),
        None => {
            tracing::warn!(path = %path.display(), "ffprobe unavailable or failed; using fallback features");
            Ok(fallback_features(path, &format, file_size))
        }
    }
}

fn run_probe(ffprobe: &Path, path: &Path) -> Option<serde_json::Value> {
    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format", "--"])
        .arg(path)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    serde_json::from_slice(&output.stdout).ok()
}

/// Project a probe JSON document into features. Split from the process
/// invocation so the derivation rules are testable against canned output.
pub fn features_from_probe(
    path: &Path,
    format: &str,
    file_size: u64,
    json: &serde_json::Value,
) -> FileFeatures {
    let stream = match json["streams"].as_array().and_then(|s| s.first()) {
        Some(stream) => stream,
        None => {
            tracing::warn!(path = %path.display(), "probe returned no streams; using fallback features");
            return fallback_features(path, format, file_size);
        }
    };

    let width = (stream["width"].as_u64().unwrap_or(0) as u32).max(1);
    let height = (stream["height"].as_u64().unwrap_or(0) as u32).max(1);
    let pix_fmt = stream["pix_fmt"].as_str().unwrap_or("").to_lowercase();
    let codec_name = stream["codec_name"].as_str().unwrap_or("").to_lowercase();
    let nb_frames = stream["nb_frames"].as_str().unwrap_or("");

    let frame_count = nb_frames.parse::<u64>().unwrap_or(1).max(1);
    let frame_rate = parse_frame_rate(stream["avg_frame_rate"].as_str().unwrap_or(""));

    let has_alpha = detect_alpha(&pix_fmt);
    let color_space = stream["color_space"]
        .as_str()
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| color_space_from_pix_fmt(&pix_fmt));
    let bit_depth = detect_bit_depth(&pix_fmt, stream["bits_per_raw_sample"].as_str());
    let is_animated = detect_animation(nb_frames, &codec_name, frame_count);

    let estimated_quality = if format == "jpg" || format == "jpeg" {
        estimate_jpeg_quality(&pix_fmt)
    } else {
        50
    };

    let bytes_per_pixel = file_size as f64 / (width as f64 * height as f64);
    let complexity = complexity_bucket(bytes_per_pixel);
    let compression = compression_hint(format, bytes_per_pixel);

    FileFeatures {
        file_path: path.display().to_string(),
        format: format.to_string(),
        file_size,
        width,
        height,
        pix_fmt,
        color_space,
        bit_depth,
        has_alpha,
        is_animated,
        frame_count,
        frame_rate,
        estimated_quality,
        bytes_per_pixel,
        complexity,
        compression,
    }
}

/// Plausible defaults used when the probe fails or reports no streams.
pub fn fallback_features(path: &Path, format: &str, file_size: u64) -> FileFeatures {
    let (pix_fmt, has_alpha, is_animated, estimated_quality) = match format {
        "png" => ("rgba", true, false, 50),
        "jpg" | "jpeg" => ("yuv420p", false, false, 65),
        "gif" => ("pal8", false, true, 50),
        "webp" => ("yuv420p", false, false, 50),
        _ => ("yuv420p", false, false, 50),
    };

    let (width, height) = if crate::formats::classify_media_type(path) == crate::formats::MediaType::Video {
        (1920u32, 1080u32)
    } else {
        (1024u32, 1024u32)
    };

    let bytes_per_pixel = file_size as f64 / (width as f64 * height as f64);

    FileFeatures {
        file_path: path.display().to_string(),
        format: format.to_string(),
        file_size,
        width,
        height,
        pix_fmt: pix_fmt.to_string(),
        color_space: color_space_from_pix_fmt(pix_fmt),
        bit_depth: 8,
        has_alpha,
        is_animated,
        frame_count: if is_animated { 10 } else { 1 },
        frame_rate: 0.0,
        estimated_quality,
        bytes_per_pixel,
        complexity: complexity_bucket(bytes_per_pixel),
        compression: compression_hint(format, bytes_per_pixel),
    }
}

fn detect_alpha(pix_fmt: &str) -> bool {
    ALPHA_PIX_FMTS.iter().any(|a| pix_fmt.contains(a))
}

fn color_space_from_pix_fmt(pix_fmt: &str) -> String {
    if pix_fmt.contains("rgba") {
        "rgba".to_string()
    } else if pix_fmt.contains("rgb") {
        "rgb".to_string()
    } else if pix_fmt.contains("gray") {
        "grayscale".to_string()
    } else if pix_fmt.contains("yuv") {
        "yuv".to_string()
    } else {
        "rgb".to_string()
    }
}

/// Explicit `bits_per_raw_sample` wins; otherwise widths in the pix_fmt name.
pub fn detect_bit_depth(pix_fmt: &str, bits_per_raw_sample: Option<&str>) -> u8 {
    match bits_per_raw_sample {
        Some("16") => return 16,
        Some("32") => return 32,
        _ => {}
    }
    if pix_fmt.contains("64") || pix_fmt.contains("48") || pix_fmt.contains("16") {
        16
    } else {
        8
    }
}

fn detect_animation(nb_frames: &str, codec_name: &str, frame_count: u64) -> bool {
    let multi_frame = !matches!(nb_frames, "" | "0" | "1");
    match codec_name {
        "gif" | "apng" => true,
        "webp" => multi_frame || frame_count > 1,
        _ => multi_frame,
    }
}

/// JPEG quality heuristic from chroma subsampling.
pub fn estimate_jpeg_quality(pix_fmt: &str) -> u8 {
    match pix_fmt {
        "yuvj444p" => 98,
        "yuvj422p" => 80,
        "yuvj420p" => 65,
        _ => 50,
    }
}

pub fn parse_frame_rate(s: &str) -> f64 {
    if let Some((num, den)) = s.split_once('/') {
        let num = num.parse::<f64>().unwrap_or(0.0);
        let den = den.parse::<f64>().unwrap_or(0.0);
        if den > 0.0 && num > 0.0 {
            return num / den;
        }
        return 0.0;
    }
    match s.parse::<f64>() {
        Ok(v) if v > 0.0 => v,
        _ => 0.0,
    }
}

fn complexity_bucket(bytes_per_pixel: f64) -> f64 {
    if bytes_per_pixel > 3.0 {
        0.9
    } else if bytes_per_pixel > 1.0 {
        0.7
    } else if bytes_per_pixel > 0.5 {
        0.5
    } else {
        0.3
    }
}

fn compression_hint(format: &str, bytes_per_pixel: f64) -> f64 {
    match format {
        "png" => {
            if bytes_per_pixel < 0.5 {
                0.9
            } else {
                0.3
            }
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn probe_json(stream: serde_json::Value) -> serde_json::Value {
        serde_json::json!({ "streams": [stream], "format": {} })
    }

    #[test]
    fn test_rgba_png_features() {
        let json = probe_json(serde_json::json!({
            "codec_name": "png",
            "width": 720,
            "height": 720,
            "pix_fmt": "rgba",
        }));
        let f = features_from_probe(Path::new("/in/a.png"), "png", 2_064_384, &json);

        assert_eq!(f.width, 720);
        assert_eq!(f.height, 720);
        assert!(f.has_alpha);
        assert_eq!(f.color_space, "rgba");
        assert_eq!(f.bit_depth, 8);
        assert!(!f.is_animated);
        assert_eq!(f.frame_count, 1);
        let expected_bpp = 2_064_384f64 / (720.0 * 720.0);
        assert!((f.bytes_per_pixel - expected_bpp).abs() < 1e-9);
    }

    #[test]
    fn test_alpha_detection_table() {
        let cases: &[(&str, bool)] = &[
            ("rgba", true),
            ("argb", true),
            ("bgra", true),
            ("abgr", true),
            ("yuva420p", true),
            ("rgba64be", true),
            ("rgba64le", true),
            ("gbrap", true),
            ("rgb24", false),
            ("yuv420p", false),
            ("gray", false),
            ("yuvj444p", false),
        ];
        for (fmt, expected) in cases {
            assert_eq!(detect_alpha(fmt), *expected, "pix_fmt {}", fmt);
        }
    }

    #[test]
    fn test_color_space_fallback_table() {
        let cases: &[(&str, &str)] = &[
            ("rgba", "rgba"),
            ("rgb24", "rgb"),
            ("gray", "grayscale"),
            ("gray16le", "grayscale"),
            ("yuv420p", "yuv"),
            ("pal8", "rgb"),
        ];
        for (fmt, expected) in cases {
            assert_eq!(color_space_from_pix_fmt(fmt), *expected, "pix_fmt {}", fmt);
        }
    }

    #[test]
    fn test_bit_depth_explicit_overrides_pattern() {
        assert_eq!(detect_bit_depth("yuv420p", Some("16")), 16);
        assert_eq!(detect_bit_depth("yuv420p", Some("32")), 32);
        // Unknown explicit value falls through to the pattern match.
        assert_eq!(detect_bit_depth("yuv420p", Some("10")), 8);
    }

    #[test]
    fn test_bit_depth_pattern_table() {
        let cases: &[(&str, u8)] = &[
            ("rgba64be", 16),
            ("rgb48le", 16),
            ("gray16be", 16),
            ("yuv420p", 8),
            ("rgb24", 8),
            ("", 8),
        ];
        for (fmt, expected) in cases {
            assert_eq!(detect_bit_depth(fmt, None), *expected, "pix_fmt {}", fmt);
        }
    }

    #[test]
    fn test_animation_detection() {
        // nb_frames drives it for generic codecs.
        assert!(detect_animation("24", "h264", 24));
        assert!(!detect_animation("1", "h264", 1));
        assert!(!detect_animation("", "mjpeg", 1));
        assert!(!detect_animation("0", "mjpeg", 1));
        // gif/apng are intrinsically animated.
        assert!(detect_animation("1", "gif", 1));
        assert!(detect_animation("", "apng", 1));
        // webp needs frame confirmation.
        assert!(!detect_animation("1", "webp", 1));
        assert!(detect_animation("3", "webp", 3));
    }

    #[test]
    fn test_jpeg_quality_table() {
        assert_eq!(estimate_jpeg_quality("yuvj444p"), 98);
        assert_eq!(estimate_jpeg_quality("yuvj422p"), 80);
        assert_eq!(estimate_jpeg_quality("yuvj420p"), 65);
        assert_eq!(estimate_jpeg_quality("yuv444p"), 50);
    }

    #[test]
    fn test_jpeg_features_carry_estimated_quality() {
        let json = probe_json(serde_json::json!({
            "codec_name": "mjpeg",
            "width": 1200,
            "height": 800,
            "pix_fmt": "yuvj444p",
        }));
        let f = features_from_probe(Path::new("/in/b.jpg"), "jpg", 850_000, &json);
        assert_eq!(f.estimated_quality, 98);
        assert!(!f.has_alpha);
        assert_eq!(f.color_space, "yuv");
    }

    #[test]
    fn test_parse_frame_rate_rational() {
        assert!((parse_frame_rate("30/1") - 30.0).abs() < 1e-9);
        assert!((parse_frame_rate("30000/1001") - 29.97).abs() < 0.01);
        assert!((parse_frame_rate("24") - 24.0).abs() < 1e-9);
        assert_eq!(parse_frame_rate("0/0"), 0.0);
        assert_eq!(parse_frame_rate("30/0"), 0.0);
        assert_eq!(parse_frame_rate(""), 0.0);
        assert_eq!(parse_frame_rate("bogus"), 0.0);
    }

    #[test]
    fn test_complexity_buckets() {
        let cases: &[(f64, f64)] = &[(4.0, 0.9), (2.0, 0.7), (0.8, 0.5), (0.2, 0.3)];
        for (bpp, expected) in cases {
            assert!((complexity_bucket(*bpp) - expected).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_png_compression_hint() {
        assert!((compression_hint("png", 0.2) - 0.9).abs() < f64::EPSILON);
        assert!((compression_hint("png", 1.2) - 0.3).abs() < f64::EPSILON);
        assert_eq!(compression_hint("jpg", 0.2), 0.0);
    }

    #[test]
    fn test_zero_dimensions_clamped() {
        let json = probe_json(serde_json::json!({
            "codec_name": "png",
            "pix_fmt": "rgb24",
        }));
        let f = features_from_probe(Path::new("/in/c.png"), "png", 100, &json);
        assert_eq!(f.width, 1);
        assert_eq!(f.height, 1);
        assert!(f.bytes_per_pixel >= 0.0);
    }

    #[test]
    fn test_no_streams_uses_fallback() {
        let json = serde_json::json!({ "streams": [], "format": {} });
        let f = features_from_probe(Path::new("/in/d.png"), "png", 1000, &json);
        assert!(f.has_alpha, "png fallback assumes alpha");
        assert_eq!(f.pix_fmt, "rgba");
    }

    #[test]
    fn test_fallback_features_per_format() {
        let png = fallback_features(Path::new("/in/x.png"), "png", 1000);
        assert!(png.has_alpha);

        let jpeg = fallback_features(Path::new("/in/x.jpg"), "jpg", 1000);
        assert_eq!(jpeg.pix_fmt, "yuv420p");
        assert_eq!(jpeg.estimated_quality, 65);

        let gif = fallback_features(Path::new("/in/x.gif"), "gif", 1000);
        assert!(gif.is_animated);

        let video = fallback_features(Path::new("/in/x.mp4"), "mp4", 1000);
        assert_eq!(video.width, 1920);
        assert_eq!(video.height, 1080);
    }

    #[test]
    fn test_frame_count_clamped_to_one() {
        let json = probe_json(serde_json::json!({
            "codec_name": "png",
            "width": 8,
            "height": 8,
            "pix_fmt": "rgb24",
            "nb_frames": "0",
        }));
        let f = features_from_probe(Path::new("/in/e.png"), "png", 64, &json);
        assert_eq!(f.frame_count, 1);
    }
}
