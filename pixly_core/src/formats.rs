//! Media type classification
//!
//! The supported-extension sets and the image/video split used by the scan
//! phase and the per-file driver. Extensions compare lowercased, without the
//! leading dot.

use std::path::Path;

/// Image extensions the pipeline accepts.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "tiff", "heic", "heif",
];

/// Video extensions the pipeline accepts (remux targets).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "webm", "flv", "m4v", "3gp",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Video,
    Unknown,
}

/// Lowercased extension without the dot, or empty string.
pub fn extension_lowercase(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

pub fn classify_media_type(path: &Path) -> MediaType {
    let ext = extension_lowercase(path);
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        MediaType::Image
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        MediaType::Video
    } else {
        MediaType::Unknown
    }
}

pub fn is_supported(path: &Path) -> bool {
    classify_media_type(path) != MediaType::Unknown
}

/// Hidden files (dot-prefixed final component) are skipped by the scan.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}
