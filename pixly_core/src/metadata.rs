//! Metadata preservation
//!
//! Two independent best-effort layers: content metadata (EXIF/XMP/GPS/ICC
//! copied through exiftool) and filesystem metadata (timestamps, extended
//! attributes). Neither layer can fail a conversion; the outcome is reported
//! so reversible paths can annotate their record when tags were lost.
//! exiftool rewrites the destination, so timestamps are always applied last.

use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use crate::tools::ToolPaths;

/// What actually survived the copy. Consumed by the record writer.
#[derive(Debug, Clone, Copy)]
pub struct MetadataOutcome {
    pub content_metadata_ok: bool,
    pub timestamps_ok: bool,
    pub xattrs_copied: usize,
}

impl MetadataOutcome {
    pub fn preserved(&self) -> bool {
        self.content_metadata_ok
    }
}

/// Copy everything we can from `src` to `dst`.
pub fn preserve_metadata(tools: &ToolPaths, src: &Path, dst: &Path) -> MetadataOutcome {
    let content_metadata_ok = copy_content_metadata(tools, src, dst);
    let xattrs_copied = copy_xattrs(src, dst);
    // Timestamps last: both exiftool and the xattr writes touch mtime.
    let timestamps_ok = apply_file_timestamps(src, dst);

    MetadataOutcome {
        content_metadata_ok,
        timestamps_ok,
        xattrs_copied,
    }
}

/// EXIF/XMP/GPS/ICC via exiftool. Degrades to a warning (once per process)
/// when the tool is absent.
fn copy_content_metadata(tools: &ToolPaths, src: &Path, dst: &Path) -> bool {
    let Some(exiftool) = tools.exiftool.as_deref() else {
        static WARNED: OnceLock<()> = OnceLock::new();
        WARNED.get_or_init(|| {
            tracing::warn!("exiftool not found; EXIF/XMP will not be preserved");
        });
        return false;
    };

    let output = Command::new(exiftool)
        .arg("-overwrite_original")
        .arg("-TagsFromFile")
        .arg(src)
        .arg(dst)
        .output();

    match output {
        Ok(out) if out.status.success() => true,
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            // exiftool reports minor issues on stderr with exit 0; a nonzero
            // exit with only warnings still leaves usable tags behind.
            if stderr.contains("Warning") && !stderr.contains("Error") {
                tracing::debug!(src = %src.display(), "exiftool finished with warnings: {}", stderr.trim());
                true
            } else {
                tracing::warn!(src = %src.display(), "exiftool failed: {}", stderr.trim());
                false
            }
        }
        Err(e) => {
            tracing::warn!(src = %src.display(), "exiftool spawn failed: {}", e);
            false
        }
    }
}

/// Restore the source's access/modification times on the destination. On
/// platforms with a creation-time API the metadata call covers it too.
pub fn apply_file_timestamps(src: &Path, dst: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(src) else {
        return false;
    };
    let atime = filetime::FileTime::from_last_access_time(&meta);
    let mtime = filetime::FileTime::from_last_modification_time(&meta);
    match filetime::set_file_times(dst, atime, mtime) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(dst = %dst.display(), "failed to set file times: {}", e);
            false
        }
    }
}

/// Mirror extended attributes (platform tags, comments). Absence or failure
/// of any single attribute is tolerated; returns how many were copied.
#[cfg(unix)]
fn copy_xattrs(src: &Path, dst: &Path) -> usize {
    let Ok(names) = xattr::list(src) else {
        return 0;
    };
    let mut copied = 0;
    for name in names {
        match xattr::get(src, &name) {
            Ok(Some(value)) => {
                if xattr::set(dst, &name, &value).is_ok() {
                    copied += 1;
                } else {
                    tracing::debug!(attr = ?name, "xattr copy failed");
                }
            }
            _ => {}
        }
    }
    copied
}

#[cfg(not(unix))]
fn copy_xattrs(_src: &Path, _dst: &Path) -> usize {
    0
}
