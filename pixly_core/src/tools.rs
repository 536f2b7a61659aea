//! External tool registry
//!
//! Locates the encoder and probe binaries on PATH once at startup. `cjxl`,
//! `avifenc` and `ffmpeg` are required; their absence aborts startup with an
//! install hint. `exiftool` is optional and only degrades metadata
//! preservation to timestamps. Tools are never re-probed mid-run; if one
//! disappears, the individual encoder invocation fails and is surfaced as a
//! per-file error.

use std::ffi::OsStr;
use std::path::PathBuf;

use crate::errors::FatalError;

#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub cjxl: Option<PathBuf>,
    pub djxl: Option<PathBuf>,
    pub avifenc: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
    pub exiftool: Option<PathBuf>,
}

impl ToolPaths {
    pub fn has_cjxl(&self) -> bool {
        self.cjxl.is_some()
    }

    pub fn has_djxl(&self) -> bool {
        self.djxl.is_some()
    }

    pub fn has_avifenc(&self) -> bool {
        self.avifenc.is_some()
    }

    pub fn has_ffmpeg(&self) -> bool {
        self.ffmpeg.is_some()
    }

    pub fn has_ffprobe(&self) -> bool {
        self.ffprobe.is_some()
    }

    pub fn has_exiftool(&self) -> bool {
        self.exiftool.is_some()
    }
}

const TOOLS: &[(&str, &str, bool)] = &[
    ("cjxl", "Install libjxl: brew install jpeg-xl (or apt install libjxl-tools)", true),
    ("djxl", "Install libjxl: brew install jpeg-xl (or apt install libjxl-tools)", false),
    ("avifenc", "Install libavif: brew install libavif (or apt install libavif-bin)", true),
    ("ffmpeg", "Install ffmpeg: brew install ffmpeg (or apt install ffmpeg)", true),
    ("ffprobe", "ffprobe ships with ffmpeg: brew install ffmpeg", false),
    ("exiftool", "Install exiftool for EXIF/XMP preservation: brew install exiftool", false),
];

/// Probe PATH for every tool. Fails fast when a required one is missing.
pub fn check_all_tools() -> Result<ToolPaths, FatalError> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    check_all_tools_in(&path_var, &cwd)
}

/// Same as [`check_all_tools`] but against an explicit search path.
pub fn check_all_tools_in(paths: &OsStr, cwd: &std::path::Path) -> Result<ToolPaths, FatalError> {
    let mut found: [Option<PathBuf>; 6] = Default::default();

    for (slot, (name, hint, required)) in TOOLS.iter().enumerate() {
        match which::which_in(name, Some(paths), cwd) {
            Ok(path) => {
                tracing::debug!(tool = name, path = %path.display(), "tool found");
                found[slot] = Some(path);
            }
            Err(_) if *required => {
                return Err(FatalError::ToolMissing {
                    tool: (*name).to_string(),
                    hint: (*hint).to_string(),
                });
            }
            Err(_) => {
                tracing::warn!(tool = name, "optional tool not found; {}", hint);
            }
        }
    }

    let [cjxl, djxl, avifenc, ffmpeg, ffprobe, exiftool] = found;
    Ok(ToolPaths {
        cjxl,
        djxl,
        avifenc,
        ffmpeg,
        ffprobe,
        exiftool,
    })
}
