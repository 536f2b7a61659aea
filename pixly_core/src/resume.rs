//! Resume points
//!
//! One serialized [`ResumePoint`] per batch, keyed by the input directory
//! and stored in the app directory. Written at batch start, every N
//! processed files, and on graceful cancellation; cleared on clean
//! completion. After any persisted point, every file listed in
//! `processed_files` either has its outcome durably on disk or will be
//! skipped on resume.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePoint {
    pub input_dir: String,
    pub output_dir: Option<String>,
    pub in_place: bool,
    pub all_files: Vec<String>,
    pub processed_files: Vec<String>,
    pub success_count: u64,
    pub fail_count: u64,
    pub skip_count: u64,
    pub last_file: Option<String>,
    pub timestamp: String,
}

impl ResumePoint {
    pub fn new(input_dir: &Path, output_dir: Option<&Path>, in_place: bool) -> Self {
        Self {
            input_dir: input_dir.display().to_string(),
            output_dir: output_dir.map(|p| p.display().to_string()),
            in_place,
            all_files: Vec::new(),
            processed_files: Vec::new(),
            success_count: 0,
            fail_count: 0,
            skip_count: 0,
            last_file: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn processed_set(&self) -> HashSet<String> {
        self.processed_files.iter().cloned().collect()
    }

    pub fn processed_count(&self) -> usize {
        self.processed_files.len()
    }
}

pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Store under the app directory (`~/.pixly/resume`).
    pub fn default_location() -> Self {
        Self::new(crate::config::app_dir().join("resume"))
    }

    fn point_path(&self, input_dir: &Path) -> PathBuf {
        self.dir
            .join(format!("resume_{}.json", hash_path(input_dir)))
    }

    /// Load the point for `input_dir`, if one exists and actually belongs to
    /// that directory (the key is a hash, so verify before trusting it).
    pub fn load(&self, input_dir: &Path) -> Option<ResumePoint> {
        let path = self.point_path(input_dir);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<ResumePoint>(&content) {
            Ok(point) if point.input_dir == input_dir.display().to_string() => Some(point),
            Ok(_) => {
                tracing::warn!("resume point at {} is for another directory; ignoring", path.display());
                None
            }
            Err(e) => {
                tracing::warn!("corrupt resume point at {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, point: &ResumePoint) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.point_path(Path::new(&point.input_dir));
        let json = serde_json::to_string_pretty(point)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Write-then-rename keeps a crash from leaving a torn point behind.
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, json)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    pub fn clear(&self, input_dir: &Path) -> io::Result<()> {
        let path = self.point_path(input_dir);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn exists(&self, input_dir: &Path) -> bool {
        self.load(input_dir).is_some()
    }
}

fn hash_path(path: &Path) -> String {
    let hash = blake3::hash(path.display().to_string().as_bytes());
    hash.to_hex()[..12].to_string()
}
