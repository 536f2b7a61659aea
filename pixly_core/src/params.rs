//! Conversion parameter sets
//!
//! `ConversionParams` is the value object handed to the encoder layer. Each
//! target carries its own knobs; `validate` enforces the per-target
//! invariants so an inconsistent set never reaches an encoder.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Jxl,
    Avif,
    Mov,
    Webp,
}

impl TargetFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Jxl => "jxl",
            TargetFormat::Avif => "avif",
            TargetFormat::Mov => "mov",
            TargetFormat::Webp => "webp",
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.extension()
    }
}

impl std::fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for TargetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jxl" => Ok(TargetFormat::Jxl),
            "avif" => Ok(TargetFormat::Avif),
            "mov" => Ok(TargetFormat::Mov),
            "webp" => Ok(TargetFormat::Webp),
            other => Err(format!("unknown target format: {}", other)),
        }
    }
}

/// One encoder invocation's parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionParams {
    pub target_format: TargetFormat,

    // JXL
    pub lossless: bool,
    /// Perceptual error budget; 0.0 is mathematically lossless.
    pub distance: f32,
    /// 1 (fastest) .. 9 (best).
    pub effort: u8,
    /// JPEG bitstream-reconstruction transcode.
    pub lossless_jpeg: bool,

    // AVIF
    pub crf: u8,
    pub speed: u8,

    // MOV
    pub repackage: bool,
    pub copy_codec: bool,

    // Shared
    pub quality: u8,
    pub threads: usize,
    pub preserve_alpha: bool,
}

impl Default for ConversionParams {
    fn default() -> Self {
        Self {
            target_format: TargetFormat::Jxl,
            lossless: false,
            distance: 1.0,
            effort: 7,
            lossless_jpeg: false,
            crf: 0,
            speed: 0,
            repackage: false,
            copy_codec: false,
            quality: 0,
            threads: 0,
            preserve_alpha: true,
        }
    }
}

impl ConversionParams {
    /// Mathematically lossless JXL.
    pub fn jxl_lossless(effort: u8) -> Self {
        Self {
            target_format: TargetFormat::Jxl,
            lossless: true,
            distance: 0.0,
            effort,
            ..Self::default()
        }
    }

    /// Lossy JXL at a given distance.
    pub fn jxl_distance(distance: f32, effort: u8) -> Self {
        Self {
            target_format: TargetFormat::Jxl,
            lossless: distance == 0.0,
            distance,
            effort,
            ..Self::default()
        }
    }

    /// JPEG-reversible JXL transcode.
    pub fn jxl_reversible(effort: u8) -> Self {
        Self {
            target_format: TargetFormat::Jxl,
            lossless: true,
            lossless_jpeg: true,
            distance: 0.0,
            effort,
            ..Self::default()
        }
    }

    pub fn avif(crf: u8, speed: u8) -> Self {
        Self {
            target_format: TargetFormat::Avif,
            crf,
            speed,
            lossless: false,
            distance: 1.0,
            effort: 0,
            ..Self::default()
        }
    }

    /// Container remux, no re-encode.
    pub fn mov_remux() -> Self {
        Self {
            target_format: TargetFormat::Mov,
            repackage: true,
            copy_codec: true,
            lossless: true,
            distance: 0.0,
            effort: 0,
            ..Self::default()
        }
    }

    pub fn webp(quality: u8) -> Self {
        Self {
            target_format: TargetFormat::Webp,
            quality,
            lossless: false,
            distance: 0.0,
            effort: 0,
            ..Self::default()
        }
    }

    /// Enforce the per-target invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self.target_format {
            TargetFormat::Jxl => {
                if self.lossless && self.distance != 0.0 {
                    return Err(format!(
                        "lossless jxl requires distance=0, got {}",
                        self.distance
                    ));
                }
                if !(0.0..=15.0).contains(&self.distance) {
                    return Err(format!("jxl distance out of range: {}", self.distance));
                }
                if !(1..=9).contains(&self.effort) {
                    return Err(format!("jxl effort out of range: {}", self.effort));
                }
            }
            TargetFormat::Avif => {
                if self.crf > 63 {
                    return Err(format!("avif crf out of range: {}", self.crf));
                }
                if self.speed > 10 {
                    return Err(format!("avif speed out of range: {}", self.speed));
                }
                if self.lossless_jpeg {
                    return Err("lossless_jpeg only applies to jxl".to_string());
                }
            }
            TargetFormat::Mov => {
                if !(self.repackage && self.copy_codec) {
                    return Err("mov target requires repackage and copy_codec".to_string());
                }
            }
            TargetFormat::Webp => {
                if self.quality > 100 {
                    return Err(format!("webp quality out of range: {}", self.quality));
                }
            }
        }
        if self.lossless_jpeg && self.target_format != TargetFormat::Jxl {
            return Err("lossless_jpeg only applies to jxl".to_string());
        }
        Ok(())
    }

    /// Stable key for exploration result maps and logs,
    /// e.g. `jxl:d0:e7`, `avif:crf35:s6`.
    pub fn key(&self) -> String {
        match self.target_format {
            TargetFormat::Jxl => {
                if self.lossless_jpeg {
                    format!("jxl:jpegr:e{}", self.effort)
                } else {
                    format!("jxl:d{}:e{}", self.distance, self.effort)
                }
            }
            TargetFormat::Avif => format!("avif:crf{}:s{}", self.crf, self.speed),
            TargetFormat::Mov => "mov:remux".to_string(),
            TargetFormat::Webp => format!("webp:q{}", self.quality),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jxl_lossless_invariant() {
        let params = ConversionParams::jxl_lossless(7);
        assert!(params.lossless);
        assert_eq!(params.distance, 0.0);
        assert!(params.validate().is_ok());

        let mut broken = params.clone();
        broken.distance = 1.0;
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_jxl_reversible_implies_lossless() {
        let params = ConversionParams::jxl_reversible(7);
        assert!(params.lossless_jpeg);
        assert!(params.lossless);
        assert_eq!(params.distance, 0.0);
        assert_eq!(params.target_format, TargetFormat::Jxl);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_lossless_jpeg_rejected_outside_jxl() {
        let mut params = ConversionParams::avif(35, 6);
        params.lossless_jpeg = true;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_mov_requires_repackage_and_copy() {
        let params = ConversionParams::mov_remux();
        assert!(params.validate().is_ok());

        let mut broken = params.clone();
        broken.copy_codec = false;
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_avif_ranges() {
        assert!(ConversionParams::avif(63, 10).validate().is_ok());
        assert!(ConversionParams::avif(64, 6).validate().is_err());
        assert!(ConversionParams::avif(35, 11).validate().is_err());
    }

    #[test]
    fn test_effort_range() {
        assert!(ConversionParams::jxl_lossless(0).validate().is_err());
        assert!(ConversionParams::jxl_lossless(10).validate().is_err());
        for effort in 1..=9 {
            assert!(ConversionParams::jxl_lossless(effort).validate().is_ok());
        }
    }

    #[test]
    fn test_target_extension() {
        assert_eq!(TargetFormat::Jxl.extension(), "jxl");
        assert_eq!(TargetFormat::Avif.extension(), "avif");
        assert_eq!(TargetFormat::Mov.extension(), "mov");
        assert_eq!(TargetFormat::Webp.extension(), "webp");
    }

    #[test]
    fn test_param_keys_distinct() {
        let a = ConversionParams::jxl_lossless(7).key();
        let b = ConversionParams::jxl_lossless(9).key();
        let c = ConversionParams::jxl_reversible(7).key();
        let d = ConversionParams::avif(35, 6).key();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(d, "avif:crf35:s6");
    }

    #[test]
    fn test_target_format_parse() {
        assert_eq!("jxl".parse::<TargetFormat>().unwrap(), TargetFormat::Jxl);
        assert_eq!("AVIF".parse::<TargetFormat>().unwrap(), TargetFormat::Avif);
        assert!("exr".parse::<TargetFormat>().is_err());
    }
}
