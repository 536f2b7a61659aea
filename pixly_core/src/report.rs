//! Batch summary reporting

use std::time::Duration;

use crate::batch::ConversionRecap;

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

/// Overall size reduction as a percentage; 0 when nothing was converted.
pub fn size_reduction_percent(recap: &ConversionRecap) -> f64 {
    if recap.input_bytes == 0 {
        0.0
    } else {
        (1.0 - recap.output_bytes as f64 / recap.input_bytes as f64) * 100.0
    }
}

pub fn print_summary_report(recap: &ConversionRecap) {
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║              📊 Conversion Summary                   ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  📁 Files scanned:     {:>10}                    ║", recap.scanned);
    println!("║  ✅ Succeeded:         {:>10}                    ║", recap.succeeded);
    println!("║  ❌ Failed:            {:>10}                    ║", recap.failed);
    println!("║  ⏭️  Skipped:           {:>10}                    ║", recap.skipped);
    println!("╠══════════════════════════════════════════════════════╣");
    println!(
        "║  💾 Input size:        {:>10}                    ║",
        format_bytes(recap.input_bytes)
    );
    println!(
        "║  💾 Output size:       {:>10}                    ║",
        format_bytes(recap.output_bytes)
    );
    println!(
        "║  📉 Size reduction:    {:>9.1}%                    ║",
        size_reduction_percent(recap)
    );
    println!(
        "║  ⏱️  Total time:        {:>10}                    ║",
        format_duration(recap.elapsed)
    );
    println!("╚══════════════════════════════════════════════════════╝");

    if !recap.histogram.is_empty() {
        println!();
        println!("File types:");
        for (ext, count) in &recap.histogram {
            println!("   .{:<6} {:>6}", ext, count);
        }
    }

    if !recap.errors.is_empty() {
        println!();
        println!("❌ Errors ({} total, first {} shown):", recap.total_errors, recap.errors.len());
        for error in &recap.errors {
            println!("   {}", error);
        }
    }

    if recap.cancelled {
        println!();
        println!("⚠️  Run was cancelled; a resume point was saved.");
    }
}

pub fn print_simple_summary(recap: &ConversionRecap) {
    println!(
        "\n✅ Complete: {} succeeded, {} failed, {} skipped (scanned {}, saved {})",
        recap.succeeded,
        recap.failed,
        recap.skipped,
        recap.scanned,
        format_bytes(recap.input_bytes.saturating_sub(recap.output_bytes)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn recap() -> ConversionRecap {
        ConversionRecap {
            scanned: 10,
            succeeded: 8,
            failed: 1,
            skipped: 1,
            input_bytes: 10 * 1024 * 1024,
            output_bytes: 4 * 1024 * 1024,
            elapsed: Duration::from_secs(65),
            histogram: BTreeMap::new(),
            errors: Vec::new(),
            total_errors: 1,
            cancelled: false,
            resumed_from: None,
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(1_572_864), "1.5 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(2_500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m05s");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1h02m05s");
    }

    #[test]
    fn test_size_reduction() {
        let recap = recap();
        assert!((size_reduction_percent(&recap) - 60.0).abs() < 0.01);
    }

    #[test]
    fn test_size_reduction_empty_batch() {
        let mut recap = recap();
        recap.input_bytes = 0;
        recap.output_bytes = 0;
        assert_eq!(size_reduction_percent(&recap), 0.0);
    }
}
