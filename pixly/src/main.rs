use clap::{Parser, Subcommand};
use console::style;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use pixly_core::batch::{BatchDriver, BatchOptions, DEFAULT_FILE_TIMEOUT};
use pixly_core::optimizer::BalanceOptimizer;
use pixly_core::progress::{AutoConfirm, ConfirmHook, NullProgress, ProgressSink, TerminalProgress};
use pixly_core::{
    check_all_tools, default_knowledge_path, Config, KnowledgeStore, ResumeStore,
};

#[derive(Parser)]
#[command(name = "pixly")]
#[command(version, about = "Batch media recompression - JXL/AVIF/MOV with a learning knowledge base", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert every supported file under a directory
    Run {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Write converted files under this directory instead of replacing
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Replace originals atomically (two-rename with backup)
        #[arg(long)]
        in_place: bool,

        /// Worker pool width (0 = auto)
        #[arg(long, default_value_t = 0)]
        workers: usize,

        /// Per-file timeout in seconds
        #[arg(long, default_value_t = DEFAULT_FILE_TIMEOUT.as_secs())]
        timeout: u64,

        /// Disable the knowledge base for this run
        #[arg(long)]
        no_knowledge: bool,

        /// Disable exploration of low-confidence predictions
        #[arg(long)]
        no_explore: bool,

        /// Ignore any resume point and start fresh
        #[arg(long)]
        no_resume: bool,

        /// Answer yes to prompts (resume confirmation)
        #[arg(short = 'y', long)]
        yes: bool,

        /// Config file (default: ~/.pixly/config.yaml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Plain output, no progress bar
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show knowledge base statistics
    Stats {
        /// Print as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Check the external encoder/probe binaries
    Tools,
}

/// Interactive yes/no with a timeout; a silent terminal declines.
struct TerminalConfirm;

impl ConfirmHook for TerminalConfirm {
    fn confirm(&self, prompt: &str, timeout: Duration) -> bool {
        eprint!("{} [y/N] ", style(prompt).yellow());
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            let _ = tx.send(line);
        });
        match rx.recv_timeout(timeout) {
            Ok(line) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(_) => {
                eprintln!();
                eprintln!("{}", style("No answer; starting fresh.").dim());
                false
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let log_dir = pixly_core::config::app_dir().join("logs");
    let _log_guard = pixly_core::init_logging(
        "pixly",
        pixly_core::LogConfig::default().with_log_dir(log_dir),
    )?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            input,
            output,
            in_place,
            workers,
            timeout,
            no_knowledge,
            no_explore,
            no_resume,
            yes,
            config,
            quiet,
        } => run(
            input, output, in_place, workers, timeout, no_knowledge, no_explore, no_resume, yes,
            config, quiet,
        ),
        Commands::Stats { json } => stats(json),
        Commands::Tools => tools_doctor(),
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    input: PathBuf,
    output: Option<PathBuf>,
    in_place: bool,
    workers: usize,
    timeout: u64,
    no_knowledge: bool,
    no_explore: bool,
    no_resume: bool,
    yes: bool,
    config_path: Option<PathBuf>,
    quiet: bool,
) -> anyhow::Result<()> {
    if output.is_none() && !in_place {
        anyhow::bail!("choose an output mode: --output <DIR> or --in-place");
    }

    let mut config = match config_path {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load_default(),
    };
    if no_explore {
        config.conversion.predictor.enable_exploration = false;
    }
    if no_knowledge {
        config.conversion.predictor.enable_knowledge_base = false;
    }

    let tools = check_all_tools()?;

    let mut optimizer = BalanceOptimizer::new(tools, config.clone());
    if !no_knowledge {
        match KnowledgeStore::open(&default_knowledge_path()) {
            Ok(store) => optimizer = optimizer.with_knowledge(Arc::new(store)),
            Err(e) => {
                tracing::warn!("knowledge base unavailable, continuing without: {}", e);
                eprintln!("{} {}", style("⚠️ knowledge base unavailable:").yellow(), e);
            }
        }
    }

    // Ctrl-C flips the cancel token; workers drain and a resume point is saved.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("\n{}", style("Cancelling; finishing in-flight files...").yellow());
            cancel.store(true, Ordering::Relaxed);
        })?;
    }

    let mut options = if let Some(output_dir) = output {
        BatchOptions::to_directory(input.clone(), output_dir)
    } else {
        BatchOptions::in_place(input.clone())
    };
    options.workers = workers;
    options.file_timeout = Duration::from_secs(timeout.max(1));
    options.resume = !no_resume;

    let (files, _) = pixly_core::scan_directory(&input);
    let progress: Arc<dyn ProgressSink> = if quiet {
        Arc::new(NullProgress)
    } else {
        Arc::new(pixly_core::progress::RateLimited::new(TerminalProgress::new(
            files.len() as u64,
        )))
    };

    let confirm: Box<dyn ConfirmHook> = if yes {
        Box::new(AutoConfirm(true))
    } else {
        Box::new(TerminalConfirm)
    };

    let driver = BatchDriver::new(optimizer, config).with_resume_store(ResumeStore::default_location());
    let recap = driver.convert_directory(&options, progress, confirm.as_ref(), cancel)?;

    if quiet {
        pixly_core::print_simple_summary(&recap);
    } else {
        pixly_core::print_summary_report(&recap);
    }

    if recap.failed > 0 && recap.succeeded == 0 && recap.scanned > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn stats(json: bool) -> anyhow::Result<()> {
    let store = KnowledgeStore::open(&default_knowledge_path())?;
    let summary = store.get_stats_summary();
    let combinations = store.get_format_combinations();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "summary": summary,
                "combinations": combinations,
            }))?
        );
        return Ok(());
    }

    println!("{}", style("Knowledge base").bold());
    println!("  Conversions recorded:  {}", summary.total_conversions);
    println!("  Average saving:        {:.1}%", summary.avg_saving * 100.0);
    println!("  Quality pass rate:     {:.1}%", summary.quality_pass_rate * 100.0);
    println!(
        "  Avg prediction error:  {:.3}",
        summary.avg_prediction_error
    );

    if !combinations.is_empty() {
        println!();
        println!(
            "{}",
            style(format!(
                "{:<10} {:<8} {:>10} {:>12} {:>8}",
                "source", "target", "avg saving", "success rate", "samples"
            ))
            .dim()
        );
        for combo in combinations {
            println!(
                "{:<10} {:<8} {:>9.1}% {:>11.1}% {:>8}",
                combo.source,
                combo.target.to_string(),
                combo.avg_saving * 100.0,
                combo.success_rate * 100.0,
                combo.sample_count
            );
        }
    }
    Ok(())
}

fn tools_doctor() -> anyhow::Result<()> {
    match check_all_tools() {
        Ok(tools) => {
            let rows = [
                ("cjxl", tools.cjxl.as_ref()),
                ("djxl", tools.djxl.as_ref()),
                ("avifenc", tools.avifenc.as_ref()),
                ("ffmpeg", tools.ffmpeg.as_ref()),
                ("ffprobe", tools.ffprobe.as_ref()),
                ("exiftool", tools.exiftool.as_ref()),
            ];
            for (name, path) in rows {
                match path {
                    Some(path) => {
                        println!("{} {:<10} {}", style("✅").green(), name, path.display())
                    }
                    None => println!("{} {:<10} not found", style("⚠️").yellow(), name),
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", style("❌").red(), e);
            std::process::exit(1);
        }
    }
}
