//! dataset_verify - offline audit of a recorded driving dataset
//!
//! This tool checks:
//! - The control log carries the expected header
//! - Every row parses into three file names and three numeric controls
//!   (`NaN` and `inf` are accepted as recorded)
//! - Every referenced image exists and decodes
//! - Frame ids advance without gaps inside each session
//!
//! It never modifies the dataset.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use drive_ingest::dataset::audit;

#[derive(Parser, Debug)]
#[command(
    name = "dataset_verify",
    about = "Verify that a recorded dataset is complete and joinable"
)]
struct Args {
    /// Directory holding the camera images
    #[arg(long, env = "INGEST_IMAGE_DIR", default_value = "images")]
    image_dir: PathBuf,

    /// Control log (CSV)
    #[arg(long, env = "INGEST_LOG_PATH", default_value = "controls.csv")]
    log_path: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!(
        "dataset_verify: checking {} against {}",
        args.log_path.display(),
        args.image_dir.display()
    );
    println!();

    let report = audit(&args.image_dir, &args.log_path)?;

    println!("=== Rows ===");
    println!(
        "{} rows in {} session(s), {} with neutral controls",
        report.rows, report.sessions, report.neutral_rows
    );
    if !report.malformed.is_empty() {
        println!("WARNING: {} malformed rows", report.malformed.len());
        for (line, reason) in &report.malformed {
            println!("  line {}: {}", line, reason);
        }
    }
    println!();

    println!("=== Images ===");
    if report.image_problems.is_empty() {
        println!("all referenced images present and decodable");
    } else {
        println!(
            "WARNING: {} image problems across {} rows",
            report.image_problems.len(),
            report.broken_rows()
        );
        let shown = if args.verbose {
            report.image_problems.len()
        } else {
            10
        };
        for problem in report.image_problems.iter().take(shown) {
            println!("  line {}: {} {}", problem.line, problem.file, problem.reason);
        }
        if report.image_problems.len() > shown {
            println!("  ... (use --verbose for all)");
        }
    }
    println!();

    println!("=== Sequence ===");
    if report.sequence_gaps.is_empty() {
        println!("frame ids contiguous within every session");
    } else {
        for (line, expected, found) in &report.sequence_gaps {
            println!(
                "  line {}: expected frame {} but found {}",
                line, expected, found
            );
        }
    }
    println!();

    if !report.is_clean() {
        return Err(anyhow!(
            "dataset has {} broken row(s) and {} sequence gap(s)",
            report.broken_rows(),
            report.sequence_gaps.len()
        ));
    }
    println!("OK: dataset verified.");
    Ok(())
}
