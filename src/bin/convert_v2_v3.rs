//! V2 → V3 Storage Converter
//!
//! Offline conversion of legacy verbose JSONL trees into the compact
//! canonical layout. Request ids are preserved verbatim from the v2
//! metadata; a record with no request id fails conversion rather than
//! getting a synthesized one.
//!
//! Usage:
//!   cargo run --release --bin convert_v2_v3 -- --source storage/json/v2 --target storage/json/v3
//!   cargo run --release --bin convert_v2_v3 -- --source storage/json/v2 --target storage/json/v3 --dry-run

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tickstream_backend::types::{verbose_to_compact, TickMessage, VerboseRecord};

#[derive(Parser, Debug)]
#[command(name = "convert_v2_v3")]
#[command(about = "Convert legacy verbose JSONL storage to the compact canonical format")]
struct Cli {
    /// Root of the v2 JSONL tree to read
    #[arg(short, long)]
    source: PathBuf,

    /// Root where the v3 tree is written
    #[arg(short, long)]
    target: PathBuf,

    /// List the files that would be converted without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Write a JSON conversion report to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct FileStats {
    processed: u64,
    converted: u64,
    failed: u64,
    source_bytes: u64,
    target_bytes: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if !cli.source.is_dir() {
        bail!("source path is not a directory: {}", cli.source.display());
    }

    let files = find_jsonl_files(&cli.source)?;
    println!("found {} v2 files under {}", files.len(), cli.source.display());

    if cli.dry_run {
        let mut total: u64 = 0;
        for path in &files {
            let size = path.metadata().map(|m| m.len()).unwrap_or(0);
            total += size;
            println!("  {} ({:.2} MB)", path.display(), size as f64 / (1024.0 * 1024.0));
        }
        println!("total: {:.2} MB", total as f64 / (1024.0 * 1024.0));
        return Ok(());
    }

    let mut totals = FileStats::default();
    let mut reports = Vec::new();
    for path in &files {
        let relative = path.strip_prefix(&cli.source).unwrap_or(path);
        let target = cli.target.join(relative);
        let stats = convert_file(path, &target)
            .with_context(|| format!("converting {}", path.display()))?;

        totals.processed += stats.processed;
        totals.converted += stats.converted;
        totals.failed += stats.failed;
        totals.source_bytes += stats.source_bytes;
        totals.target_bytes += stats.target_bytes;
        reports.push(json!({
            "source": path.display().to_string(),
            "target": target.display().to_string(),
            "processed": stats.processed,
            "converted": stats.converted,
            "failed": stats.failed,
        }));
    }

    println!();
    println!("conversion summary");
    println!("  files:     {}", files.len());
    println!("  processed: {}", totals.processed);
    println!("  converted: {}", totals.converted);
    println!("  failed:    {}", totals.failed);
    if totals.source_bytes > 0 {
        let saved = 100.0 * (1.0 - totals.target_bytes as f64 / totals.source_bytes as f64);
        println!(
            "  size:      {:.2} MB -> {:.2} MB ({saved:.1}% saved)",
            totals.source_bytes as f64 / (1024.0 * 1024.0),
            totals.target_bytes as f64 / (1024.0 * 1024.0),
        );
    }

    if let Some(report_path) = cli.report {
        let report = json!({
            "files": reports,
            "totals": {
                "processed": totals.processed,
                "converted": totals.converted,
                "failed": totals.failed,
                "source_bytes": totals.source_bytes,
                "target_bytes": totals.target_bytes,
            },
        });
        std::fs::write(&report_path, serde_json::to_vec_pretty(&report)?)?;
        println!("report written to {}", report_path.display());
    }

    if totals.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn find_jsonl_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn convert_file(source: &Path, target: &Path) -> Result<FileStats> {
    let mut stats = FileStats {
        source_bytes: source.metadata().map(|m| m.len()).unwrap_or(0),
        ..FileStats::default()
    };

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(target)?);

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.processed += 1;

        match convert_line(line) {
            Ok(msg) => {
                serde_json::to_writer(&mut writer, &msg)?;
                writer.write_all(b"\n")?;
                stats.converted += 1;
            }
            Err(e) => {
                eprintln!("{}: {e}", source.display());
                stats.failed += 1;
            }
        }
    }

    writer.flush()?;
    stats.target_bytes = target.metadata().map(|m| m.len()).unwrap_or(0);
    println!(
        "{} -> {} ({} converted, {} failed)",
        source.display(),
        target.display(),
        stats.converted,
        stats.failed
    );
    Ok(stats)
}

fn convert_line(line: &str) -> Result<TickMessage> {
    let record: VerboseRecord = serde_json::from_str(line).context("unparseable v2 record")?;
    let st = chrono::DateTime::parse_from_rfc3339(&record.timestamp)
        .map(|dt| dt.timestamp_micros().max(0) as u64)
        .unwrap_or(0);
    let mut msg = verbose_to_compact(&record, st).map_err(|e| anyhow::anyhow!("{e}"))?;
    if st == 0 {
        msg.st = msg.ts;
    }
    Ok(msg)
}
