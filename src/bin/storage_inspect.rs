//! Storage Inspection Tool
//!
//! Walks a storage root and reports partition inventory and data freshness:
//! which (backend, contract, tick type) combinations exist, how many files
//! and bytes each holds, and the age of the newest file.
//!
//! Usage:
//!   cargo run --release --bin storage_inspect -- --root storage
//!   cargo run --release --bin storage_inspect -- --root storage --json

use anyhow::{bail, Result};
use clap::Parser;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Parser, Debug)]
#[command(name = "storage_inspect")]
#[command(about = "Inspect a tick storage tree: partitions, sizes, freshness")]
struct Cli {
    /// Storage root (the directory holding <encoding>/<schema>/... trees)
    #[arg(short, long, default_value = "storage")]
    root: PathBuf,

    /// Emit machine-readable JSON instead of the table
    #[arg(long)]
    json: bool,
}

#[derive(Debug)]
struct BackendReport {
    backend: String,
    contracts: Vec<ContractReport>,
}

#[derive(Debug)]
struct ContractReport {
    cid: String,
    tick_type: String,
    files: u64,
    bytes: u64,
    newest_age_seconds: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if !cli.root.is_dir() {
        bail!("storage root not found: {}", cli.root.display());
    }

    let mut reports = Vec::new();
    for encoding in list_dirs(&cli.root)? {
        for schema in list_dirs(&encoding)? {
            let backend = format!(
                "{}/{}",
                dir_name(&encoding),
                dir_name(&schema)
            );
            let mut contracts = Vec::new();
            for cid_dir in list_dirs(&schema)? {
                for tt_dir in list_dirs(&cid_dir)? {
                    let (files, bytes, newest) = walk_partition_tree(&tt_dir)?;
                    contracts.push(ContractReport {
                        cid: dir_name(&cid_dir),
                        tick_type: dir_name(&tt_dir),
                        files,
                        bytes,
                        newest_age_seconds: newest,
                    });
                }
            }
            contracts.sort_by(|a, b| (a.cid.clone(), a.tick_type.clone()).cmp(&(b.cid.clone(), b.tick_type.clone())));
            reports.push(BackendReport { backend, contracts });
        }
    }

    if cli.json {
        let value = json!(reports
            .iter()
            .map(|r| {
                json!({
                    "backend": r.backend,
                    "contracts": r.contracts.iter().map(|c| json!({
                        "cid": c.cid,
                        "tick_type": c.tick_type,
                        "files": c.files,
                        "bytes": c.bytes,
                        "newest_age_seconds": c.newest_age_seconds,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>());
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for report in &reports {
        println!("{}", report.backend);
        if report.contracts.is_empty() {
            println!("  (empty)");
            continue;
        }
        for c in &report.contracts {
            let age = match c.newest_age_seconds {
                Some(age) => format!("{age}s ago"),
                None => "never".to_string(),
            };
            println!(
                "  {:>12} {:<10} {:>6} files {:>12} bytes  newest {}",
                c.cid, c.tick_type, c.files, c.bytes, age
            );
        }
    }
    Ok(())
}

fn list_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Count files/bytes under one (cid, tt) tree and find the newest mtime.
fn walk_partition_tree(root: &Path) -> Result<(u64, u64, Option<u64>)> {
    let mut files = 0u64;
    let mut bytes = 0u64;
    let mut newest: Option<SystemTime> = None;

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = path.metadata() {
                files += 1;
                bytes += meta.len();
                if let Ok(modified) = meta.modified() {
                    newest = Some(match newest {
                        Some(t) if t > modified => t,
                        _ => modified,
                    });
                }
            }
        }
    }

    let age = newest.and_then(|t| SystemTime::now().duration_since(t).ok().map(|d| d.as_secs()));
    Ok((files, bytes, age))
}
