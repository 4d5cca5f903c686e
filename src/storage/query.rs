//! Bounded range scans over the partitioned store.
//!
//! Scans run on a blocking thread and stream records through a bounded
//! channel; files are read sequentially and never loaded whole. Records
//! from different tick types are merged by ascending `ts`, stable on the
//! tick-type order given in the query. A partition that is concurrently
//! being written is safe to read: a partial trailing record is skipped and
//! counted.

use chrono::DateTime;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::storage::backend::{BackendStats, RangeQuery};
use crate::storage::partition::{partitions_in_range, BackendKind, Encoding, Schema};
use crate::storage::record::{self, FrameOutcome, ReadOutcome};
use crate::types::{verbose_to_compact, TickMessage, TickType, VerboseRecord};

/// Scan the backend tree for `query`, sending matches in `ts` order until
/// the limit is reached or the receiver goes away.
pub fn scan_range(
    base_dir: &Path,
    kind: BackendKind,
    query: &RangeQuery,
    stats: &BackendStats,
    tx: mpsc::Sender<TickMessage>,
) {
    let mut scanners: Vec<TickScanner> = query
        .tick_types
        .iter()
        .map(|&tt| TickScanner::new(base_dir, kind, query, tt, stats))
        .collect();
    let mut heads: Vec<Option<TickMessage>> = scanners.iter_mut().map(|s| s.next()).collect();

    let limit = query.limit.unwrap_or(usize::MAX);
    let mut emitted = 0usize;

    while emitted < limit {
        // Stable min-merge: the first tick type wins ties.
        let mut best: Option<usize> = None;
        for (i, head) in heads.iter().enumerate() {
            if let Some(msg) = head {
                if best.map_or(true, |b| msg.ts < heads[b].as_ref().map(|m| m.ts).unwrap_or(u64::MAX)) {
                    best = Some(i);
                }
            }
        }
        let Some(i) = best else { break };
        let msg = heads[i].take().unwrap_or_else(|| unreachable!());
        heads[i] = scanners[i].next();

        if tx.blocking_send(msg).is_err() {
            return;
        }
        emitted += 1;
    }
}

/// Sequential scanner over one (cid, tt)'s hour partitions.
struct TickScanner<'a> {
    kind: BackendKind,
    files: VecDeque<PathBuf>,
    current: Option<BufReader<File>>,
    start_micros: u64,
    end_micros: u64,
    stats: &'a BackendStats,
}

impl<'a> TickScanner<'a> {
    fn new(
        base_dir: &Path,
        kind: BackendKind,
        query: &RangeQuery,
        tt: TickType,
        stats: &'a BackendStats,
    ) -> Self {
        let mut files = VecDeque::new();
        for key in partitions_in_range(query.cid, tt, query.start_micros, query.end_micros) {
            let dir = key.dir(base_dir);
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut names: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.extension()
                        .map(|e| e == kind.encoding.extension())
                        .unwrap_or(false)
                })
                .collect();
            names.sort();
            files.extend(names);
        }

        Self {
            kind,
            files,
            current: None,
            start_micros: query.start_micros,
            end_micros: query.end_micros,
            stats,
        }
    }

    fn next(&mut self) -> Option<TickMessage> {
        loop {
            if self.current.is_none() {
                let path = self.files.pop_front()?;
                match File::open(&path) {
                    Ok(file) => {
                        debug!(path = %path.display(), "scanning partition file");
                        self.current = Some(BufReader::new(file));
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to open partition file");
                        continue;
                    }
                }
            }

            let reader = self.current.as_mut()?;
            match self.kind.encoding {
                Encoding::Json => match next_json_record(reader, self.kind.schema, self.stats) {
                    Some(msg) => {
                        if msg.ts >= self.start_micros && msg.ts <= self.end_micros {
                            return Some(msg);
                        }
                    }
                    None => self.current = None,
                },
                Encoding::Protobuf => match next_binary_record(reader, self.kind.schema, self.stats) {
                    Some(msg) => {
                        if msg.ts >= self.start_micros && msg.ts <= self.end_micros {
                            return Some(msg);
                        }
                    }
                    None => self.current = None,
                },
            }
        }
    }
}

/// Recover the system receive time recorded in a verbose envelope.
fn verbose_receive_micros(record: &VerboseRecord, fallback: u64) -> u64 {
    DateTime::parse_from_rfc3339(&record.timestamp)
        .map(|dt| dt.timestamp_micros().max(0) as u64)
        .unwrap_or(fallback)
}

fn compact_from_verbose_line(line: &str) -> Option<TickMessage> {
    let record: VerboseRecord = serde_json::from_str(line).ok()?;
    let st = verbose_receive_micros(&record, 0);
    let mut msg = verbose_to_compact(&record, st).ok()?;
    if st == 0 {
        msg.st = msg.ts;
    }
    Some(msg)
}

/// Next record from a JSONL file, or `None` at end of file. An unterminated
/// last line is treated as a truncated tail and skipped.
fn next_json_record(
    reader: &mut BufReader<File>,
    schema: Schema,
    stats: &BackendStats,
) -> Option<TickMessage> {
    loop {
        let mut line = String::new();
        let n = match reader.read_line(&mut line) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "partition read error");
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if !line.ends_with('\n') {
            stats.truncated_tails.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        let parsed = match schema {
            Schema::V3 => serde_json::from_str::<TickMessage>(line).ok(),
            Schema::V2 => compact_from_verbose_line(line),
        };
        match parsed {
            Some(msg) => return Some(msg),
            None => {
                stats.truncated_tails.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }
    }
}

/// Next record from a length-prefixed binary file, or `None` at end of file.
fn next_binary_record(
    reader: &mut BufReader<File>,
    schema: Schema,
    stats: &BackendStats,
) -> Option<TickMessage> {
    loop {
        match schema {
            Schema::V3 => match record::read_framed(reader) {
                Ok(ReadOutcome::Record(msg)) => return Some(msg),
                Ok(ReadOutcome::Eof) => return None,
                Ok(ReadOutcome::TruncatedTail) => {
                    stats.truncated_tails.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "corrupt binary record; stopping file scan");
                    stats.truncated_tails.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            },
            Schema::V2 => match record::read_frame(reader) {
                FrameOutcome::Payload(payload) => {
                    match std::str::from_utf8(&payload)
                        .ok()
                        .and_then(compact_from_verbose_line)
                    {
                        Some(msg) => return Some(msg),
                        None => {
                            stats.truncated_tails.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    }
                }
                FrameOutcome::Eof => return None,
                FrameOutcome::TruncatedTail => {
                    stats.truncated_tails.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            },
        }
    }
}
