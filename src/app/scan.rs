use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::config::ScanConfig;
use super::data_io::{LineLog, for_each_line, read_json, write_json_atomic};
use super::error::{ScanError, StorageError, StorageResult};
use super::fetch::{FetchPurpose, PoliteFetcher};
use super::urls::{extract_urls, host_of, is_platform_host, normalize_crawl_url};

const STOP_CHECK_LINES: u64 = 4_096;
const READ_BUFFER_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardRef {
    Local(PathBuf),
    Remote(String),
}

impl ShardRef {
    pub fn from_manifest_entry(entry: &str, base_url: &str) -> Self {
        if entry.starts_with("http://") || entry.starts_with("https://") {
            return ShardRef::Remote(entry.to_string());
        }
        let path = PathBuf::from(entry);
        if path.exists() {
            return ShardRef::Local(path);
        }
        ShardRef::Remote(format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            entry.trim_start_matches('/')
        ))
    }

    fn is_gzip(&self) -> bool {
        let name = match self {
            ShardRef::Local(path) => path.to_string_lossy().into_owned(),
            ShardRef::Remote(url) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
        };
        name.to_ascii_lowercase().ends_with(".gz")
    }
}

#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub id: String,
    pub shard: ShardRef,
}

pub fn load_manifest(path: &Path, base_url: &str) -> StorageResult<Vec<ManifestEntry>> {
    if !path.exists() {
        return Err(StorageError::io(
            path,
            io::Error::new(io::ErrorKind::NotFound, "manifest not found"),
        ));
    }
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    for_each_line(path, |line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        if seen.insert(line.to_string()) {
            entries.push(ManifestEntry {
                id: line.to_string(),
                shard: ShardRef::from_manifest_entry(line, base_url),
            });
        }
    })?;
    Ok(entries)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedShard {
    pub shard: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterruptedShard {
    pub shard: String,
    // Uncompressed bytes consumed before the cut. Gzip cannot seek, so the
    // next run restarts this shard from the top.
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScanCheckpoint {
    pub shards_processed: Vec<String>,
    pub failed_shards: Vec<FailedShard>,
    pub interrupted: Option<InterruptedShard>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ScanCheckpoint {
    pub fn load(path: &Path) -> StorageResult<Self> {
        Ok(read_json(path)?.unwrap_or_default())
    }

    pub fn save(&mut self, path: &Path) -> StorageResult<()> {
        self.updated_at = Some(Utc::now());
        write_json_atomic(path, self)
    }

    pub fn is_processed(&self, shard: &str) -> bool {
        self.shards_processed.iter().any(|s| s == shard)
    }

    pub fn mark_processed(&mut self, shard: &str) {
        self.failed_shards.retain(|f| f.shard != shard);
        if self.interrupted.as_ref().is_some_and(|i| i.shard == shard) {
            self.interrupted = None;
        }
        if !self.is_processed(shard) {
            self.shards_processed.push(shard.to_string());
        }
    }

    pub fn record_failure(&mut self, shard: &str, reason: String) {
        self.failed_shards.retain(|f| f.shard != shard);
        self.failed_shards.push(FailedShard {
            shard: shard.to_string(),
            reason,
            at: Utc::now(),
        });
    }
}

pub fn extract_candidates(line: &str, platform_domain: &str) -> Vec<String> {
    if !line.contains(platform_domain) {
        return Vec::new();
    }
    let from_json = line.find('{').and_then(|idx| {
        serde_json::from_str::<Value>(&line[idx..])
            .ok()
            .and_then(|v| v.get("url").and_then(Value::as_str).map(str::to_string))
    });
    let raw = match from_json {
        Some(url) => vec![url],
        None => extract_urls(line),
    };
    raw.into_iter()
        .filter(|url| {
            host_of(url)
                .map(|host| is_platform_host(&host, platform_domain))
                .unwrap_or(false)
        })
        .filter_map(|url| normalize_crawl_url(&url))
        .collect()
}

struct DiscoverySink {
    log: LineLog,
    seen: Option<HashSet<String>>,
    written: u64,
}

impl DiscoverySink {
    fn push(&mut self, url: String) -> StorageResult<()> {
        if let Some(seen) = self.seen.as_mut() {
            if !seen.insert(url.clone()) {
                return Ok(());
            }
        }
        self.log.append(&url)?;
        self.written += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardEnd {
    Complete,
    Stopped,
    BudgetExhausted,
}

#[derive(Debug, Clone, Copy)]
struct ShardProgress {
    end: ShardEnd,
    lines: u64,
    bytes: u64,
    matches: u64,
}

#[derive(Debug)]
enum ReadFailure {
    Source(io::Error),
    Storage(StorageError),
}

fn scan_reader<R: BufRead>(
    mut reader: R,
    platform_domain: &str,
    byte_budget: Option<u64>,
    stop: &AtomicBool,
    sink: &mut DiscoverySink,
) -> Result<ShardProgress, ReadFailure> {
    let mut progress = ShardProgress {
        end: ShardEnd::Complete,
        lines: 0,
        bytes: 0,
        matches: 0,
    };
    let mut buf = Vec::with_capacity(4096);
    loop {
        if progress.lines % STOP_CHECK_LINES == 0 && stop.load(Ordering::Relaxed) {
            progress.end = ShardEnd::Stopped;
            return Ok(progress);
        }
        if byte_budget.is_some_and(|budget| progress.bytes >= budget) {
            if reader.fill_buf().map_err(ReadFailure::Source)?.is_empty() {
                return Ok(progress);
            }
            progress.end = ShardEnd::BudgetExhausted;
            return Ok(progress);
        }
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).map_err(ReadFailure::Source)?;
        if read == 0 {
            return Ok(progress);
        }
        progress.lines += 1;
        progress.bytes += read as u64;
        let line = String::from_utf8_lossy(&buf);
        for url in extract_candidates(&line, platform_domain) {
            progress.matches += 1;
            sink.push(url).map_err(ReadFailure::Storage)?;
        }
    }
}

fn open_shard_reader(path: &Path, gzip: bool) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    if gzip {
        Ok(Box::new(BufReader::with_capacity(
            READ_BUFFER_BYTES,
            MultiGzDecoder::new(BufReader::new(file)),
        )))
    } else {
        Ok(Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, file)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub shards_total: usize,
    pub shards_skipped: usize,
    pub shards_completed: usize,
    pub shards_failed: usize,
    pub urls_written: u64,
    pub bytes_read: u64,
    pub interrupted: bool,
}

pub struct IndexScanner {
    fetcher: Arc<PoliteFetcher>,
    config: ScanConfig,
    platform_domain: String,
    stop: Arc<AtomicBool>,
}

impl IndexScanner {
    pub fn new(
        fetcher: Arc<PoliteFetcher>,
        config: ScanConfig,
        platform_domain: String,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            fetcher,
            config,
            platform_domain,
            stop,
        }
    }

    pub async fn run(&self) -> StorageResult<ScanReport> {
        let manifest = load_manifest(&self.config.manifest, &self.config.base_url)?;
        let mut checkpoint = if self.config.ignore_checkpoint {
            ScanCheckpoint::default()
        } else {
            ScanCheckpoint::load(&self.config.checkpoint)?
        };
        let sink = Arc::new(Mutex::new(DiscoverySink {
            log: LineLog::open(&self.config.discovery_log, self.config.buffer_lines)?,
            seen: self.config.dedupe_urls.then(HashSet::new),
            written: 0,
        }));

        let mut report = ScanReport {
            shards_total: manifest.len(),
            ..ScanReport::default()
        };
        let mut attempted = 0usize;
        info!(
            shards = manifest.len(),
            already_done = checkpoint.shards_processed.len(),
            "scan starting"
        );

        for entry in &manifest {
            if checkpoint.is_processed(&entry.id) {
                report.shards_skipped += 1;
                continue;
            }
            if self.config.max_shards.is_some_and(|cap| attempted >= cap) {
                info!(cap = attempted, "shard cap reached");
                break;
            }
            if self.stop.load(Ordering::Relaxed) {
                report.interrupted = true;
                break;
            }
            let budget = self
                .config
                .max_bytes
                .map(|cap| cap.saturating_sub(report.bytes_read));
            if budget == Some(0) {
                info!("byte cap reached");
                break;
            }
            attempted += 1;

            match self.scan_shard(entry, budget, sink.clone()).await {
                Ok(progress) => {
                    report.bytes_read += progress.bytes;
                    sync_sink(&sink)?;
                    match progress.end {
                        ShardEnd::Complete => {
                            checkpoint.mark_processed(&entry.id);
                            self.persist(&mut checkpoint)?;
                            report.shards_completed += 1;
                            info!(
                                shard = %entry.id,
                                lines = progress.lines,
                                matches = progress.matches,
                                "shard complete"
                            );
                        }
                        ShardEnd::Stopped | ShardEnd::BudgetExhausted => {
                            checkpoint.interrupted = Some(InterruptedShard {
                                shard: entry.id.clone(),
                                bytes: progress.bytes,
                            });
                            self.persist(&mut checkpoint)?;
                            report.interrupted = progress.end == ShardEnd::Stopped;
                            warn!(
                                shard = %entry.id,
                                bytes = progress.bytes,
                                "shard cut short, left unmarked"
                            );
                            break;
                        }
                    }
                }
                Err(ShardOutcome::Storage(err)) => return Err(err),
                Err(ShardOutcome::Cancelled) => {
                    report.interrupted = true;
                    break;
                }
                Err(ShardOutcome::Failed(err)) => {
                    sync_sink(&sink)?;
                    warn!(shard = %entry.id, error = %err, "shard failed, will retry next run");
                    checkpoint.record_failure(&entry.id, err.to_string());
                    self.persist(&mut checkpoint)?;
                    report.shards_failed += 1;
                }
            }
        }

        sync_sink(&sink)?;
        report.urls_written = sink.lock().map(|s| s.written).unwrap_or_default();
        info!(
            completed = report.shards_completed,
            skipped = report.shards_skipped,
            failed = report.shards_failed,
            urls = report.urls_written,
            "scan finished"
        );
        Ok(report)
    }

    async fn scan_shard(
        &self,
        entry: &ManifestEntry,
        budget: Option<u64>,
        sink: Arc<Mutex<DiscoverySink>>,
    ) -> Result<ShardProgress, ShardOutcome> {
        let (path, scratch) = match &entry.shard {
            ShardRef::Local(path) => (path.clone(), None),
            ShardRef::Remote(url) => {
                let scratch = self.scratch_path(&entry.id);
                fs::create_dir_all(&self.config.scratch_dir)
                    .map_err(|e| ShardOutcome::Storage(StorageError::io(&self.config.scratch_dir, e)))?;
                match self.fetcher.download(url, &scratch, FetchPurpose::Shard).await {
                    Ok(bytes) => info!(shard = %entry.id, bytes, "shard downloaded"),
                    Err(err) if err.is_cancelled() => {
                        let _ = fs::remove_file(&scratch);
                        return Err(ShardOutcome::Cancelled);
                    }
                    Err(err) => {
                        let _ = fs::remove_file(&scratch);
                        return Err(ShardOutcome::Failed(ScanError::Fetch {
                            shard: entry.id.clone(),
                            source: err,
                        }));
                    }
                }
                (scratch.clone(), Some(scratch))
            }
        };

        let gzip = entry.shard.is_gzip();
        let domain = self.platform_domain.clone();
        let stop = self.stop.clone();
        let shard_id = entry.id.clone();
        let read_path = path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut sink = sink
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let reader = open_shard_reader(&read_path, gzip).map_err(ReadFailure::Source)?;
            scan_reader(reader, &domain, budget, &stop, &mut sink)
        })
        .await;

        if let Some(scratch) = scratch {
            if let Err(e) = fs::remove_file(&scratch) {
                warn!(path = %scratch.display(), error = %e, "could not remove scratch shard");
            }
        }

        match joined {
            Ok(Ok(progress)) => Ok(progress),
            Ok(Err(ReadFailure::Storage(err))) => Err(ShardOutcome::Storage(err)),
            Ok(Err(ReadFailure::Source(source))) => Err(ShardOutcome::Failed(ScanError::Read {
                shard: shard_id,
                source,
            })),
            Err(join) => Err(ShardOutcome::Failed(ScanError::Join(join.to_string()))),
        }
    }

    // An ignored checkpoint is never written back, so the stored one survives.
    fn persist(&self, checkpoint: &mut ScanCheckpoint) -> StorageResult<()> {
        if self.config.ignore_checkpoint {
            return Ok(());
        }
        checkpoint.save(&self.config.checkpoint)
    }

    fn scratch_path(&self, shard_id: &str) -> PathBuf {
        let name = shard_id
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
                    ch
                } else {
                    '_'
                }
            })
            .collect::<String>();
        self.config.scratch_dir.join(format!("{name}.part"))
    }
}

enum ShardOutcome {
    Failed(ScanError),
    Cancelled,
    Storage(StorageError),
}

fn sync_sink(sink: &Mutex<DiscoverySink>) -> StorageResult<()> {
    sink.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .log
        .sync()
}
