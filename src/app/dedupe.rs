use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::config::DataFormat;
use super::data_io::{LineLog, for_each_existing_record, for_each_line, write_atomic};
use super::error::StorageResult;
use super::normalize::JobRecord;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupeKey {
    Id { host: String, job_id: String },
    Content(String),
}

impl DedupeKey {
    pub fn for_record(record: &JobRecord) -> Self {
        Self::from_parts(
            &record.tenant_host,
            record.job_id.as_deref(),
            &record.title,
            record.posting_url.as_deref(),
        )
    }

    pub fn from_parts(host: &str, job_id: Option<&str>, title: &str, posting_url: Option<&str>) -> Self {
        let host = host.trim().to_ascii_lowercase();
        match job_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => DedupeKey::Id {
                host,
                job_id: id.to_string(),
            },
            None => {
                let mut hasher = Sha256::new();
                hasher.update(host.as_bytes());
                hasher.update(b"\n");
                hasher.update(title.trim().as_bytes());
                hasher.update(b"\n");
                hasher.update(posting_url.unwrap_or_default().as_bytes());
                DedupeKey::Content(hex::encode(hasher.finalize()))
            }
        }
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupeKey::Id { host, job_id } => write!(f, "id:{host}:{job_id}"),
            DedupeKey::Content(hash) => write!(f, "hash:{hash}"),
        }
    }
}

#[derive(Default)]
struct KeySet {
    seen: HashSet<String>,
    pending: Vec<String>,
}

pub struct Deduplicator {
    store: PathBuf,
    keys: Mutex<KeySet>,
}

impl Deduplicator {
    pub fn open(store: &Path, fresh: bool) -> StorageResult<Self> {
        if fresh && store.exists() {
            write_atomic(store, b"")?;
        }
        let mut seen = HashSet::new();
        for_each_line(store, |line| {
            let line = line.trim();
            if !line.is_empty() {
                seen.insert(line.to_string());
            }
        })?;
        debug!(store = %store.display(), keys = seen.len(), "dedupe store loaded");
        Ok(Self {
            store: store.to_path_buf(),
            keys: Mutex::new(KeySet {
                seen,
                pending: Vec::new(),
            }),
        })
    }

    pub fn seed_from_output(&self, output: &Path, format: DataFormat) -> StorageResult<usize> {
        let mut added = 0usize;
        let mut keys = self.lock();
        for_each_existing_record(output, format, |existing| {
            let key = DedupeKey::from_parts(
                &existing.tenant_host,
                existing.job_id.as_deref(),
                &existing.title,
                existing.posting_url.as_deref(),
            )
            .to_string();
            if keys.seen.insert(key.clone()) {
                keys.pending.push(key);
                added += 1;
            }
        })?;
        if added > 0 {
            info!(output = %output.display(), keys = added, "dedupe seeded from existing output");
        }
        Ok(added)
    }

    pub fn should_emit(&self, record: &JobRecord) -> bool {
        let key = DedupeKey::for_record(record).to_string();
        let mut keys = self.lock();
        if keys.seen.insert(key.clone()) {
            keys.pending.push(key);
            true
        } else {
            false
        }
    }

    // Append keys accepted since the last flush. Call only after the records
    // they belong to are durable in the output.
    pub fn flush(&self) -> StorageResult<usize> {
        let pending = std::mem::take(&mut self.lock().pending);
        if pending.is_empty() {
            return Ok(0);
        }
        let mut log = LineLog::open(&self.store, pending.len())?;
        for key in &pending {
            log.append(key)?;
        }
        log.sync()?;
        Ok(pending.len())
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, KeySet> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use chrono::Utc;

    use super::*;
    use crate::app::data_io::OutputSink;
    use crate::app::normalize::SourceKind;

    fn record(host: &str, job_id: Option<&str>, title: &str, url: Option<&str>) -> JobRecord {
        JobRecord {
            tenant_host: host.to_string(),
            company: "Acme".to_string(),
            job_id: job_id.map(str::to_string),
            title: title.to_string(),
            location: None,
            posting_url: url.map(str::to_string),
            apply_url: None,
            posted_date: None,
            source: SourceKind::Api,
            content_hash: String::new(),
            description_text: None,
            description_html: None,
            metadata: BTreeMap::new(),
            fetched_at: Utc::now(),
        }
    }

    fn sample() -> Vec<JobRecord> {
        vec![
            record("acme.avature.net", Some("1"), "Engineer", None),
            record("acme.avature.net", Some("2"), "Analyst", None),
            record("ACME.avature.net", Some("1"), "Engineer (updated)", None),
            record("globex.avature.net", Some("1"), "Engineer", None),
            record("acme.avature.net", None, "Intern", Some("https://acme.avature.net/careers/JobDetail/Intern")),
            record("acme.avature.net", None, "Intern", Some("https://acme.avature.net/careers/JobDetail/Intern")),
            record("acme.avature.net", None, "Intern", Some("https://acme.avature.net/careers/JobDetail/Intern-2")),
        ]
    }

    #[test]
    fn emits_once_per_distinct_key_in_any_order() {
        let records = sample();
        let distinct = records
            .iter()
            .map(DedupeKey::for_record)
            .collect::<HashSet<_>>()
            .len();
        assert_eq!(distinct, 5);

        let dir = tempfile::tempdir().unwrap();
        let forward = Deduplicator::open(&dir.path().join("a.txt"), false).unwrap();
        let emitted_forward = records.iter().filter(|r| forward.should_emit(r)).count();

        let backward = Deduplicator::open(&dir.path().join("b.txt"), false).unwrap();
        let emitted_backward = records.iter().rev().filter(|r| backward.should_emit(r)).count();

        assert_eq!(emitted_forward, distinct);
        assert_eq!(emitted_backward, distinct);
    }

    #[test]
    fn flushed_keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("out/keys.txt");
        let first = Deduplicator::open(&store, false).unwrap();
        for r in sample() {
            first.should_emit(&r);
        }
        assert_eq!(first.flush().unwrap(), 5);
        assert_eq!(first.flush().unwrap(), 0);

        let second = Deduplicator::open(&store, false).unwrap();
        assert_eq!(second.len(), 5);
        assert!(sample().iter().all(|r| !second.should_emit(r)));

        let contents = fs::read_to_string(&store).unwrap();
        assert!(contents.lines().any(|l| l == "id:acme.avature.net:1"));

        let fresh = Deduplicator::open(&store, true).unwrap();
        assert!(fresh.is_empty());
    }

    #[test]
    fn unflushed_keys_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("keys.txt");
        let dedupe = Deduplicator::open(&store, false).unwrap();
        assert!(dedupe.should_emit(&sample()[0]));
        drop(dedupe);
        let reopened = Deduplicator::open(&store, false).unwrap();
        assert!(reopened.should_emit(&sample()[0]));
    }

    #[test]
    fn existing_output_seeds_the_key_set() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("jobs.ndjson");
        let mut sink = OutputSink::open(&output, DataFormat::Json, true).unwrap();
        for r in &sample()[..2] {
            sink.write_record(r).unwrap();
        }
        sink.flush().unwrap();

        let dedupe = Deduplicator::open(&dir.path().join("keys.txt"), false).unwrap();
        assert_eq!(dedupe.seed_from_output(&output, DataFormat::Json).unwrap(), 2);
        assert!(!dedupe.should_emit(&sample()[0]));
        assert!(dedupe.should_emit(&sample()[3]));
    }
}
