use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::config::DataFormat;
use super::error::{StorageError, StorageResult};
use super::normalize::JobRecord;

const CSV_HEADERS: [&str; 14] = [
    "tenant_host",
    "company",
    "job_id",
    "title",
    "location",
    "posting_url",
    "apply_url",
    "posted_date",
    "source",
    "content_hash",
    "description_text",
    "description_html",
    "metadata",
    "fetched_at",
];

pub fn ensure_parent_dir(path: &Path) -> StorageResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))
        }
        _ => Ok(()),
    }
}

// Replace `path` with `bytes` so a crash leaves either the old or the new file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    ensure_parent_dir(path)?;
    let temp_path = temp_sibling(path);
    let write = || -> io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        StorageError::io(path, e)
    })
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| StorageError::json(path, e))?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> StorageResult<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| StorageError::json(path, e))
}

#[derive(Debug, Clone)]
pub struct PageCache {
    dir: PathBuf,
}

impl PageCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, url: &str) -> PathBuf {
        self.dir
            .join(format!("{}.html", hex::encode(Sha256::digest(url.as_bytes()))))
    }

    pub fn get(&self, url: &str) -> Option<String> {
        fs::read_to_string(self.path_for(url)).ok()
    }

    pub fn put(&self, url: &str, body: &str) -> StorageResult<()> {
        write_atomic(&self.path_for(url), body.as_bytes())
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn for_each_line(path: &Path, mut visit: impl FnMut(&str)) -> StorageResult<()> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| StorageError::io(path, e))?;
        if read == 0 {
            return Ok(());
        }
        visit(String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']));
    }
}

pub struct LineLog {
    path: PathBuf,
    writer: BufWriter<File>,
    pending: usize,
    flush_every: usize,
}

impl LineLog {
    pub fn open(path: &Path, flush_every: usize) -> StorageResult<Self> {
        ensure_parent_dir(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StorageError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            pending: 0,
            flush_every: flush_every.max(1),
        })
    }

    pub fn append(&mut self, line: &str) -> StorageResult<()> {
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .map_err(|e| StorageError::io(&self.path, e))?;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> StorageResult<()> {
        self.pending = 0;
        self.writer
            .flush()
            .map_err(|e| StorageError::io(&self.path, e))
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.flush()?;
        self.writer
            .get_ref()
            .sync_data()
            .map_err(|e| StorageError::io(&self.path, e))
    }
}

pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvSink {
    fn open(path: &Path, truncate: bool) -> StorageResult<Self> {
        let needs_header = truncate || fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = open_output(path, truncate)?;
        let mut writer = csv::Writer::from_writer(file);
        if needs_header {
            writer.write_record(CSV_HEADERS).map_err(|e| csv_error(path, e))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    fn write_record(&mut self, record: &JobRecord) -> StorageResult<()> {
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| StorageError::json(&self.path, e))?;
        let opt = |value: &Option<String>| value.clone().unwrap_or_default();
        self.writer
            .write_record([
                record.tenant_host.clone(),
                record.company.clone(),
                opt(&record.job_id),
                record.title.clone(),
                opt(&record.location),
                opt(&record.posting_url),
                opt(&record.apply_url),
                opt(&record.posted_date),
                record.source.as_str().to_string(),
                record.content_hash.clone(),
                opt(&record.description_text),
                opt(&record.description_html),
                metadata,
                record.fetched_at.to_rfc3339(),
            ])
            .map_err(|e| csv_error(&self.path, e))
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.writer
            .flush()
            .map_err(|e| StorageError::io(&self.path, e))?;
        self.writer
            .get_ref()
            .sync_data()
            .map_err(|e| StorageError::io(&self.path, e))
    }
}

pub struct JsonSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonSink {
    fn open(path: &Path, truncate: bool) -> StorageResult<Self> {
        let file = open_output(path, truncate)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    fn write_record(&mut self, record: &JobRecord) -> StorageResult<()> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| StorageError::json(&self.path, e))?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| StorageError::io(&self.path, e))
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.writer
            .flush()
            .map_err(|e| StorageError::io(&self.path, e))?;
        self.writer
            .get_ref()
            .sync_data()
            .map_err(|e| StorageError::io(&self.path, e))
    }
}

pub enum OutputSink {
    Csv(CsvSink),
    Json(JsonSink),
}

impl OutputSink {
    pub fn open(path: &Path, format: DataFormat, truncate: bool) -> StorageResult<Self> {
        match format {
            DataFormat::Csv => Ok(OutputSink::Csv(CsvSink::open(path, truncate)?)),
            DataFormat::Json => Ok(OutputSink::Json(JsonSink::open(path, truncate)?)),
        }
    }

    pub fn write_record(&mut self, record: &JobRecord) -> StorageResult<()> {
        match self {
            OutputSink::Csv(sink) => sink.write_record(record),
            OutputSink::Json(sink) => sink.write_record(record),
        }
    }

    pub fn flush(&mut self) -> StorageResult<()> {
        match self {
            OutputSink::Csv(sink) => sink.flush(),
            OutputSink::Json(sink) => sink.flush(),
        }
    }
}

fn open_output(path: &Path, truncate: bool) -> StorageResult<File> {
    ensure_parent_dir(path)?;
    let mut options = OpenOptions::new();
    options.create(true);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    options.open(path).map_err(|e| StorageError::io(path, e))
}

fn csv_error(path: &Path, source: csv::Error) -> StorageError {
    StorageError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExistingRecord {
    pub tenant_host: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub posting_url: Option<String>,
}

fn empty_as_none<'de, D: serde::Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let raw = Option::<String>::deserialize(de)?;
    Ok(raw.filter(|s| !s.trim().is_empty()))
}

pub fn detect_data_format(path: &Path, fallback: DataFormat) -> DataFormat {
    let lower = path.to_string_lossy().to_ascii_lowercase();
    if lower.ends_with(".json") || lower.ends_with(".ndjson") || lower.ends_with(".jsonl") {
        DataFormat::Json
    } else if lower.ends_with(".csv") {
        DataFormat::Csv
    } else {
        fallback
    }
}

pub fn for_each_existing_record(
    path: &Path,
    format: DataFormat,
    mut visit: impl FnMut(ExistingRecord),
) -> StorageResult<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let mut skipped = 0usize;
    match detect_data_format(path, format) {
        DataFormat::Json => {
            for_each_line(path, |line| {
                let line = line.trim();
                if line.is_empty() {
                    return;
                }
                match serde_json::from_str::<ExistingRecord>(line) {
                    Ok(record) => visit(record),
                    Err(_) => skipped += 1,
                }
            })?;
        }
        DataFormat::Csv => {
            let mut reader = csv::Reader::from_path(path).map_err(|e| csv_error(path, e))?;
            for row in reader.deserialize::<ExistingRecord>() {
                match row {
                    Ok(record) => visit(record),
                    Err(_) => skipped += 1,
                }
            }
        }
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "skipped unreadable rows in existing output");
    }
    Ok(skipped)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::app::normalize::SourceKind;

    fn record(job_id: Option<&str>, title: &str) -> JobRecord {
        JobRecord {
            tenant_host: "acme.avature.net".to_string(),
            company: "Acme".to_string(),
            job_id: job_id.map(str::to_string),
            title: title.to_string(),
            location: Some("Berlin".to_string()),
            posting_url: Some("https://acme.avature.net/careers/JobDetail/x/1".to_string()),
            apply_url: None,
            posted_date: None,
            source: SourceKind::Html,
            content_hash: "abc".to_string(),
            description_text: None,
            description_html: None,
            metadata: BTreeMap::from([("Ref #".to_string(), "R-1".to_string())]),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!temp_sibling(&path).exists());
    }

    #[test]
    fn read_json_treats_missing_and_blank_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        assert!(read_json::<Vec<String>>(&path).unwrap().is_none());
        fs::write(&path, "  \n").unwrap();
        assert!(read_json::<Vec<String>>(&path).unwrap().is_none());
        fs::write(&path, "{oops").unwrap();
        assert!(matches!(
            read_json::<Vec<String>>(&path),
            Err(StorageError::Json { .. })
        ));
    }

    #[test]
    fn ndjson_sink_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.ndjson");
        for id in ["1", "2"] {
            let mut sink = OutputSink::open(&path, DataFormat::Json, false).unwrap();
            sink.write_record(&record(Some(id), "Engineer")).unwrap();
            sink.flush().unwrap();
        }
        let mut ids = Vec::new();
        for_each_existing_record(&path, DataFormat::Json, |r| ids.push(r.job_id)).unwrap();
        assert_eq!(ids, vec![Some("1".to_string()), Some("2".to_string())]);

        let mut sink = OutputSink::open(&path, DataFormat::Json, true).unwrap();
        sink.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn csv_sink_writes_header_once_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.csv");
        for id in [Some("7"), None] {
            let mut sink = OutputSink::open(&path, DataFormat::Csv, false).unwrap();
            sink.write_record(&record(id, "Analyst, Data")).unwrap();
            sink.flush().unwrap();
        }
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("tenant_host").count(), 1);

        let mut rows = Vec::new();
        for_each_existing_record(&path, DataFormat::Json, |r| rows.push(r)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].job_id.as_deref(), Some("7"));
        assert_eq!(rows[1].job_id, None);
        assert_eq!(rows[1].title, "Analyst, Data");
    }

    #[test]
    fn line_log_appends_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let mut log = LineLog::open(&path, 2).unwrap();
        log.append("a").unwrap();
        log.append("b").unwrap();
        log.append("c").unwrap();
        log.sync().unwrap();
        drop(log);

        let mut lines = Vec::new();
        for_each_line(&path, |l| lines.push(l.to_string())).unwrap();
        assert_eq!(lines, vec!["a", "b", "c"]);

        let mut none = 0;
        for_each_line(&dir.path().join("missing"), |_| none += 1).unwrap();
        assert_eq!(none, 0);
    }
}
