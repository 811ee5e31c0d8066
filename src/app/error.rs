use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient failure fetching {url} after {attempts} attempts: {reason}")]
    Transient {
        url: String,
        attempts: usize,
        status: Option<u16>,
        reason: String,
    },

    #[error("permanent failure fetching {url}: {reason}")]
    Permanent {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("fetch of {url} not started: stop requested")]
    Cancelled { url: String },

    #[error("could not write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Transient { status, .. } | FetchError::Permanent { status, .. } => *status,
            FetchError::Cancelled { .. } | FetchError::Io { .. } => None,
        }
    }

    pub fn is_network(&self) -> bool {
        match self {
            FetchError::Transient { status, .. } => status.is_none(),
            FetchError::Permanent { status, .. } => status.is_none(),
            FetchError::Cancelled { .. } | FetchError::Io { .. } => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled { .. })
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("shard {shard} could not be fetched: {source}")]
    Fetch {
        shard: String,
        #[source]
        source: FetchError,
    },

    #[error("shard {shard} could not be read: {source}")]
    Read {
        shard: String,
        #[source]
        source: io::Error,
    },

    #[error("scan task failed: {0}")]
    Join(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        StorageError::Json {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record from {tenant} has neither a job id nor a posting url")]
    MissingIdentity { tenant: String },

    #[error("payload from {tenant} is not a job object: {reason}")]
    Parse { tenant: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("http client setup failed: {0}")]
    Client(#[from] reqwest::Error),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
pub type FetchResult<T> = Result<T, FetchError>;
