use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

pub const DEFAULT_PLATFORM_DOMAIN: &str = "avature.net";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

const MAX_TENANT_CONCURRENCY: usize = 256;
const MAX_PER_HOST: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub platform_domain: String,
    pub fetch: FetchConfig,
    pub scan: ScanConfig,
    pub registry: RegistryConfig,
    pub harvest: HarvestConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            platform_domain: DEFAULT_PLATFORM_DOMAIN.to_string(),
            fetch: FetchConfig::default(),
            scan: ScanConfig::default(),
            registry: RegistryConfig::default(),
            harvest: HarvestConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn sanitize(mut self) -> Result<Self, ConfigError> {
        let domain = self
            .platform_domain
            .trim()
            .trim_start_matches('.')
            .to_ascii_lowercase();
        if domain.is_empty() || !domain.contains('.') {
            return Err(ConfigError::Invalid {
                field: "platform_domain",
                reason: format!("'{}' is not a hostname", self.platform_domain),
            });
        }
        self.platform_domain = domain;

        self.fetch.max_in_flight_per_host = self.fetch.max_in_flight_per_host.clamp(1, MAX_PER_HOST);
        self.fetch.max_attempts = self.fetch.max_attempts.max(1);
        self.fetch.max_backoff_ms = self.fetch.max_backoff_ms.max(self.fetch.base_backoff_ms);

        self.scan.buffer_lines = self.scan.buffer_lines.max(1);

        self.registry.sample_every = self.registry.sample_every.max(1);

        self.harvest.tenant_concurrency =
            sanitize_tenant_concurrency(self.harvest.tenant_concurrency);
        self.harvest.detail_concurrency = self.harvest.detail_concurrency.max(1);
        self.harvest.api_page_size = self.harvest.api_page_size.max(1);
        self.harvest.listing_page_size = self.harvest.listing_page_size.max(1);
        self.harvest.max_low_yield_pages = self.harvest.max_low_yield_pages.max(1);
        Ok(self)
    }
}

pub fn sanitize_tenant_concurrency(value: usize) -> usize {
    value.clamp(1, MAX_TENANT_CONCURRENCY)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    pub max_in_flight_per_host: usize,
    pub min_spacing_ms: u64,
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    pub connect_timeout_ms: u64,
    pub attempt_timeout_ms: u64,
    pub download_timeout_secs: u64,
    pub max_retry_after_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept: "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.8,*/*;q=0.7"
                .to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            max_in_flight_per_host: 4,
            min_spacing_ms: 300,
            max_attempts: 4,
            base_backoff_ms: 600,
            max_backoff_ms: 30_000,
            jitter_ms: 400,
            connect_timeout_ms: 5_000,
            attempt_timeout_ms: 45_000,
            download_timeout_secs: 1_800,
            max_retry_after_secs: 120,
        }
    }
}

impl FetchConfig {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub manifest: PathBuf,
    pub base_url: String,
    pub discovery_log: PathBuf,
    pub checkpoint: PathBuf,
    pub scratch_dir: PathBuf,
    pub ignore_checkpoint: bool,
    pub max_shards: Option<usize>,
    pub max_bytes: Option<u64>,
    pub dedupe_urls: bool,
    pub buffer_lines: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("input/cc_index_paths.txt"),
            base_url: "https://data.commoncrawl.org/".to_string(),
            discovery_log: PathBuf::from("output/avature_discovered.txt"),
            checkpoint: PathBuf::from("output/cc_index_state.json"),
            scratch_dir: PathBuf::from("output/.shards"),
            ignore_checkpoint: false,
            max_shards: None,
            max_bytes: None,
            dedupe_urls: false,
            buffer_lines: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub seeds: PathBuf,
    pub table: PathBuf,
    pub max_seeds: Option<usize>,
    pub sample_every: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            seeds: PathBuf::from("urls.txt"),
            table: PathBuf::from("input/avature_sites.json"),
            max_seeds: None,
            sample_every: 1,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Json,
    Csv,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReresolvePolicy {
    Always,
    Cached,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub output: PathBuf,
    pub format: DataFormat,
    pub dedupe_store: PathBuf,
    pub failed_urls: PathBuf,
    pub fresh: bool,
    pub only_tenants: Vec<String>,
    pub tenant_concurrency: usize,
    pub detail_concurrency: usize,
    pub max_api_probes: usize,
    pub api_page_size: usize,
    pub max_api_pages: usize,
    pub listing_page_size: usize,
    pub max_listing_pages: usize,
    pub min_new_per_page: usize,
    pub max_low_yield_pages: usize,
    pub instant_search: bool,
    pub max_scripts: usize,
    pub search_terms: Vec<String>,
    pub reresolve: ReresolvePolicy,
    pub stale_after_hours: u64,
    pub detail_cache: Option<PathBuf>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("output/jobs.ndjson"),
            format: DataFormat::Json,
            dedupe_store: PathBuf::from("output/dedupe_keys.txt"),
            failed_urls: PathBuf::from("output/failed_jobdetail_urls.txt"),
            fresh: false,
            only_tenants: Vec::new(),
            tenant_concurrency: 8,
            detail_concurrency: 4,
            max_api_probes: 6,
            api_page_size: 50,
            max_api_pages: 200,
            listing_page_size: 25,
            max_listing_pages: 1_000,
            min_new_per_page: 1,
            max_low_yield_pages: 3,
            instant_search: true,
            max_scripts: 5,
            search_terms: default_search_terms(),
            reresolve: ReresolvePolicy::Stale,
            stale_after_hours: 168,
            detail_cache: None,
        }
    }
}

fn default_search_terms() -> Vec<String> {
    let mut terms = vec![String::new()];
    terms.extend(('a'..='z').map(String::from));
    terms.extend(('0'..='9').map(String::from));
    terms.extend(
        [
            "engineer",
            "manager",
            "analyst",
            "intern",
            "senior",
            "assistant",
            "director",
            "associate",
            "lead",
            "developer",
            "software",
            "data",
            "sales",
            "marketing",
            "product",
            "finance",
            "security",
        ]
        .into_iter()
        .map(String::from),
    );
    terms
}
