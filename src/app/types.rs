use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use super::config::{AppConfig, DataFormat, ReresolvePolicy};
use super::data_io::detect_data_format;
use super::normalize::JobRecord;
use super::registry::Strategy;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "avature-harvest",
    version,
    about = "Discover Avature tenants in web-index shards and harvest their job postings"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "FILE", env = "HARVEST_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,

    #[arg(long, global = true, value_name = "DOMAIN", env = "HARVEST_PLATFORM_DOMAIN")]
    pub platform_domain: Option<String>,

    #[arg(long, global = true, value_name = "UA", env = "HARVEST_USER_AGENT")]
    pub user_agent: Option<String>,

    #[arg(long, global = true, value_name = "N")]
    pub per_host: Option<usize>,

    #[arg(long, global = true, value_name = "MS")]
    pub min_spacing_ms: Option<u64>,

    #[arg(long, global = true, value_name = "N")]
    pub max_attempts: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    Scan(ScanArgs),
    Registry(RegistryArgs),
    Harvest(HarvestArgs),
}

#[derive(Debug, Args, Clone, Default)]
pub struct ScanArgs {
    #[arg(long, value_name = "FILE")]
    pub manifest: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub discovery_log: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub checkpoint: Option<PathBuf>,

    #[arg(long, value_name = "N")]
    pub max_shards: Option<usize>,

    #[arg(long, value_name = "BYTES")]
    pub max_bytes: Option<u64>,

    #[arg(long, default_value_t = false)]
    pub ignore_checkpoint: bool,

    #[arg(long, default_value_t = false)]
    pub dedupe_urls: bool,
}

#[derive(Debug, Args, Clone, Default)]
pub struct RegistryArgs {
    #[arg(long, value_name = "FILE")]
    pub seeds: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub table: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub discovery_log: Option<PathBuf>,

    #[arg(long, value_name = "N")]
    pub max_seeds: Option<usize>,

    #[arg(long, value_name = "N")]
    pub sample_every: Option<usize>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct HarvestArgs {
    #[arg(long, value_name = "FILE")]
    pub table: Option<PathBuf>,

    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub format: Option<FileFormatArg>,

    #[arg(long, value_name = "FILE")]
    pub dedupe_store: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub fresh: bool,

    #[arg(long = "tenant", value_name = "HOST", action = ArgAction::Append)]
    pub tenants: Vec<String>,

    #[arg(long, value_name = "N")]
    pub tenant_concurrency: Option<usize>,

    #[arg(long, value_enum)]
    pub reresolve: Option<ReresolveArg>,

    #[arg(long, default_value_t = false)]
    pub no_instant_search: bool,

    #[arg(long, value_name = "DIR")]
    pub detail_cache: Option<PathBuf>,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum FileFormatArg {
    Csv,
    Json,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Csv => DataFormat::Csv,
            FileFormatArg::Json => DataFormat::Json,
        }
    }
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum ReresolveArg {
    Always,
    Cached,
    Stale,
}

impl From<ReresolveArg> for ReresolvePolicy {
    fn from(value: ReresolveArg) -> Self {
        match value {
            ReresolveArg::Always => ReresolvePolicy::Always,
            ReresolveArg::Cached => ReresolvePolicy::Cached,
            ReresolveArg::Stale => ReresolvePolicy::Stale,
        }
    }
}

impl Cli {
    pub fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(domain) = &self.platform_domain {
            config.platform_domain = domain.clone();
        }
        if let Some(ua) = &self.user_agent {
            config.fetch.user_agent = ua.clone();
        }
        if let Some(n) = self.per_host {
            config.fetch.max_in_flight_per_host = n;
        }
        if let Some(ms) = self.min_spacing_ms {
            config.fetch.min_spacing_ms = ms;
        }
        if let Some(n) = self.max_attempts {
            config.fetch.max_attempts = n;
        }

        match &self.command {
            Command::Scan(args) => {
                let scan = &mut config.scan;
                set(&mut scan.manifest, &args.manifest);
                set(&mut scan.discovery_log, &args.discovery_log);
                set(&mut scan.checkpoint, &args.checkpoint);
                if args.max_shards.is_some() {
                    scan.max_shards = args.max_shards;
                }
                if args.max_bytes.is_some() {
                    scan.max_bytes = args.max_bytes;
                }
                scan.ignore_checkpoint |= args.ignore_checkpoint;
                scan.dedupe_urls |= args.dedupe_urls;
            }
            Command::Registry(args) => {
                set(&mut config.registry.seeds, &args.seeds);
                set(&mut config.registry.table, &args.table);
                set(&mut config.scan.discovery_log, &args.discovery_log);
                if args.max_seeds.is_some() {
                    config.registry.max_seeds = args.max_seeds;
                }
                if let Some(n) = args.sample_every {
                    config.registry.sample_every = n;
                }
            }
            Command::Harvest(args) => {
                set(&mut config.registry.table, &args.table);
                set(&mut config.harvest.dedupe_store, &args.dedupe_store);
                let harvest = &mut config.harvest;
                if let Some(format) = args.format {
                    harvest.format = format.into();
                }
                if let Some(output) = &args.output {
                    harvest.output = output.clone();
                    harvest.format = detect_data_format(output, harvest.format);
                }
                harvest.fresh |= args.fresh;
                if !args.tenants.is_empty() {
                    harvest.only_tenants = args.tenants.clone();
                }
                if let Some(n) = args.tenant_concurrency {
                    harvest.tenant_concurrency = n;
                }
                if let Some(policy) = args.reresolve {
                    harvest.reresolve = policy.into();
                }
                if args.no_instant_search {
                    harvest.instant_search = false;
                }
                if args.detail_cache.is_some() {
                    harvest.detail_cache = args.detail_cache.clone();
                }
            }
        }
        config
    }
}

fn set(slot: &mut PathBuf, value: &Option<PathBuf>) {
    if let Some(v) = value {
        *slot = v.clone();
    }
}

#[derive(Debug)]
pub struct TenantOutcome {
    pub host: String,
    pub records: Vec<JobRecord>,
    pub dropped: usize,
    pub failed_detail_urls: Vec<String>,
    pub strategy: Option<Strategy>,
}

#[derive(Debug)]
pub enum HarvestEvent {
    Tenant(Box<TenantOutcome>),
    Error(String),
}
