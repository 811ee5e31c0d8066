use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::RegistryConfig;
use super::data_io::{for_each_line, read_json, write_json_atomic};
use super::error::StorageResult;
use super::urls::{
    extract_urls, has_query, host_of, is_job_detail_url, is_platform_host, normalize_crawl_url,
    path_segment_count,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    NoApi,
    ApiEmpty,
    HtmlParseFailed,
    Unreachable,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NoApi => "no-api",
            FailureReason::ApiEmpty => "api-empty",
            FailureReason::HtmlParseFailed => "html-parse-failed",
            FailureReason::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Unresolved,
    ApiResolved {
        endpoint: String,
    },
    HtmlFallback {
        listing_url: String,
    },
    Failed {
        reason: FailureReason,
    },
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Strategy::Unresolved => "unresolved",
            Strategy::ApiResolved { .. } => "api",
            Strategy::HtmlFallback { .. } => "html",
            Strategy::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub host: String,
    pub company: String,
    pub canonical_url: String,
    pub seed_urls: BTreeSet<String>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Tenant {
    pub fn new(host: &str, url: String) -> Self {
        let mut seed_urls = BTreeSet::new();
        seed_urls.insert(url.clone());
        Self {
            host: host.to_string(),
            company: company_from_host(host),
            canonical_url: url,
            seed_urls,
            strategy: Strategy::Unresolved,
            resolved_at: None,
        }
    }

    pub fn add_url(&mut self, url: String) -> bool {
        if !self.seed_urls.insert(url) {
            return false;
        }
        self.canonical_url = pick_canonical(&self.seed_urls).unwrap_or_else(|| self.canonical_url.clone());
        true
    }

    pub fn resolved_endpoint(&self) -> Option<&str> {
        match &self.strategy {
            Strategy::ApiResolved { endpoint } => Some(endpoint),
            Strategy::HtmlFallback { listing_url } => Some(listing_url),
            Strategy::Unresolved | Strategy::Failed { .. } => None,
        }
    }

    pub fn job_detail_seeds(&self) -> Vec<String> {
        self.seed_urls
            .iter()
            .filter(|u| is_job_detail_url(u))
            .cloned()
            .collect()
    }
}

// No query string first, then fewest path segments, then shortest, then lexicographic.
fn pick_canonical(urls: &BTreeSet<String>) -> Option<String> {
    urls.iter()
        .min_by_key(|u| (has_query(u), path_segment_count(u), u.len(), u.as_str()))
        .cloned()
}

pub fn company_from_host(host: &str) -> String {
    let label = host.split('.').next().unwrap_or(host);
    label
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    NewTenant,
    NewUrl,
    Known,
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub urls_seen: usize,
    pub urls_rejected: usize,
    pub new_tenants: usize,
    pub new_urls: usize,
    pub tenants_total: usize,
}

impl MergeReport {
    fn count(&mut self, outcome: MergeOutcome) {
        self.urls_seen += 1;
        match outcome {
            MergeOutcome::NewTenant => self.new_tenants += 1,
            MergeOutcome::NewUrl => self.new_urls += 1,
            MergeOutcome::Known => {}
            MergeOutcome::Rejected => self.urls_rejected += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantTable {
    tenants: BTreeMap<String, Tenant>,
}

impl TenantTable {
    pub fn load(path: &Path) -> StorageResult<Self> {
        let list: Vec<Tenant> = read_json(path)?.unwrap_or_default();
        let mut table = TenantTable::default();
        for tenant in list {
            match table.tenants.get_mut(&tenant.host) {
                Some(existing) => {
                    for url in tenant.seed_urls {
                        existing.add_url(url);
                    }
                }
                None => {
                    table.tenants.insert(tenant.host.clone(), tenant);
                }
            }
        }
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> StorageResult<()> {
        let list = self.tenants.values().collect::<Vec<_>>();
        write_json_atomic(path, &list)
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub fn get(&self, host: &str) -> Option<&Tenant> {
        self.tenants.get(host)
    }

    pub fn tenants(&self) -> impl Iterator<Item = &Tenant> {
        self.tenants.values()
    }

    pub fn update_strategy(&mut self, host: &str, strategy: Strategy, at: DateTime<Utc>) {
        if let Some(tenant) = self.tenants.get_mut(host) {
            tenant.strategy = strategy;
            tenant.resolved_at = Some(at);
        }
    }

    pub fn merge_url(&mut self, raw: &str, platform_domain: &str) -> MergeOutcome {
        let Some(url) = normalize_crawl_url(raw) else {
            return MergeOutcome::Rejected;
        };
        let Some(host) = host_of(&url) else {
            return MergeOutcome::Rejected;
        };
        if !is_platform_host(&host, platform_domain) {
            return MergeOutcome::Rejected;
        }
        match self.tenants.get_mut(&host) {
            Some(tenant) => {
                if tenant.add_url(url) {
                    MergeOutcome::NewUrl
                } else {
                    MergeOutcome::Known
                }
            }
            None => {
                self.tenants.insert(host.clone(), Tenant::new(&host, url));
                MergeOutcome::NewTenant
            }
        }
    }
}

pub fn load_seed_urls(path: &Path, sample_every: usize, max_seeds: Option<usize>) -> StorageResult<Vec<String>> {
    let sample_every = sample_every.max(1);
    let mut urls = Vec::new();
    let mut line_no = 0usize;
    for_each_line(path, |line| {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        if line_no % sample_every != 0 || max_seeds.is_some_and(|cap| urls.len() >= cap) {
            return;
        }
        for url in extract_urls(line) {
            if max_seeds.is_some_and(|cap| urls.len() >= cap) {
                break;
            }
            urls.push(url);
        }
    })?;
    Ok(urls)
}

pub fn build_registry(
    config: &RegistryConfig,
    discovery_log: &Path,
    platform_domain: &str,
) -> StorageResult<MergeReport> {
    let mut table = TenantTable::load(&config.table)?;
    let mut report = MergeReport::default();

    let seeds = load_seed_urls(&config.seeds, config.sample_every, config.max_seeds)?;
    debug!(count = seeds.len(), "seed urls loaded");
    for url in &seeds {
        report.count(table.merge_url(url, platform_domain));
    }
    for_each_line(discovery_log, |line| {
        let line = line.trim();
        if !line.is_empty() {
            report.count(table.merge_url(line, platform_domain));
        }
    })?;

    table.save(&config.table)?;
    report.tenants_total = table.len();
    info!(
        tenants = report.tenants_total,
        new_tenants = report.new_tenants,
        new_urls = report.new_urls,
        rejected = report.urls_rejected,
        table = %config.table.display(),
        "tenant table written"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn config(dir: &Path) -> RegistryConfig {
        RegistryConfig {
            seeds: dir.join("urls.txt"),
            table: dir.join("input/sites.json"),
            max_seeds: None,
            sample_every: 1,
        }
    }

    #[test]
    fn merge_twice_produces_identical_table() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        fs::write(
            &cfg.seeds,
            "# known tenants\nhttps://acme.avature.net/careers/SearchJobs/123\nhttps://globex.avature.net/en_US/careers\n",
        )
        .unwrap();
        let log = dir.path().join("discovered.txt");
        fs::write(
            &log,
            "https://acme.avature.net/careers\nhttps://acme.avature.net/careers\nhttps://evil.example.com/avature.net\n",
        )
        .unwrap();

        let first = build_registry(&cfg, &log, "avature.net").unwrap();
        let bytes_first = fs::read(&cfg.table).unwrap();
        let second = build_registry(&cfg, &log, "avature.net").unwrap();
        let bytes_second = fs::read(&cfg.table).unwrap();

        assert_eq!(bytes_first, bytes_second);
        assert_eq!(first.tenants_total, 2);
        assert_eq!(second.tenants_total, 2);
        assert_eq!(second.new_tenants, 0);
        assert_eq!(second.new_urls, 0);
    }

    #[test]
    fn acme_seed_becomes_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        fs::write(&cfg.seeds, "https://acme.avature.net/careers/SearchJobs/123\n").unwrap();
        build_registry(&cfg, &dir.path().join("none.txt"), "avature.net").unwrap();

        let table = TenantTable::load(&cfg.table).unwrap();
        let tenant = table.get("acme.avature.net").unwrap();
        assert!(tenant.seed_urls.contains("https://acme.avature.net/careers/SearchJobs/123"));
        assert_eq!(tenant.strategy, Strategy::Unresolved);
        assert_eq!(tenant.company, "Acme");
    }

    #[test]
    fn canonical_prefers_short_unparameterized_but_keeps_all() {
        let mut table = TenantTable::default();
        for url in [
            "https://acme.avature.net/careers/SearchJobs?lang=en",
            "https://acme.avature.net/en_US/careers/JobDetail/Eng/9",
            "https://acme.avature.net/careers/SearchJobs",
            "https://acme.avature.net/careers",
        ] {
            table.merge_url(url, "avature.net");
        }
        let tenant = table.get("acme.avature.net").unwrap();
        assert_eq!(tenant.canonical_url, "https://acme.avature.net/careers");
        assert_eq!(tenant.seed_urls.len(), 4);
    }

    #[test]
    fn merge_keeps_existing_strategy_and_urls() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let mut table = TenantTable::default();
        table.merge_url("https://acme.avature.net/careers/JobDetail/x/1", "avature.net");
        table.update_strategy(
            "acme.avature.net",
            Strategy::Failed {
                reason: FailureReason::ApiEmpty,
            },
            Utc::now(),
        );
        table.save(&cfg.table).unwrap();

        fs::write(&cfg.seeds, "https://acme.avature.net/careers\n").unwrap();
        build_registry(&cfg, &dir.path().join("none.txt"), "avature.net").unwrap();

        let table = TenantTable::load(&cfg.table).unwrap();
        let tenant = table.get("acme.avature.net").unwrap();
        assert_eq!(tenant.seed_urls.len(), 2);
        assert!(matches!(
            tenant.strategy,
            Strategy::Failed {
                reason: FailureReason::ApiEmpty
            }
        ));
        assert_eq!(tenant.job_detail_seeds().len(), 1);
    }

    #[test]
    fn rejects_foreign_and_malformed_urls() {
        let mut table = TenantTable::default();
        assert_eq!(table.merge_url("https://avature.net.evil.com/x", "avature.net"), MergeOutcome::Rejected);
        assert_eq!(table.merge_url("not a url", "avature.net"), MergeOutcome::Rejected);
        assert_eq!(table.merge_url("https://ACME.avature.net/careers", "avature.net"), MergeOutcome::NewTenant);
        assert_eq!(table.merge_url("https://acme.avature.net/careers#top", "avature.net"), MergeOutcome::Known);
        assert!(table.get("acme.avature.net").is_some());
    }

    #[test]
    fn seed_sampling_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        fs::write(
            &path,
            "# header\n\nhttps://a.avature.net/careers\nnote: https://b.avature.net/careers\nhttps://c.avature.net/careers\nhttps://d.avature.net/careers\n",
        )
        .unwrap();
        assert_eq!(load_seed_urls(&path, 1, None).unwrap().len(), 4);
        assert_eq!(
            load_seed_urls(&path, 2, None).unwrap(),
            vec![
                "https://b.avature.net/careers".to_string(),
                "https://d.avature.net/careers".to_string()
            ]
        );
        assert_eq!(
            load_seed_urls(&path, 3, None).unwrap(),
            vec!["https://a.avature.net/careers".to_string(), "https://d.avature.net/careers".to_string()]
        );
        assert_eq!(load_seed_urls(&path, 1, Some(3)).unwrap().len(), 3);
    }

    #[test]
    fn company_names() {
        assert_eq!(company_from_host("acme-corp.avature.net"), "Acme Corp");
        assert_eq!(company_from_host("BLOOMBERG.avature.net"), "Bloomberg");
    }

    #[test]
    fn strategy_round_trips_through_json() {
        let strategy = Strategy::HtmlFallback {
            listing_url: "https://acme.avature.net/careers/SearchJobs".to_string(),
        };
        let json = serde_json::to_string(&strategy).unwrap();
        assert!(json.contains("\"state\":\"html_fallback\""));
        let failed = serde_json::to_string(&Strategy::Failed {
            reason: FailureReason::HtmlParseFailed,
        })
        .unwrap();
        assert!(failed.contains("html-parse-failed"));
    }
}
