use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::config::{HarvestConfig, ReresolvePolicy};
use super::data_io::PageCache;
use super::error::{FetchError, FetchResult};
use super::fetch::{FetchPurpose, FetchResponse, PoliteFetcher};
use super::normalize::RawJob;
use super::parser::{HtmlFields, JobPageParser};
use super::registry::{FailureReason, Strategy, Tenant};
use super::urls::{careers_base, host_of, normalize_crawl_url, origin, resolve_href};

pub const COMMON_ENDPOINTS: [&str; 3] = [
    "/services/avature/search",
    "/services/avature/jobs",
    "/api/jobs",
];

const TOKEN_KEYS: [&str; 4] = ["listSpecId", "searchIndexId", "contextValues", "richFieldId"];

static SERVICE_PATH: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"/services/[^"'\s<>\\]+"#).ok());

static TOKEN_PATTERNS: LazyLock<Vec<(&'static str, Vec<Regex>)>> = LazyLock::new(|| {
    TOKEN_KEYS
        .iter()
        .map(|key| {
            let quoted = format!(r#""{key}"\s*:\s*"([^"]+)""#);
            let bare = format!(r#"{key}\s*[:=]\s*"([^"]+)""#);
            let patterns = [quoted, bare]
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect::<Vec<_>>();
            (*key, patterns)
        })
        .collect()
});

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RequestTally {
    pub attempted: usize,
    pub network_failed: usize,
}

impl RequestTally {
    fn record<T>(&mut self, result: &FetchResult<T>) {
        match result {
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                self.attempted += 1;
                if err.is_network() {
                    self.network_failed += 1;
                }
            }
            Ok(_) => self.attempted += 1,
        }
    }

    fn merge(self, other: RequestTally) -> RequestTally {
        RequestTally {
            attempted: self.attempted + other.attempted,
            network_failed: self.network_failed + other.network_failed,
        }
    }

    pub fn all_network_failed(&self) -> bool {
        self.attempted > 0 && self.network_failed == self.attempted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOutcome {
    Resolved { endpoint: String },
    Empty,
    NoEndpoint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HtmlSummary {
    pub listing_url: String,
    pub links_found: usize,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Skip,
    Reuse(Strategy),
    Resolve,
}

pub fn plan_for(
    tenant: &Tenant,
    policy: ReresolvePolicy,
    stale_after: ChronoDuration,
    now: DateTime<Utc>,
) -> Plan {
    if matches!(tenant.strategy, Strategy::Unresolved) || policy == ReresolvePolicy::Always {
        return Plan::Resolve;
    }
    let fresh = match policy {
        ReresolvePolicy::Cached => true,
        ReresolvePolicy::Stale => tenant
            .resolved_at
            .is_some_and(|at| now.signed_duration_since(at) < stale_after),
        ReresolvePolicy::Always => false,
    };
    match (&tenant.strategy, fresh) {
        (_, false) => Plan::Resolve,
        (Strategy::Failed { .. }, true) => Plan::Skip,
        (strategy, true) => Plan::Reuse(strategy.clone()),
    }
}

pub fn after_api(outcome: &ApiOutcome, records: usize) -> Option<Strategy> {
    match outcome {
        ApiOutcome::Resolved { endpoint } if records > 0 => Some(Strategy::ApiResolved {
            endpoint: endpoint.clone(),
        }),
        _ => None,
    }
}

pub fn after_html(api: &ApiOutcome, html: &HtmlSummary, requests: RequestTally) -> Strategy {
    if html.records > 0 {
        return Strategy::HtmlFallback {
            listing_url: html.listing_url.clone(),
        };
    }
    let reason = if requests.all_network_failed() {
        FailureReason::Unreachable
    } else if html.links_found > 0 {
        FailureReason::HtmlParseFailed
    } else if matches!(api, ApiOutcome::Empty | ApiOutcome::Resolved { .. }) {
        FailureReason::ApiEmpty
    } else {
        FailureReason::NoApi
    };
    Strategy::Failed { reason }
}

#[derive(Debug, Default)]
pub struct TenantHarvest {
    pub strategy: Strategy,
    pub jobs: Vec<RawJob>,
    pub failed_detail_urls: Vec<String>,
    pub skipped_items: usize,
    pub interrupted: bool,
}

#[derive(Default)]
struct TenantRun {
    api: RequestTally,
    html: RequestTally,
    pages: HashMap<String, Option<String>>,
    interrupted: bool,
}

impl TenantRun {
    fn note_cancel<T>(&mut self, result: &FetchResult<T>) {
        if matches!(result, Err(err) if err.is_cancelled()) {
            self.interrupted = true;
        }
    }
}

pub struct EndpointResolver {
    fetcher: Arc<PoliteFetcher>,
    parser: Arc<dyn JobPageParser>,
    detail_cache: Option<PageCache>,
    config: Arc<HarvestConfig>,
}

impl EndpointResolver {
    pub fn new(fetcher: Arc<PoliteFetcher>, parser: Arc<dyn JobPageParser>, config: Arc<HarvestConfig>) -> Self {
        Self {
            fetcher,
            parser,
            detail_cache: config.detail_cache.clone().map(PageCache::new),
            config,
        }
    }

    pub async fn harvest(&self, tenant: &Tenant, plan: Plan) -> TenantHarvest {
        let mut run = TenantRun::default();
        let Some(base) = careers_base(&tenant.canonical_url) else {
            return TenantHarvest {
                strategy: Strategy::Failed {
                    reason: FailureReason::NoApi,
                },
                ..TenantHarvest::default()
            };
        };

        match plan {
            Plan::Skip => {
                return TenantHarvest {
                    strategy: tenant.strategy.clone(),
                    ..TenantHarvest::default()
                };
            }
            Plan::Reuse(Strategy::ApiResolved { endpoint }) => {
                let mut out = TenantHarvest::default();
                self.pull_api_pages(tenant, &endpoint, &mut run, &mut out).await;
                if !out.jobs.is_empty() {
                    info!(tenant = %tenant.host, %endpoint, jobs = out.jobs.len(), "cached api endpoint reused");
                    out.strategy = Strategy::ApiResolved { endpoint };
                    out.interrupted = run.interrupted;
                    return out;
                }
                if run.interrupted {
                    out.strategy = tenant.strategy.clone();
                    out.interrupted = true;
                    return out;
                }
                info!(tenant = %tenant.host, %endpoint, "cached api endpoint yielded nothing, resolving again");
                run = TenantRun::default();
            }
            Plan::Reuse(Strategy::HtmlFallback { .. }) => {
                let mut out = TenantHarvest::default();
                let summary = self.html_tier(tenant, &base, &mut run, &mut out).await;
                if summary.records > 0 || run.interrupted {
                    out.strategy = if summary.records > 0 {
                        Strategy::HtmlFallback {
                            listing_url: summary.listing_url,
                        }
                    } else {
                        tenant.strategy.clone()
                    };
                    out.interrupted = run.interrupted;
                    return out;
                }
                // Pages fetched above stay memoized for the full resolution.
                info!(tenant = %tenant.host, "cached html strategy yielded nothing, resolving again");
            }
            Plan::Reuse(_) | Plan::Resolve => {}
        }

        self.resolve(tenant, &base, &mut run).await
    }

    async fn resolve(&self, tenant: &Tenant, base: &str, run: &mut TenantRun) -> TenantHarvest {
        let mut out = TenantHarvest::default();

        let entry = self.get_page(base, FetchPurpose::EntryPage, run, true).await;
        if entry.is_none() && run.api.all_network_failed() {
            warn!(tenant = %tenant.host, url = base, "careers page unreachable");
            out.strategy = after_html(&ApiOutcome::NoEndpoint, &HtmlSummary::default(), run.api);
            out.interrupted = run.interrupted;
            return out;
        }

        let candidates = endpoint_candidates(
            base,
            entry.as_deref().unwrap_or_default(),
            self.config.max_api_probes,
        );
        let outcome = self.probe_api(tenant, &candidates, run).await;
        if let ApiOutcome::Resolved { endpoint } = &outcome {
            self.pull_api_pages(tenant, endpoint, run, &mut out).await;
        }
        if let Some(strategy) = after_api(&outcome, out.jobs.len()) {
            info!(tenant = %tenant.host, jobs = out.jobs.len(), "resolved via api");
            out.strategy = strategy;
            out.interrupted = run.interrupted;
            return out;
        }
        if run.interrupted {
            out.strategy = tenant.strategy.clone();
            out.interrupted = true;
            return out;
        }

        debug!(tenant = %tenant.host, outcome = ?outcome, "api tier gave nothing, trying html");
        let summary = self.html_tier(tenant, base, run, &mut out).await;
        out.interrupted = run.interrupted;
        if out.interrupted && summary.records == 0 {
            out.strategy = tenant.strategy.clone();
            return out;
        }
        out.strategy = after_html(&outcome, &summary, run.api.merge(run.html));
        match &out.strategy {
            Strategy::Failed { reason } => {
                warn!(tenant = %tenant.host, %reason, "tenant could not be harvested")
            }
            other => info!(tenant = %tenant.host, strategy = other.label(), jobs = out.jobs.len(), "tenant resolved"),
        }
        out
    }

    async fn probe_api(&self, tenant: &Tenant, candidates: &[String], run: &mut TenantRun) -> ApiOutcome {
        let mut saw_empty = false;
        for endpoint in candidates {
            if self.fetcher.is_stopping() {
                run.interrupted = true;
                break;
            }
            let result = self
                .fetcher
                .post_json(endpoint, &json!({"page": 1, "pageSize": 1}), FetchPurpose::ApiProbe)
                .await;
            run.api.record(&result);
            run.note_cancel(&result);
            let Ok(response) = result else {
                continue;
            };
            match response.json().as_ref().and_then(job_items) {
                Some(items) if !items.is_empty() => {
                    debug!(tenant = %tenant.host, %endpoint, "api probe accepted");
                    return ApiOutcome::Resolved {
                        endpoint: endpoint.clone(),
                    };
                }
                Some(_) => saw_empty = true,
                None => {
                    debug!(
                        tenant = %tenant.host,
                        %endpoint,
                        content_type = response.content_type.as_deref().unwrap_or("-"),
                        "api probe returned no job list"
                    );
                }
            }
        }
        if saw_empty {
            ApiOutcome::Empty
        } else {
            ApiOutcome::NoEndpoint
        }
    }

    async fn pull_api_pages(&self, tenant: &Tenant, endpoint: &str, run: &mut TenantRun, out: &mut TenantHarvest) {
        for page in 1..=self.config.max_api_pages {
            if self.fetcher.is_stopping() {
                run.interrupted = true;
                break;
            }
            let payload = json!({"page": page, "pageSize": self.config.api_page_size});
            let result = self.fetcher.post_json(endpoint, &payload, FetchPurpose::ApiPage).await;
            run.api.record(&result);
            run.note_cancel(&result);
            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    if !err.is_cancelled() {
                        warn!(tenant = %tenant.host, %endpoint, page, error = %err, "api page failed, keeping what we have");
                    }
                    break;
                }
            };
            let Some(items) = response.json().as_ref().and_then(job_items).cloned() else {
                break;
            };
            if items.is_empty() {
                break;
            }
            for item in items {
                match RawJob::from_api_value(&tenant.host, item) {
                    Ok(job) => out.jobs.push(job),
                    Err(err) => {
                        debug!(error = %err, "skipping api item");
                        out.skipped_items += 1;
                    }
                }
            }
        }
    }

    async fn html_tier(&self, tenant: &Tenant, base: &str, run: &mut TenantRun, out: &mut TenantHarvest) -> HtmlSummary {
        let listing_url = format!("{}/SearchJobs/", base.trim_end_matches('/'));
        let mut links: BTreeSet<String> = tenant.job_detail_seeds().into_iter().collect();
        if !links.is_empty() {
            debug!(tenant = %tenant.host, seeds = links.len(), "seed detail urls");
        }

        let mut instant = BTreeSet::new();
        if self.config.instant_search {
            instant = self.instant_search_links(tenant, base, run).await;
            if !instant.is_empty() {
                info!(tenant = %tenant.host, urls = instant.len(), "instant search detail urls");
            }
        }
        if instant.is_empty() && !run.interrupted {
            let listed = self.listing_links(tenant, &listing_url, run).await;
            debug!(tenant = %tenant.host, urls = listed.len(), "listing detail urls");
            links.extend(listed);
        }
        links.extend(instant);

        let links_found = links.len();
        let fields = self.fetch_details(links.into_iter().collect(), run, out).await;
        let records = fields.len();
        out.jobs
            .extend(fields.into_iter().map(|f| RawJob::from_html(&tenant.host, f)));
        HtmlSummary {
            listing_url,
            links_found,
            records,
        }
    }

    async fn listing_links(&self, tenant: &Tenant, listing_url: &str, run: &mut TenantRun) -> BTreeSet<String> {
        let size = self.config.listing_page_size;
        let mut links = BTreeSet::new();
        let mut low_yield = 0usize;
        for page in 0..self.config.max_listing_pages {
            if self.fetcher.is_stopping() {
                run.interrupted = true;
                break;
            }
            let url = format!("{listing_url}?jobOffset={}&jobRecordsPerPage={size}", page * size);
            let Some(html) = self.get_page(&url, FetchPurpose::Listing, run, false).await else {
                break;
            };
            let found = self.parser.detail_links(&url, &html);
            if found.is_empty() {
                break;
            }
            let before = links.len();
            links.extend(found);
            let added = links.len() - before;
            if added < self.config.min_new_per_page {
                low_yield += 1;
            } else {
                low_yield = 0;
            }
            if low_yield >= self.config.max_low_yield_pages {
                debug!(tenant = %tenant.host, pages = low_yield, "listing yield dried up");
                break;
            }
        }
        links
    }

    async fn instant_search_links(&self, tenant: &Tenant, base: &str, run: &mut TenantRun) -> BTreeSet<String> {
        let mut links = BTreeSet::new();
        let Some(tokens) = self.discover_tokens(base, run).await else {
            debug!(tenant = %tenant.host, "no instant search tokens");
            return links;
        };
        let endpoint = format!("{}/_instantSearch", base.trim_end_matches('/'));
        for term in &self.config.search_terms {
            if self.fetcher.is_stopping() {
                run.interrupted = true;
                break;
            }
            let payload = json!({
                "requestType": "job",
                "listSpecId": tokens.get("listSpecId"),
                "richFieldId": tokens.get("richFieldId"),
                "searchTerm": term,
                "searchIndexId": tokens.get("searchIndexId"),
                "contextValues": tokens.get("contextValues"),
                "isSemanticSearch": false,
            });
            let key = format!("POST {endpoint} {term}");
            let text = match run.pages.get(&key) {
                Some(cached) => cached.clone(),
                None => {
                    let result = self
                        .fetcher
                        .post_json(&endpoint, &payload, FetchPurpose::InstantSearch)
                        .await;
                    run.html.record(&result);
                    run.note_cancel(&result);
                    if matches!(result, Err(ref err) if err.is_cancelled()) {
                        continue;
                    }
                    let text = result.ok().map(|r| r.text());
                    run.pages.insert(key, text.clone());
                    text
                }
            };
            let Some(body) = text.and_then(|t| serde_json::from_str::<Value>(&t).ok()) else {
                continue;
            };
            let found = body
                .get("results")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|item| item.get("detailUrl").and_then(Value::as_str))
                .filter_map(|href| resolve_href(base, href));
            links.extend(found);
        }
        links
    }

    async fn discover_tokens(&self, base: &str, run: &mut TenantRun) -> Option<BTreeMap<&'static str, String>> {
        for page in instant_search_pages(base) {
            if self.fetcher.is_stopping() {
                run.interrupted = true;
                return None;
            }
            let Some(html) = self.get_page(&page, FetchPurpose::EntryPage, run, false).await else {
                continue;
            };
            let mut tokens = BTreeMap::new();
            extract_tokens(&html, &mut tokens);
            if has_all_tokens(&tokens) {
                return Some(tokens);
            }
            for script in same_host_scripts(&page, &html).into_iter().take(self.config.max_scripts) {
                let Some(text) = self.get_page(&script, FetchPurpose::Script, run, false).await else {
                    continue;
                };
                extract_tokens(&text, &mut tokens);
                if has_all_tokens(&tokens) {
                    return Some(tokens);
                }
            }
        }
        None
    }

    async fn fetch_details(&self, urls: Vec<String>, run: &mut TenantRun, out: &mut TenantHarvest) -> Vec<HtmlFields> {
        let mut fields = Vec::new();
        let mut pending = Vec::with_capacity(urls.len());
        for url in urls {
            match run.pages.get(&url) {
                Some(Some(html)) => {
                    if let Ok(parsed) = self.parser.parse_detail(&url, html) {
                        fields.push(parsed);
                    } else {
                        out.skipped_items += 1;
                    }
                    continue;
                }
                Some(None) => {
                    out.failed_detail_urls.push(url);
                    continue;
                }
                None => {}
            }
            match self.detail_cache.as_ref().and_then(|cache| cache.get(&url)) {
                Some(html) => match self.parser.parse_detail(&url, &html) {
                    Ok(parsed) => fields.push(parsed),
                    Err(_) => pending.push(url),
                },
                None => pending.push(url),
            }
        }
        if !fields.is_empty() {
            debug!(reused = fields.len(), fetching = pending.len(), "detail pages already on hand");
        }

        let fetcher = &self.fetcher;
        let results = stream::iter(pending)
            .map(|url| async move {
                let result = fetcher.fetch(&url, FetchPurpose::Detail).await;
                (url, result)
            })
            .buffer_unordered(self.config.detail_concurrency.max(1))
            .collect::<Vec<(String, FetchResult<FetchResponse>)>>()
            .await;

        for (url, result) in results {
            run.html.record(&result);
            run.note_cancel(&result);
            match result {
                Ok(response) => {
                    let html = response.text();
                    match self.parser.parse_detail(&url, &html) {
                        Ok(parsed) => {
                            self.store_detail(&url, &html);
                            fields.push(parsed);
                        }
                        Err(reason) => {
                            debug!(%url, %reason, "detail page not parsed");
                            out.skipped_items += 1;
                        }
                    }
                    run.pages.insert(url, Some(html));
                }
                Err(FetchError::Cancelled { .. }) => {}
                Err(err) => {
                    debug!(%url, status = ?err.status(), error = %err, "detail fetch failed");
                    run.pages.insert(url.clone(), None);
                    out.failed_detail_urls.push(url);
                }
            }
        }
        fields
    }

    fn store_detail(&self, url: &str, html: &str) {
        if let Some(cache) = &self.detail_cache {
            if let Err(err) = cache.put(url, html) {
                warn!(%url, error = %err, "detail page not cached");
            }
        }
    }

    // GET with a per-tenant memo; failures are remembered as `None`.
    async fn get_page(&self, url: &str, purpose: FetchPurpose, run: &mut TenantRun, api_tier: bool) -> Option<String> {
        if let Some(cached) = run.pages.get(url) {
            return cached.clone();
        }
        let result = self.fetcher.fetch(url, purpose).await;
        if api_tier {
            run.api.record(&result);
        } else {
            run.html.record(&result);
        }
        run.note_cancel(&result);
        if matches!(result, Err(ref err) if err.is_cancelled()) {
            return None;
        }
        let body = result.ok().map(|r| r.text());
        run.pages.insert(url.to_string(), body.clone());
        body
    }
}

fn job_items(body: &Value) -> Option<&Vec<Value>> {
    let arrays = ["jobs", "results"]
        .iter()
        .filter_map(|key| body.get(*key).and_then(Value::as_array))
        .collect::<Vec<_>>();
    arrays
        .iter()
        .find(|items| !items.is_empty())
        .or_else(|| arrays.first())
        .copied()
}

pub fn endpoint_candidates(base: &str, html: &str, cap: usize) -> Vec<String> {
    let base = base.trim_end_matches('/');
    let mut raw = Vec::new();
    for ep in COMMON_ENDPOINTS {
        if html.contains(ep) {
            raw.push(format!("{base}{ep}"));
        }
    }
    if let Some(re) = SERVICE_PATH.as_ref() {
        raw.extend(re.find_iter(html).map(|m| format!("{base}{}", m.as_str())));
    }
    if let Some(origin) = origin(base) {
        raw.extend(COMMON_ENDPOINTS.iter().map(|ep| format!("{origin}{ep}")));
    }
    raw.extend(COMMON_ENDPOINTS.iter().map(|ep| format!("{base}{ep}")));

    let mut seen = BTreeSet::new();
    raw.into_iter()
        .filter_map(|u| normalize_crawl_url(&u))
        .filter(|u| seen.insert(u.clone()))
        .take(cap)
        .collect()
}

fn instant_search_pages(base: &str) -> Vec<String> {
    let base = base.trim_end_matches('/');
    let Some(origin) = origin(base) else {
        return vec![base.to_string()];
    };
    let pages = [
        base.to_string(),
        format!("{base}/SearchJobs"),
        format!("{origin}/careers"),
        format!("{origin}/careers/SearchJobs"),
        format!("{origin}/en_US/careers"),
        format!("{origin}/en_US/careers/SearchJobs"),
        format!("{origin}/en-GB/careers"),
        format!("{origin}/en-GB/careers/SearchJobs"),
        format!("{origin}/careers?locale=en_US"),
    ];
    let mut seen = BTreeSet::new();
    pages.into_iter().filter(|p| seen.insert(p.clone())).collect()
}

pub fn extract_tokens(text: &str, tokens: &mut BTreeMap<&'static str, String>) {
    for (key, patterns) in TOKEN_PATTERNS.iter() {
        if tokens.contains_key(key) {
            continue;
        }
        if let Some(value) = patterns
            .iter()
            .find_map(|re| re.captures(text).and_then(|c| c.get(1)))
        {
            tokens.insert(*key, value.as_str().to_string());
        }
    }
}

fn has_all_tokens(tokens: &BTreeMap<&'static str, String>) -> bool {
    TOKEN_KEYS.iter().all(|k| tokens.contains_key(k))
}

fn same_host_scripts(page_url: &str, html: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("script[src]") else {
        return Vec::new();
    };
    let host = host_of(page_url);
    let doc = Html::parse_document(html);
    let mut seen = BTreeSet::new();
    doc.select(&selector)
        .filter_map(|el| el.value().attr("src"))
        .filter_map(|src| resolve_href(page_url, src))
        .filter(|url| host.is_some() && host_of(url) == host)
        .filter(|url| seen.insert(url.clone()))
        .collect()
}
