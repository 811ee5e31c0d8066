use std::collections::HashMap;
use std::error::Error as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER,
};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::FetchConfig;
use super::error::{FetchError, FetchResult};
use super::urls::host_of;

const RETRYABLE_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];
const RELAXED_ACCEPT: &str = "*/*";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FetchPurpose {
    Shard,
    EntryPage,
    ApiProbe,
    ApiPage,
    Listing,
    Detail,
    Script,
    InstantSearch,
}

impl FetchPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchPurpose::Shard => "shard",
            FetchPurpose::EntryPage => "entry-page",
            FetchPurpose::ApiProbe => "api-probe",
            FetchPurpose::ApiPage => "api-page",
            FetchPurpose::Listing => "listing",
            FetchPurpose::Detail => "detail",
            FetchPurpose::Script => "script",
            FetchPurpose::InstantSearch => "instant-search",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestMethod {
    Get,
    PostJson(Value),
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub method: RequestMethod,
    pub accept: String,
    pub sink: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub retry_after: Option<String>,
    pub body: Vec<u8>,
    pub bytes_written: u64,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("dns lookup failed: {0}")]
    Dns(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("body read failed: {0}")]
    Body(String),
    #[error("could not write {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Body(_)
        )
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&config.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, value);
        }
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(8)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let builder = match &request.method {
            RequestMethod::Get => self.client.get(&request.url),
            RequestMethod::PostJson(payload) => self.client.post(&request.url).json(payload),
        };
        let response = builder
            .header(ACCEPT, request.accept.as_str())
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let mut out = TransportResponse {
            status,
            final_url: response.url().to_string(),
            content_type: header(CONTENT_TYPE),
            retry_after: header(RETRY_AFTER),
            ..TransportResponse::default()
        };

        match (&request.sink, response.status().is_success()) {
            (Some(path), true) => {
                out.bytes_written = stream_to_file(response, path).await?;
            }
            _ => {
                out.body = response
                    .bytes()
                    .await
                    .map_err(classify_reqwest_error)?
                    .to_vec();
            }
        }
        Ok(out)
    }
}

async fn stream_to_file(response: reqwest::Response, path: &Path) -> Result<u64, TransportError> {
    let sink_err = |source| TransportError::Sink {
        path: path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::create(path).await.map_err(sink_err)?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify_reqwest_error)?;
        file.write_all(&chunk).await.map_err(sink_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(sink_err)?;
    Ok(written)
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    let message = err.to_string();
    if err.is_timeout() {
        TransportError::Timeout(message)
    } else if is_dns_failure(&err) {
        TransportError::Dns(message)
    } else if err.is_builder() {
        TransportError::Invalid(message)
    } else if err.is_connect() {
        TransportError::Connect(message)
    } else {
        TransportError::Body(message)
    }
}

fn is_dns_failure(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(inner) = source {
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = inner.source();
    }
    false
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

#[derive(Debug, Default)]
struct HostSchedule {
    next_start: Option<Instant>,
    backoff_until: Option<Instant>,
}

struct HostSlot {
    permits: Semaphore,
    schedule: AsyncMutex<HostSchedule>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl HostSlot {
    fn new(limit: usize) -> Self {
        Self {
            permits: Semaphore::new(limit),
            schedule: AsyncMutex::new(HostSchedule::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    async fn reserve_start(&self, spacing: Duration) -> Duration {
        let mut schedule = self.schedule.lock().await;
        let now = Instant::now();
        let mut start = now;
        if let Some(next) = schedule.next_start {
            start = start.max(next);
        }
        if let Some(until) = schedule.backoff_until {
            if until > now {
                start = start.max(until);
            } else {
                schedule.backoff_until = None;
            }
        }
        schedule.next_start = Some(start + spacing);
        start - now
    }

    async fn push_backoff(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut schedule = self.schedule.lock().await;
        if schedule.backoff_until.is_none_or(|current| current < until) {
            schedule.backoff_until = Some(until);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub requests: u64,
    pub retries: u64,
    pub failures: u64,
    pub peak_per_host: usize,
}

#[derive(Default)]
struct StatCounters {
    requests: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

enum Attempt {
    Done(TransportResponse),
    Retry { delay: Duration, status: Option<u16>, reason: String },
    Relax,
    Fail(FetchError),
}

pub struct PoliteFetcher {
    transport: Arc<dyn Transport>,
    config: FetchConfig,
    hosts: std::sync::Mutex<HashMap<String, Arc<HostSlot>>>,
    stop: Arc<AtomicBool>,
    stats: StatCounters,
}

impl PoliteFetcher {
    pub fn new(transport: Arc<dyn Transport>, config: FetchConfig, stop: Arc<AtomicBool>) -> Self {
        Self {
            transport,
            config,
            hosts: std::sync::Mutex::new(HashMap::new()),
            stop,
            stats: StatCounters::default(),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub async fn fetch(&self, url: &str, purpose: FetchPurpose) -> FetchResult<FetchResponse> {
        let response = self
            .run(url, RequestMethod::Get, None, purpose, self.config.attempt_timeout())
            .await?;
        Ok(into_fetch_response(url, response))
    }

    pub async fn post_json(
        &self,
        url: &str,
        payload: &Value,
        purpose: FetchPurpose,
    ) -> FetchResult<FetchResponse> {
        let response = self
            .run(
                url,
                RequestMethod::PostJson(payload.clone()),
                None,
                purpose,
                self.config.attempt_timeout(),
            )
            .await?;
        Ok(into_fetch_response(url, response))
    }

    pub async fn download(&self, url: &str, dest: &Path, purpose: FetchPurpose) -> FetchResult<u64> {
        let response = self
            .run(
                url,
                RequestMethod::Get,
                Some(dest.to_path_buf()),
                purpose,
                self.config.download_timeout(),
            )
            .await?;
        Ok(response.bytes_written)
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            requests: self.stats.requests.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            peak_per_host: self
                .lock_hosts()
                .values()
                .map(|slot| slot.peak_in_flight.load(Ordering::Relaxed))
                .max()
                .unwrap_or(0),
        }
    }

    #[cfg(test)]
    pub fn peak_in_flight(&self, host: &str) -> usize {
        self.lock_hosts()
            .get(&host.to_ascii_lowercase())
            .map(|slot| slot.peak_in_flight.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn lock_hosts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<HostSlot>>> {
        self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot_for(&self, host: &str) -> Arc<HostSlot> {
        let mut hosts = self.lock_hosts();
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostSlot::new(self.config.max_in_flight_per_host)))
            .clone()
    }

    async fn run(
        &self,
        url: &str,
        method: RequestMethod,
        sink: Option<PathBuf>,
        purpose: FetchPurpose,
        timeout: Duration,
    ) -> FetchResult<TransportResponse> {
        let Some(host) = host_of(url) else {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            return Err(FetchError::Permanent {
                url: url.to_string(),
                status: None,
                reason: "malformed url".to_string(),
            });
        };
        let slot = self.slot_for(&host);
        let mut request = TransportRequest {
            url: url.to_string(),
            method,
            accept: self.config.accept.clone(),
            sink,
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1usize;
        loop {
            let outcome = self.attempt(&slot, &host, &request, purpose, timeout, attempt).await;
            match outcome {
                Attempt::Done(response) => return Ok(response),
                Attempt::Fail(err) => {
                    if !err.is_cancelled() {
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    }
                    return Err(err);
                }
                Attempt::Relax => {
                    debug!(%host, url, "406 received, retrying with relaxed accept header");
                    request.accept = RELAXED_ACCEPT.to_string();
                    continue;
                }
                Attempt::Retry { delay, status, reason } => {
                    if attempt >= max_attempts {
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(FetchError::Transient {
                            url: url.to_string(),
                            attempts: attempt,
                            status,
                            reason,
                        });
                    }
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        %host,
                        url,
                        purpose = purpose.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        slot: &HostSlot,
        host: &str,
        request: &TransportRequest,
        purpose: FetchPurpose,
        timeout: Duration,
        attempt: usize,
    ) -> Attempt {
        if self.is_stopping() {
            return Attempt::Fail(cancelled(&request.url));
        }
        let Ok(_permit) = slot.permits.acquire().await else {
            return Attempt::Fail(cancelled(&request.url));
        };
        let wait = slot.reserve_start(self.config.min_spacing()).await;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        if self.is_stopping() {
            return Attempt::Fail(cancelled(&request.url));
        }

        let current = slot.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        slot.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let result = tokio::time::timeout(timeout, self.transport.execute(request)).await;
        slot.in_flight.fetch_sub(1, Ordering::SeqCst);

        let response = match result {
            Err(_) => {
                return Attempt::Retry {
                    delay: self.backoff_delay(attempt),
                    status: None,
                    reason: format!("attempt timed out after {}ms", timeout.as_millis()),
                };
            }
            Ok(Err(TransportError::Sink { path, source })) => {
                return Attempt::Fail(FetchError::Io { path, source });
            }
            Ok(Err(err)) if err.is_transient() => {
                return Attempt::Retry {
                    delay: self.backoff_delay(attempt),
                    status: None,
                    reason: err.to_string(),
                };
            }
            Ok(Err(err)) => {
                return Attempt::Fail(FetchError::Permanent {
                    url: request.url.clone(),
                    status: None,
                    reason: err.to_string(),
                });
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status;
        if status < 400 {
            return Attempt::Done(response);
        }
        if status == 406 && request.accept != RELAXED_ACCEPT {
            return Attempt::Relax;
        }
        if !RETRYABLE_STATUS.contains(&status) {
            return Attempt::Fail(FetchError::Permanent {
                url: request.url.clone(),
                status: Some(status),
                reason: format!("http {status}"),
            });
        }

        let mut delay = self.backoff_delay(attempt);
        if status == 429 || status == 503 {
            if let Some(after) = response.retry_after.as_deref().and_then(parse_retry_after) {
                delay = after.min(Duration::from_secs(self.config.max_retry_after_secs));
            }
            slot.push_backoff(delay).await;
            warn!(
                %host,
                purpose = purpose.as_str(),
                status,
                delay_ms = delay.as_millis() as u64,
                "host asked us to slow down"
            );
        }
        Attempt::Retry {
            delay,
            status: Some(status),
            reason: format!("http {status}"),
        }
    }

    // `base * 2^(attempt-1)` capped at `max_backoff`, plus uniform jitter.
    fn backoff_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20) as u32;
        let raw = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_backoff_ms);
        let jitter = if self.config.jitter_ms > 0 {
            rand::rng().random_range(0..self.config.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(raw + jitter)
    }
}

fn cancelled(url: &str) -> FetchError {
    FetchError::Cancelled {
        url: url.to_string(),
    }
}

fn into_fetch_response(requested: &str, response: TransportResponse) -> FetchResponse {
    FetchResponse {
        url: if response.final_url.is_empty() {
            requested.to_string()
        } else {
            response.final_url
        },
        status: response.status,
        content_type: response.content_type,
        body: response.body,
    }
}

pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    let when = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
