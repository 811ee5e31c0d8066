use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use super::config::FetchConfig;
use super::fetch::{RequestMethod, Transport, TransportError, TransportRequest, TransportResponse};
use super::urls::host_of;

#[derive(Debug, Clone)]
pub enum MockReply {
    Response {
        status: u16,
        content_type: &'static str,
        body: Vec<u8>,
        retry_after: Option<String>,
    },
    Timeout,
    Dns,
}

impl MockReply {
    pub fn html(status: u16, body: &str) -> Self {
        MockReply::Response {
            status,
            content_type: "text/html; charset=utf-8",
            body: body.as_bytes().to_vec(),
            retry_after: None,
        }
    }

    pub fn json(status: u16, body: Value) -> Self {
        MockReply::Response {
            status,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
            retry_after: None,
        }
    }

    pub fn bytes(status: u16, body: Vec<u8>) -> Self {
        MockReply::Response {
            status,
            content_type: "application/octet-stream",
            body,
            retry_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::html(status, "")
    }

    pub fn retry_after(status: u16, after: &str) -> Self {
        MockReply::Response {
            status,
            content_type: "text/html",
            body: Vec::new(),
            retry_after: Some(after.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub method: RequestMethod,
    pub accept: String,
    pub started: Instant,
}

#[derive(Default)]
struct Routes {
    queued: HashMap<String, VecDeque<MockReply>>,
    standing: HashMap<String, MockReply>,
    host_default: HashMap<String, MockReply>,
}

#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Routes>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Duration,
    in_flight: Mutex<HashMap<String, usize>>,
    peaks: Mutex<HashMap<String, usize>>,
    global_in_flight: AtomicUsize,
    global_peak: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn on_get(&self, url: &str, reply: MockReply) {
        self.routes
            .lock()
            .unwrap()
            .standing
            .insert(format!("GET {url}"), reply);
    }

    pub fn on_post(&self, url: &str, reply: MockReply) {
        self.routes
            .lock()
            .unwrap()
            .standing
            .insert(format!("POST {url}"), reply);
    }

    pub fn queue_get(&self, url: &str, replies: Vec<MockReply>) {
        self.routes
            .lock()
            .unwrap()
            .queued
            .entry(format!("GET {url}"))
            .or_default()
            .extend(replies);
    }

    pub fn queue_post(&self, url: &str, replies: Vec<MockReply>) {
        self.routes
            .lock()
            .unwrap()
            .queued
            .entry(format!("POST {url}"))
            .or_default()
            .extend(replies);
    }

    pub fn on_host(&self, host: &str, reply: MockReply) {
        self.routes
            .lock()
            .unwrap()
            .host_default
            .insert(host.to_string(), reply);
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.url == url)
            .count()
    }

    pub fn posted_payloads(&self, url: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.url == url)
            .filter_map(|c| match &c.method {
                RequestMethod::PostJson(payload) => Some(payload.clone()),
                RequestMethod::Get => None,
            })
            .collect()
    }

    pub fn accept_headers(&self, url: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.url == url)
            .map(|c| c.accept.clone())
            .collect()
    }

    pub fn start_times(&self, host: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| host_of(&c.url).as_deref() == Some(host))
            .map(|c| c.started)
            .collect()
    }

    pub fn peak_in_flight(&self, host: &str) -> usize {
        self.peaks.lock().unwrap().get(host).copied().unwrap_or(0)
    }

    pub fn global_peak_in_flight(&self) -> usize {
        self.global_peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, key: &str, host: &str) -> MockReply {
        let mut routes = self.routes.lock().unwrap();
        if let Some(reply) = routes.queued.get_mut(key).and_then(VecDeque::pop_front) {
            return reply;
        }
        routes
            .standing
            .get(key)
            .or_else(|| routes.host_default.get(host))
            .cloned()
            .unwrap_or_else(|| MockReply::status(404))
    }

    fn enter(&self, host: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let current = in_flight.entry(host.to_string()).or_default();
        *current += 1;
        let mut peaks = self.peaks.lock().unwrap();
        let peak = peaks.entry(host.to_string()).or_default();
        *peak = (*peak).max(*current);
        let global = self.global_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.global_peak.fetch_max(global, Ordering::SeqCst);
    }

    fn leave(&self, host: &str) {
        if let Some(current) = self.in_flight.lock().unwrap().get_mut(host) {
            *current = current.saturating_sub(1);
        }
        self.global_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let host = host_of(&request.url).unwrap_or_default();
        let key = match request.method {
            RequestMethod::Get => format!("GET {}", request.url),
            RequestMethod::PostJson(_) => format!("POST {}", request.url),
        };
        self.calls.lock().unwrap().push(RecordedCall {
            url: request.url.clone(),
            method: request.method.clone(),
            accept: request.accept.clone(),
            started: Instant::now(),
        });

        self.enter(&host);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let reply = self.next_reply(&key, &host);
        self.leave(&host);

        match reply {
            MockReply::Timeout => Err(TransportError::Timeout(request.url.clone())),
            MockReply::Dns => Err(TransportError::Dns(format!("failed to lookup address for {host}"))),
            MockReply::Response {
                status,
                content_type,
                body,
                retry_after,
            } => {
                let mut response = TransportResponse {
                    status,
                    final_url: request.url.clone(),
                    content_type: Some(content_type.to_string()),
                    retry_after,
                    ..TransportResponse::default()
                };
                match &request.sink {
                    Some(path) if status < 300 => {
                        tokio::fs::write(path, &body)
                            .await
                            .map_err(|source| TransportError::Sink {
                                path: path.clone(),
                                source,
                            })?;
                        response.bytes_written = body.len() as u64;
                    }
                    _ => response.body = body,
                }
                Ok(response)
            }
        }
    }
}

pub fn fast_fetch_config() -> FetchConfig {
    FetchConfig {
        max_in_flight_per_host: 4,
        min_spacing_ms: 0,
        max_attempts: 4,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
        jitter_ms: 2,
        connect_timeout_ms: 1_000,
        attempt_timeout_ms: 2_000,
        download_timeout_secs: 5,
        max_retry_after_secs: 5,
        ..FetchConfig::default()
    }
}
