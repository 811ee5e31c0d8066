use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use super::error::NormalizeError;
use super::parser::{HtmlFields, html_to_text};
use super::urls::{is_same_host, job_id_from_url, normalize_crawl_url};

const ID_KEYS: [&str; 3] = ["id", "jobId", "requisitionId"];
const TITLE_KEYS: [&str; 2] = ["title", "name"];
const LOCATION_KEYS: [&str; 2] = ["location", "city"];
const POSTED_KEYS: [&str; 3] = ["postedDate", "datePosted", "posted_date"];
const POSTING_URL_KEYS: [&str; 3] = ["url", "detailUrl", "jobUrl"];
const APPLY_URL_KEYS: [&str; 2] = ["applyUrl", "apply_url"];
const DESCRIPTION_KEYS: [&str; 2] = ["description", "descriptionHtml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Html,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Api => "api",
            SourceKind::Html => "html",
        }
    }
}

#[derive(Debug, Clone)]
pub enum RawPayload {
    Api(Map<String, Value>),
    Html(HtmlFields),
}

#[derive(Debug, Clone)]
pub struct RawJob {
    pub tenant_host: String,
    pub payload: RawPayload,
    pub fetched_at: DateTime<Utc>,
}

impl RawJob {
    pub fn from_api_value(tenant_host: &str, value: Value) -> Result<Self, NormalizeError> {
        match value {
            Value::Object(map) => Ok(Self {
                tenant_host: tenant_host.to_string(),
                payload: RawPayload::Api(map),
                fetched_at: Utc::now(),
            }),
            other => Err(NormalizeError::Parse {
                tenant: tenant_host.to_string(),
                reason: format!("expected an object, got {}", json_kind(&other)),
            }),
        }
    }

    pub fn from_html(tenant_host: &str, fields: HtmlFields) -> Self {
        Self {
            tenant_host: tenant_host.to_string(),
            payload: RawPayload::Html(fields),
            fetched_at: Utc::now(),
        }
    }

    pub fn source(&self) -> SourceKind {
        match self.payload {
            RawPayload::Api(_) => SourceKind::Api,
            RawPayload::Html(_) => SourceKind::Html,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub tenant_host: String,
    pub company: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posting_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_date: Option<String>,
    pub source: SourceKind,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_html: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub canonical_url: String,
    pub company: String,
}

struct Extracted {
    job_id: Option<String>,
    title: Option<String>,
    location: Option<String>,
    posted_date: Option<String>,
    posting_url: Option<String>,
    apply_url: Option<String>,
    description: Option<String>,
    metadata: BTreeMap<String, String>,
}

pub fn normalize(raw: RawJob, ctx: &NormalizeContext) -> Result<JobRecord, NormalizeError> {
    let source = raw.source();
    let host = raw.tenant_host.to_ascii_lowercase();
    let extracted = match raw.payload {
        RawPayload::Api(map) => Extracted {
            job_id: first_value(&map, &ID_KEYS),
            title: first_value(&map, &TITLE_KEYS),
            location: first_value(&map, &LOCATION_KEYS),
            posted_date: first_value(&map, &POSTED_KEYS),
            posting_url: first_value(&map, &POSTING_URL_KEYS),
            apply_url: first_value(&map, &APPLY_URL_KEYS),
            description: first_value(&map, &DESCRIPTION_KEYS),
            metadata: BTreeMap::new(),
        },
        RawPayload::Html(fields) => Extracted {
            job_id: fields.job_id,
            title: fields.title,
            location: fields.location,
            posted_date: fields.posted_date,
            posting_url: Some(fields.page_url),
            apply_url: fields.apply_url,
            description: fields.description_html,
            metadata: fields
                .metadata
                .into_iter()
                .map(|(k, v)| (clean_text(&k), clean_text(&v)))
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .collect(),
        },
    };

    let posting_url = extracted
        .posting_url
        .as_deref()
        .and_then(|u| resolve_against(&ctx.canonical_url, u))
        .filter(|u| {
            let on_host = is_same_host(u, Some(&host));
            if !on_host {
                debug!(tenant = %host, url = %u, "discarding off-host posting url");
            }
            on_host
        });
    let job_id = extracted
        .job_id
        .as_deref()
        .map(clean_text)
        .filter(|id| !id.is_empty())
        .or_else(|| posting_url.as_deref().and_then(job_id_from_url));

    if job_id.is_none() && posting_url.is_none() {
        return Err(NormalizeError::MissingIdentity { tenant: host });
    }

    let title = extracted.title.as_deref().map(clean_text).unwrap_or_default();
    let (description_text, description_html) = match extracted.description {
        Some(desc) if looks_like_html(&desc) => {
            let text = clean_text(&html_to_text(&desc));
            (non_empty(text), non_empty(desc.trim().to_string()))
        }
        Some(desc) => (non_empty(clean_text(&desc)), None),
        None => (None, None),
    };
    let content_hash = content_hash(&title, description_text.as_deref().unwrap_or_default());

    Ok(JobRecord {
        tenant_host: host,
        company: ctx.company.clone(),
        job_id,
        title,
        location: extracted.location.as_deref().map(clean_text).and_then(non_empty),
        posting_url,
        apply_url: extracted
            .apply_url
            .as_deref()
            .and_then(|u| resolve_against(&ctx.canonical_url, u)),
        posted_date: extracted.posted_date.as_deref().map(clean_text).and_then(non_empty),
        source,
        content_hash,
        description_text,
        description_html,
        metadata: extracted.metadata,
        fetched_at: raw.fetched_at,
    })
}

// First alias present as a usable scalar. Arrays and objects are flattened to
// their string leaves, so `["Paris", "FR"]` becomes `Paris, FR`.
fn first_value(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find_map(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => {
            let parts = items.iter().filter_map(scalar_text).collect::<Vec<_>>();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        Value::Object(map) => {
            let parts = map.values().filter_map(scalar_text).collect::<Vec<_>>();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

pub fn clean_text(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn looks_like_html(s: &str) -> bool {
    let trimmed = s.trim_start();
    trimmed.starts_with('<') || (s.contains("</") && s.contains('>'))
}

fn resolve_against(base: &str, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let joined = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => Url::parse(base).ok()?.join(raw).ok()?,
    };
    normalize_crawl_url(joined.as_str())
}

pub fn content_hash(title: &str, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\n");
    hasher.update(description.as_bytes());
    hex::encode(hasher.finalize())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx() -> NormalizeContext {
        NormalizeContext {
            canonical_url: "https://acme.avature.net/careers".to_string(),
            company: "Acme".to_string(),
        }
    }

    fn api(value: Value) -> RawJob {
        RawJob::from_api_value("acme.avature.net", value).unwrap()
    }

    #[test]
    fn api_aliases_map_onto_canonical_fields() {
        let record = normalize(
            api(json!({
                "jobId": 4521,
                "name": "  Senior\tEngineer\u{0007} ",
                "city": ["Paris", "FR"],
                "datePosted": "2026-09-01",
                "detailUrl": "/careers/JobDetail/Senior-Engineer/4521?utm_source=feed",
                "apply_url": "https://apply.example.com/4521",
                "descriptionHtml": "<p>Ship <em>code</em></p>"
            })),
            &ctx(),
        )
        .unwrap();
        assert_eq!(record.job_id.as_deref(), Some("4521"));
        assert_eq!(record.title, "Senior Engineer");
        assert_eq!(record.location.as_deref(), Some("Paris, FR"));
        assert_eq!(record.posted_date.as_deref(), Some("2026-09-01"));
        assert_eq!(
            record.posting_url.as_deref(),
            Some("https://acme.avature.net/careers/JobDetail/Senior-Engineer/4521")
        );
        assert_eq!(record.apply_url.as_deref(), Some("https://apply.example.com/4521"));
        assert_eq!(record.description_text.as_deref(), Some("Ship code"));
        assert_eq!(record.description_html.as_deref(), Some("<p>Ship <em>code</em></p>"));
        assert_eq!(record.source, SourceKind::Api);
        assert_eq!(record.content_hash, content_hash("Senior Engineer", "Ship code"));
    }

    #[test]
    fn record_without_id_or_url_is_dropped() {
        let err = normalize(api(json!({"title": "Mystery role", "location": "Remote"})), &ctx()).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::MissingIdentity {
                tenant: "acme.avature.net".to_string()
            }
        );
    }

    #[test]
    fn off_host_posting_url_is_discarded() {
        let record = normalize(
            api(json!({"id": "9", "title": "Analyst", "url": "https://elsewhere.example.com/job/9"})),
            &ctx(),
        )
        .unwrap();
        assert_eq!(record.posting_url, None);

        let err = normalize(
            api(json!({"title": "Analyst", "url": "https://elsewhere.example.com/job/9"})),
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(err, NormalizeError::MissingIdentity { .. }));
    }

    #[test]
    fn optional_fields_stay_absent() {
        let record = normalize(
            api(json!({"title": "Intern", "url": "https://acme.avature.net/careers/JobDetail/Intern"})),
            &ctx(),
        )
        .unwrap();
        assert_eq!(record.job_id, None);
        assert_eq!(record.location, None);
        assert_eq!(record.description_text, None);
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains("location"));
    }

    #[test]
    fn html_fields_take_id_from_page_url() {
        let fields = HtmlFields {
            page_url: "https://acme.avature.net/careers/JobDetail/Software-Engineer/4521".to_string(),
            title: Some("Software Engineer".to_string()),
            description_html: Some("<p>Hello</p>".to_string()),
            ..HtmlFields::default()
        };
        let record = normalize(RawJob::from_html("ACME.avature.net", fields), &ctx()).unwrap();
        assert_eq!(record.tenant_host, "acme.avature.net");
        assert_eq!(record.job_id.as_deref(), Some("4521"));
        assert_eq!(record.source, SourceKind::Html);
        assert_eq!(record.description_text.as_deref(), Some("Hello"));
    }

    #[test]
    fn non_object_api_item_is_a_parse_error() {
        let err = RawJob::from_api_value("acme.avature.net", json!(["x"])).unwrap_err();
        assert!(matches!(err, NormalizeError::Parse { .. }));
    }
}
