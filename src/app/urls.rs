use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static URL_IN_TEXT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s)>"'<]+"#).ok());

static JOB_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"/JobDetail/[^?#]+?/([0-9]+)(?:[/?#]|$)",
        r"/JobDetail/([0-9]+)(?:[/?#]|$)",
        r"[?&]jobId=([0-9]+)",
    ]
    .into_iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

pub fn is_same_host(candidate: &str, root_host: Option<&str>) -> bool {
    let Some(root) = root_host else {
        return true;
    };

    Url::parse(candidate)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(root)))
        .unwrap_or(false)
}

pub fn normalize_crawl_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut url = Url::parse(trimmed).ok()?;
    let scheme = url.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return None;
    }
    url.host_str()?;

    let kept_params = url
        .query_pairs()
        .filter_map(|(k, v)| {
            if is_tracking_query_param(&k) {
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect::<Vec<_>>();
    if kept_params.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in kept_params {
            serializer.append_pair(&k, &v);
        }
        url.set_query(Some(&serializer.finish()));
    }

    url.set_fragment(None);
    Some(url.to_string())
}

pub fn is_tracking_query_param(param: &str) -> bool {
    let name = param.to_ascii_lowercase();
    if name.starts_with("utm_") || name.starts_with("gad_") {
        return true;
    }
    matches!(
        name.as_str(),
        "gclid" | "fbclid" | "gbraid" | "wbraid" | "_gl" | "mc_cid" | "mc_eid"
    )
}

pub fn resolve_href(page_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("javascript:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let resolved = if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        let base = Url::parse(page_url).ok()?;
        base.join(href).ok()?.to_string()
    };
    normalize_crawl_url(&resolved)
}

pub fn host_of(raw: &str) -> Option<String> {
    Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

pub fn is_platform_host(host: &str, platform_domain: &str) -> bool {
    let host = host.trim_end_matches('.');
    if host.eq_ignore_ascii_case(platform_domain) {
        return true;
    }
    host.len() > platform_domain.len() + 1
        && host.to_ascii_lowercase().ends_with(platform_domain)
        && host.as_bytes()[host.len() - platform_domain.len() - 1] == b'.'
}

pub fn origin(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

// Careers root for an entry URL: the path up to a `careers` segment when one is
// present, otherwise `<origin>/careers`.
pub fn careers_base(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let origin = origin(raw)?;
    let segments = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();
    let cut = segments
        .iter()
        .position(|seg| seg.eq_ignore_ascii_case("careers"));
    match cut {
        Some(idx) => Some(format!("{}/{}", origin, segments[..=idx].join("/"))),
        None => Some(format!("{origin}/careers")),
    }
}

pub fn path_segment_count(raw: &str) -> usize {
    Url::parse(raw)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .map(|s| s.filter(|seg| !seg.is_empty()).count())
        })
        .unwrap_or(0)
}

pub fn has_query(raw: &str) -> bool {
    Url::parse(raw).map(|u| u.query().is_some()).unwrap_or(false)
}

pub fn extract_urls(line: &str) -> Vec<String> {
    let Some(re) = URL_IN_TEXT.as_ref() else {
        return Vec::new();
    };
    re.find_iter(line)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
        .collect()
}

pub fn is_job_detail_url(raw: &str) -> bool {
    raw.contains("JobDetail")
}

pub fn job_id_from_url(raw: &str) -> Option<String> {
    JOB_ID_PATTERNS
        .iter()
        .find_map(|re| re.captures(raw).and_then(|c| c.get(1)))
        .map(|m| m.as_str().to_string())
}

pub fn title_from_slug(raw: &str) -> Option<String> {
    let (_, rest) = raw.split_once("/JobDetail/")?;
    let slug = rest.split(['/', '?', '#']).next()?;
    if slug.is_empty() || slug.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(slug.replace('-', " "))
}
