//! Payload documents stored for each timed request

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, Request, StatusCode};
use serde_json::{Map, Value, json};

/// Headers copied into the payload when no allow-list is configured
pub const DEFAULT_HEADER_ALLOWLIST: [&str; 8] = [
    "host",
    "user-agent",
    "accept",
    "content-type",
    "content-length",
    "referer",
    "x-request-id",
    "x-forwarded-for",
];

/// Headers that never end up in a payload, allow-listed or not
pub const SENSITIVE_HEADERS: [&str; 5] = [
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
];

/// Longest header value kept, in bytes
pub const MAX_HEADER_VALUE_LEN: usize = 256;

/// Per-request session values an upstream layer wants recorded.
///
/// Insert it into the request extensions before the timing layer sees the
/// request to have it copied into `"request.session"`.
#[derive(Debug, Clone, Default)]
pub struct SessionData(pub Map<String, Value>);

/// Header names that may be copied into a payload
#[derive(Debug, Clone)]
pub struct HeaderAllowlist(Vec<HeaderName>);

impl HeaderAllowlist {
    /// Build from header names. Invalid and sensitive names are dropped.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .filter_map(|name| HeaderName::try_from(name.as_ref().trim().to_ascii_lowercase()).ok())
            .filter(|name| !SENSITIVE_HEADERS.contains(&name.as_str()))
            .collect();
        Self(names)
    }

    pub fn contains(&self, name: &HeaderName) -> bool {
        self.0.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderName> {
        self.0.iter()
    }
}

impl Default for HeaderAllowlist {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_ALLOWLIST)
    }
}

/// Copy allow-listed headers into a JSON map. Repeated headers are joined
/// with `", "`, non-UTF-8 values are skipped and long values truncated.
pub fn filter_headers(headers: &HeaderMap, allowlist: &HeaderAllowlist) -> Map<String, Value> {
    let mut filtered = Map::new();

    for name in allowlist.iter() {
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        if values.is_empty() {
            continue;
        }

        let joined = values.join(", ");
        filtered.insert(
            name.as_str().to_string(),
            Value::String(truncate(&joined, MAX_HEADER_VALUE_LEN).to_string()),
        );
    }

    filtered
}

fn truncate(value: &str, max_len: usize) -> &str {
    if value.len() <= max_len {
        return value;
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// What the middleware remembers about a request before handing it on
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub headers: Map<String, Value>,
    pub session: Option<Map<String, Value>>,
}

impl RequestSnapshot {
    pub fn capture<B>(request: &Request<B>, allowlist: &HeaderAllowlist) -> Self {
        Self {
            method: request.method().to_string(),
            url: request_url(request),
            headers: filter_headers(request.headers(), allowlist),
            session: request
                .extensions()
                .get::<SessionData>()
                .map(|session| session.0.clone()),
        }
    }

    /// Payload document for this request
    pub fn into_payload(self, elapsed: Duration, status: StatusCode) -> Value {
        json!({
            "execution_time": elapsed.as_secs_f64(),
            "request.url": self.url,
            "request.method": self.method,
            "request.headers": self.headers,
            "request.session": self.session,
            "response.status": status.as_u16(),
        })
    }
}

/// Absolute URL of the request when the host is known, else path and query
fn request_url<B>(request: &Request<B>) -> String {
    let uri = request.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return uri.to_string();
    }

    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let headers = request.headers();
    match headers.get("host").and_then(|host| host.to_str().ok()) {
        Some(host) => {
            let scheme = headers
                .get("x-forwarded-proto")
                .and_then(|proto| proto.to_str().ok())
                .unwrap_or("http");
            format!("{scheme}://{host}{path}")
        }
        None => path.to_string(),
    }
}
