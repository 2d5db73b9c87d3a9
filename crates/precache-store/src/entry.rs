//! Cache keys and stored response snapshots.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::VARY;
use http::{HeaderMap, HeaderName, HeaderValue};
use precache_net::{Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::CacheError;

/// Normalized request descriptor: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Key for a request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method.as_str(), &request.url)
    }

    /// Key for a method and URL.
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Whether this key can hold a stored response.
    pub fn is_storable(&self) -> bool {
        self.method == "GET"
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Summary of a stored entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub key: CacheKey,
    /// Body size in bytes.
    pub size: u64,
    /// Stored-at timestamp (ms since epoch).
    pub stored_at: u64,
}

/// A stored response snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Final response URL.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in order.
    pub headers: Vec<(String, String)>,

    /// Response type at the time it was stored.
    pub response_type: ResponseType,

    /// Response body.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,

    /// Stored-at timestamp (ms since epoch).
    pub stored_at: u64,

    /// Request header values named by the response's `Vary` header.
    pub vary: Vec<(String, Option<String>)>,
}

impl CachedResponse {
    /// Snapshot a response for the given request.
    pub fn capture(request: &Request, response: &Response) -> Result<Self, CacheError> {
        let mut vary = Vec::new();
        for value in response.headers.get_all(VARY) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if name == "*" {
                    return Err(CacheError::VaryWildcard(request.url.to_string()));
                }
                let name = name.to_ascii_lowercase();
                let recorded = request
                    .headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                vary.push((name, recorded));
            }
        }

        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(Self {
            url: response.url.to_string(),
            status: response.status,
            headers,
            response_type: response.response_type,
            body: response.body().to_vec(),
            stored_at: now_millis(),
            vary,
        })
    }

    /// Whether the request carries the same values for every `Vary` header.
    pub fn matches(&self, request: &Request) -> bool {
        self.vary.iter().all(|(name, recorded)| {
            let current = request
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok());
            current == recorded.as_deref()
        })
    }

    /// Body size in bytes.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }

    /// Rebuild a response.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let url = Url::parse(&self.url)
            .map_err(|e| CacheError::Corrupt(format!("stored url {}: {e}", self.url)))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(name, value);
            }
        }

        Ok(Response::new(url, self.status, Bytes::from(self.body.clone()))
            .with_headers(headers)
            .with_type(self.response_type))
    }

    /// Summary for `key`.
    pub fn info(&self, key: &CacheKey) -> EntryInfo {
        EntryInfo {
            key: key.clone(),
            size: self.size(),
            stored_at: self.stored_at,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{ACCEPT_LANGUAGE, CONTENT_TYPE};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_key_strips_fragment() {
        let a = CacheKey::new("get", &url("https://app.example/page#top"));
        let b = CacheKey::new("GET", &url("https://app.example/page"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://app.example/page");
    }

    #[test]
    fn test_key_storable() {
        let request = Request::post(url("https://app.example/api"), Bytes::new());
        assert!(!CacheKey::from_request(&request).is_storable());
    }

    #[test]
    fn test_capture_and_rebuild() {
        let request = Request::get(url("https://app.example/app.css"));
        let response = Response::new(url("https://app.example/app.css"), 200, "body{}")
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/css"));

        let cached = CachedResponse::capture(&request, &response).unwrap();
        assert_eq!(cached.size(), 6);

        let rebuilt = cached.to_response().unwrap();
        assert_eq!(rebuilt.status, 200);
        assert_eq!(rebuilt.response_type, ResponseType::Basic);
        assert_eq!(rebuilt.headers.get(CONTENT_TYPE).unwrap(), "text/css");
        assert_eq!(rebuilt.text().unwrap(), "body{}");
    }

    #[test]
    fn test_vary_matching() {
        let request = Request::get(url("https://app.example/greeting"))
            .header(ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        let response = Response::new(url("https://app.example/greeting"), 200, "hello")
            .with_header(VARY, HeaderValue::from_static("Accept-Language"));

        let cached = CachedResponse::capture(&request, &response).unwrap();
        assert!(cached.matches(&request));

        let french = Request::get(url("https://app.example/greeting"))
            .header(ACCEPT_LANGUAGE, HeaderValue::from_static("fr"));
        assert!(!cached.matches(&french));

        let bare = Request::get(url("https://app.example/greeting"));
        assert!(!cached.matches(&bare));
    }

    #[test]
    fn test_vary_wildcard_rejected() {
        let request = Request::get(url("https://app.example/x"));
        let response = Response::new(url("https://app.example/x"), 200, "")
            .with_header(VARY, HeaderValue::from_static("*"));

        assert!(matches!(
            CachedResponse::capture(&request, &response),
            Err(CacheError::VaryWildcard(_))
        ));
    }

    #[test]
    fn test_json_body_is_base64() {
        let request = Request::get(url("https://app.example/engine.wasm"));
        let response = Response::new(
            url("https://app.example/engine.wasm"),
            200,
            vec![0u8, 97, 115, 109],
        );
        let cached = CachedResponse::capture(&request, &response).unwrap();

        let json = serde_json::to_string(&cached).unwrap();
        assert!(json.contains("\"AGFzbQ==\""));

        let back: CachedResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, vec![0u8, 97, 115, 109]);
    }
}
