//! # Precache Net
//!
//! Request/response model and the network seam used by the offline cache agent.
//!
//! ## Design Goals
//!
//! 1. **Injected network**: the agent only sees the [`Network`] trait
//! 2. **Fetch semantics**: request modes and response types follow the
//!    browser fetch model (basic, cors, opaque, error)
//! 3. **Cheap clones**: bodies are [`Bytes`], so a response can be duplicated
//!    for the caller and for storage

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use mime::Mime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod http_network;
pub mod testing;

pub use http_network::{HttpNetwork, NetworkConfig};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Cross-origin response not allowed for {0}")]
    CrossOrigin(Url),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Request mode, as carried by an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Same-origin only; cross-origin responses are errors.
    SameOrigin,
    /// Cross-origin allowed but the response is opaque.
    NoCors,
    /// Cross-origin allowed when the server opts in.
    #[default]
    Cors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            url,
            method: Method::POST,
            headers: HeaderMap::new(),
            body: Some(body),
            mode: RequestMode::default(),
        }
    }

    /// Set the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this is a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether this is a GET request.
    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }
}

/// Response type, as classified by the fetch model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    Basic,
    /// Cross-origin response readable through CORS.
    Cors,
    /// Cross-origin response with hidden status, headers and body.
    Opaque,
    /// Network error response.
    Error,
}

/// HTTP response.
///
/// Cloning produces an independent copy sharing the same body buffer.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub redirected: bool,
    body: Bytes,
}

impl Response {
    /// Create a same-origin response.
    pub fn new(url: Url, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            redirected: false,
            body: body.into(),
        }
    }

    /// Create an opaque response: status 0, no headers, no body.
    pub fn opaque(url: Url) -> Self {
        Self {
            response_type: ResponseType::Opaque,
            ..Self::new(url, 0, Bytes::new())
        }
    }

    /// Create a network error response.
    pub fn error(url: Url) -> Self {
        Self {
            response_type: ResponseType::Error,
            ..Self::new(url, 0, Bytes::new())
        }
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace all headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Borrow the body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Take the body.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Parsed Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }
}

/// Network capability injected into the agent.
#[async_trait]
pub trait Network: Send + Sync {
    /// Issue a request. `Err` means no response was obtained at all.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

#[async_trait]
impl<N: Network + ?Sized> Network for std::sync::Arc<N> {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        (**self).fetch(request).await
    }
}
