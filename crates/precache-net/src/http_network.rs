//! Network implementation over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use http::HeaderMap;
use reqwest::Client;
use tracing::{debug, info, trace};
use url::{Origin, Url};

use crate::{NetError, Network, Request, RequestMode, Response, ResponseType};

/// Network configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// User agent string.
    pub user_agent: String,
    /// Origin of the controlled application. When unset, each request's own
    /// origin is used, so every response is same-origin.
    pub origin: Option<Url>,
    /// Per-request timeout. `None` leaves the client default.
    pub timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("precache/{}", env!("CARGO_PKG_VERSION")),
            origin: None,
            timeout: None,
            max_redirects: 10,
        }
    }
}

impl NetworkConfig {
    /// Set the application origin.
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Set a per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// HTTP-backed [`Network`].
pub struct HttpNetwork {
    client: Client,
    config: NetworkConfig,
}

impl HttpNetwork {
    /// Create a new HTTP network.
    pub fn new(config: NetworkConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = ?config.origin.as_ref().map(Url::as_str), "HttpNetwork initialized");

        Ok(Self { client, config })
    }

    fn page_origin(&self, request: &Request) -> Origin {
        self.config
            .origin
            .as_ref()
            .unwrap_or(&request.url)
            .origin()
    }

    /// Classify a response following the fetch model.
    fn classify(
        &self,
        request: &Request,
        final_url: &Url,
        headers: &HeaderMap,
    ) -> Result<ResponseType, NetError> {
        let page_origin = self.page_origin(request);

        if request.mode == RequestMode::Navigate || final_url.origin() == page_origin {
            return Ok(ResponseType::Basic);
        }

        match request.mode {
            RequestMode::Navigate => Ok(ResponseType::Basic),
            RequestMode::SameOrigin => Err(NetError::CrossOrigin(final_url.clone())),
            RequestMode::NoCors => Ok(ResponseType::Opaque),
            RequestMode::Cors => {
                let allowed = headers
                    .get(ACCESS_CONTROL_ALLOW_ORIGIN)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v == "*" || v == page_origin.ascii_serialization())
                    .unwrap_or(false);
                if allowed {
                    Ok(ResponseType::Cors)
                } else {
                    Err(NetError::CrossOrigin(final_url.clone()))
                }
            }
        }
    }

    fn map_transport_error(&self, err: reqwest::Error) -> NetError {
        if err.is_timeout() {
            NetError::Timeout(self.config.timeout.unwrap_or_default())
        } else if err.is_connect() {
            NetError::Unreachable(err.to_string())
        } else {
            NetError::HttpError(err)
        }
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, mode = ?request.mode, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let redirected = final_url != request.url;

        let response_type = self.classify(request, &final_url, &headers)?;

        if response_type == ResponseType::Opaque {
            trace!(url = %final_url, "Opaque response; discarding status, headers and body");
            return Ok(Response::opaque(final_url));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        trace!(
            url = %final_url,
            status,
            response_type = ?response_type,
            body_len = body.len(),
            redirected,
            "Response received"
        );

        let mut response = Response::new(final_url, status, body)
            .with_headers(headers)
            .with_type(response_type);
        response.redirected = redirected;
        Ok(response)
    }
}
