//! Scripted in-memory network for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{NetError, Network, Request, Response};

#[derive(Debug, Clone)]
enum Route {
    Respond(Response),
    Fail(String),
}

/// A [`Network`] that answers from a fixed routing table.
///
/// Unrouted URLs answer 404. Every call is recorded, including calls made
/// while offline.
#[derive(Debug, Default)]
pub struct ScriptedNetwork {
    routes: Mutex<HashMap<String, Route>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl ScriptedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with `response`.
    pub fn respond(&self, url: &str, response: Response) -> &Self {
        self.lock_routes()
            .insert(url.to_string(), Route::Respond(response));
        self
    }

    /// Answer `url` with a 200 same-origin response carrying `body`.
    pub fn respond_ok(&self, url: &str, body: &'static str) -> &Self {
        match url::Url::parse(url) {
            Ok(parsed) => self.respond(url, Response::new(parsed, 200, body)),
            Err(_) => self.fail(url, "invalid url"),
        }
    }

    /// Fail `url` at the transport level.
    pub fn fail(&self, url: &str, reason: &str) -> &Self {
        self.lock_routes()
            .insert(url.to_string(), Route::Fail(reason.to_string()));
        self
    }

    /// Toggle total network loss.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetches issued.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// URLs fetched, in call order.
    pub fn requested_urls(&self) -> Vec<String> {
        self.requested
            .lock()
            .map(|urls| urls.clone())
            .unwrap_or_default()
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut urls) = self.requested.lock() {
            urls.push(request.url.to_string());
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Unreachable(request.url.to_string()));
        }

        let route = self.lock_routes().get(request.url.as_str()).cloned();
        match route {
            Some(Route::Respond(response)) => Ok(response),
            Some(Route::Fail(reason)) => Err(NetError::RequestFailed(reason)),
            None => Ok(Response::new(request.url.clone(), 404, "")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[tokio::test]
    async fn test_scripted_routes() {
        let network = ScriptedNetwork::new();
        network
            .respond_ok("https://app.example/", "shell")
            .fail("https://app.example/broken", "reset");

        let ok = network
            .fetch(&Request::get(Url::parse("https://app.example/").unwrap()))
            .await
            .unwrap();
        assert_eq!(ok.status, 200);

        let broken = network
            .fetch(&Request::get(Url::parse("https://app.example/broken").unwrap()))
            .await;
        assert!(broken.is_err());

        let missing = network
            .fetch(&Request::get(Url::parse("https://app.example/nope").unwrap()))
            .await
            .unwrap();
        assert_eq!(missing.status, 404);

        assert_eq!(network.calls(), 3);
    }

    #[tokio::test]
    async fn test_offline() {
        let network = ScriptedNetwork::new();
        network.respond_ok("https://app.example/", "shell");
        network.set_offline(true);

        let result = network
            .fetch(&Request::get(Url::parse("https://app.example/").unwrap()))
            .await;
        assert!(matches!(result, Err(NetError::Unreachable(_))));
        assert_eq!(network.requested_urls(), vec!["https://app.example/"]);
    }
}
