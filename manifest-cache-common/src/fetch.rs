use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

const RETRY_BASE_MILLIS: u64 = 50;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
    #[error("request to {url} failed: {error}")]
    Request { url: String, error: reqwest::Error },
    #[error("endpoint {url} returned status {status}")]
    Status { url: String, status: u16 },
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Client(_) => false,
            FetchError::Request { .. } => true,
            FetchError::Status { status, .. } => {
                StatusCode::from_u16(*status).is_ok_and(|status| {
                    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
                })
            }
        }
    }
}

/// Retrieves the raw bytes behind a URL.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// Plain HTTP GET with a request timeout and a bounded number of retries
/// with exponential backoff.
pub struct HttpFetcher {
    client: reqwest::Client,
    retries: usize,
    max_retry_delay: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, retries: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent("manifest-cache-worker")
            .timeout(timeout)
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            retries,
            max_retry_delay: Duration::from_secs(2),
        })
    }

    pub fn with_max_retry_delay(mut self, max_retry_delay: Duration) -> Self {
        self.max_retry_delay = max_retry_delay;
        self
    }

    async fn fetch_once(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| FetchError::Request {
                url: url.to_owned(),
                error,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }

        response.bytes().await.map_err(|error| FetchError::Request {
            url: url.to_owned(),
            error,
        })
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let strategy = ExponentialBackoff::from_millis(RETRY_BASE_MILLIS)
            .max_delay(self.max_retry_delay)
            .map(jitter)
            .take(self.retries);

        RetryIf::spawn(
            strategy,
            || self.fetch_once(url),
            |e: &FetchError| {
                let retryable = e.is_retryable();
                if retryable {
                    warn!("fetching {url} failed: {e}");
                }
                retryable
            },
        )
        .await
    }
}

/// Canned responses keyed by URL. Unknown URLs answer 404.
#[derive(Clone, Default)]
pub struct MockFetcher {
    responses: HashMap<String, Result<Bytes, u16>>,
    requested: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, url: &str, body: &[u8]) -> Self {
        self.responses
            .insert(url.to_owned(), Ok(Bytes::copy_from_slice(body)));
        self
    }

    pub fn with_status(mut self, url: &str, status: u16) -> Self {
        self.responses.insert(url.to_owned(), Err(status));
        self
    }

    /// Every URL fetched so far, in order.
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        self.requested.lock().unwrap().push(url.to_owned());
        match self.responses.get(url) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(status)) => Err(FetchError::Status {
                url: url.to_owned(),
                status: *status,
            }),
            None => Err(FetchError::Status {
                url: url.to_owned(),
                status: 404,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;

    use super::*;

    fn fetcher(retries: usize) -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(5), retries)
            .unwrap()
            .with_max_retry_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/manifest/1");
            then.status(200).body("{\"label\": \"a manifest\"}");
        });

        let body = fetcher(2)
            .fetch(&server.url("/manifest/1"))
            .await
            .expect("fetch failed");

        assert_eq!(&body[..], b"{\"label\": \"a manifest\"}");
        assert_eq!(mock.hits(), 1);
    }

    #[tokio::test]
    async fn test_fetch_does_not_retry_client_errors() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET);
            then.status(404);
        });

        let result = fetcher(2).fetch(&server.url("/missing")).await;

        assert!(matches!(result, Err(FetchError::Status { status: 404, .. })));
        assert_eq!(mock.hits(), 1);
    }

    #[tokio::test]
    async fn test_fetch_retries_server_errors() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET);
            then.status(503);
        });

        let result = fetcher(2).fetch(&server.url("/flaky")).await;

        assert!(matches!(result, Err(FetchError::Status { status: 503, .. })));
        assert_eq!(mock.hits(), 3);
    }

    #[tokio::test]
    async fn test_fetch_without_retries_tries_once() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET);
            then.status(429);
        });

        let result = fetcher(0).fetch(&server.url("/busy")).await;

        assert!(matches!(result, Err(FetchError::Status { status: 429, .. })));
        assert_eq!(mock.hits(), 1);
    }

    #[tokio::test]
    async fn test_mock_fetcher_records_requests() {
        let fetcher = MockFetcher::new()
            .with_body("https://host/a", b"a")
            .with_status("https://host/b", 500);

        assert_eq!(&fetcher.fetch("https://host/a").await.unwrap()[..], b"a");
        assert!(fetcher.fetch("https://host/b").await.is_err());
        assert!(matches!(
            fetcher.fetch("https://host/c").await,
            Err(FetchError::Status { status: 404, .. })
        ));
        assert_eq!(
            fetcher.requested(),
            vec!["https://host/a", "https://host/b", "https://host/c"]
        );
    }
}
