//! HTTP transport abstraction for testability

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{ClientError, Result};

/// HTTP response from a request
/// Non-2xx statuses are returned here, not raised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into `ClientError::Status`
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ClientError::from_status(self.status, &self.body))
        }
    }
}

/// Abstraction over the HTTP client shared by every remote call
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait HttpClient: Send + Sync {
    /// Send a GET request to the given URL
    async fn get(&self, url: &str) -> Result<HttpResponse>;

    /// Send a POST request, with a JSON body when one is given
    async fn post_json(&self, url: &str, body: Option<String>) -> Result<HttpResponse>;

    /// Send a PATCH request with a JSON body
    async fn patch_json(&self, url: &str, body: String) -> Result<HttpResponse>;

    /// Set or clear the bearer token attached to every subsequent request
    async fn set_bearer_token(&self, token: Option<String>);
}

/// Production HTTP client using reqwest
#[derive(Debug, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    bearer: RwLock<Option<String>>,
}

impl ReqwestHttpClient {
    /// Client with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Http(format!("Building HTTP client: {}", e)))?;
        Ok(Self {
            client,
            bearer: RwLock::new(None),
        })
    }

    async fn send(&self, method: &str, request: reqwest::RequestBuilder, url: &str) -> Result<HttpResponse> {
        let request = match self.bearer.read().await.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ClientError::Http(format!("{} {} failed: {}", method, url, e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Http(format!("Reading response body: {}", e)))?;

        tracing::debug!("{} {} -> {} ({} bytes)", method, url, status, body.len());
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        tracing::debug!("GET {}", url);
        self.send("GET", self.client.get(url), url).await
    }

    async fn post_json(&self, url: &str, body: Option<String>) -> Result<HttpResponse> {
        tracing::debug!("POST {}", url);
        let request = match body {
            Some(body) => self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body),
            None => self.client.post(url),
        };
        self.send("POST", request, url).await
    }

    async fn patch_json(&self, url: &str, body: String) -> Result<HttpResponse> {
        tracing::debug!("PATCH {}", url);
        let request = self
            .client
            .patch(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        self.send("PATCH", request, url).await
    }

    async fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer.write().await = token;
    }
}
