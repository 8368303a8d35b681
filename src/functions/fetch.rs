//! Outbound HTTP for functions

use crate::error::FuncError;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Longest response body echoed back in error messages
const MAX_ERROR_BODY: usize = 512;

/// HTTP client handed to functions. Every request is bounded by the fetch
/// timeout; non-2xx responses become transport errors.
#[derive(Debug, Clone)]
pub struct FetchClient {
    client: Client,
    timeout: Duration,
}

impl FetchClient {
    /// Client with the given per-request timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    /// Reuse an existing client
    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Same client with another timeout
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            client: self.client.clone(),
            timeout,
        }
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `body` as JSON and return the response text
    pub async fn send_json(
        &self,
        method: Method,
        url: &str,
        headers: &HashMap<String, String>,
        body: &Value,
    ) -> Result<String, FuncError> {
        let mut request = self
            .client
            .request(method.clone(), url)
            .timeout(self.timeout)
            .json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FuncError::transport(format!(
                    "{} {} timed out after {:?}",
                    method, url, self.timeout
                ))
            } else {
                FuncError::transport(format!("{} {} failed: {}", method, url, e))
            }
        })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        debug!(%url, status = status.as_u16(), "Fetch completed");
        if !status.is_success() {
            let snippet: String = text.chars().take(MAX_ERROR_BODY).collect();
            return Err(FuncError::transport(format!(
                "{} {} returned {}: {}",
                method, url, status, snippet
            )));
        }
        Ok(text)
    }
}

/// Response of [`FetchClient::fetch`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as text
    pub body: String,
}

impl FetchClient {
    /// Send a request on behalf of a user-defined function. Unlike
    /// [`send_json`](Self::send_json) any status is returned to the caller;
    /// only connection failures and timeouts are errors.
    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<String>,
    ) -> Result<FetchResponse, FuncError> {
        let mut request = self.client.request(method.clone(), url).timeout(self.timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FuncError::transport(format!(
                    "{} {} timed out after {:?}",
                    method, url, self.timeout
                ))
            } else {
                FuncError::transport(format!("{} {} failed: {}", method, url, e))
            }
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| FuncError::transport(format!("{} {} body: {}", method, url, e)))?;
        debug!(%url, status, "Function fetch completed");
        Ok(FetchResponse { status, body })
    }
}

impl Default for FetchClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}
