// Copyright (c) 2025 Workflow Orchestration Team
// SPDX-License-Identifier: Apache-2.0

//! The transport abstraction the step executor calls through: "invoke a
//! downstream HTTP JSON endpoint", so tests can substitute a mock caller
//! instead of standing up a live server.

use crate::workflow::HttpMethod;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// A fully-resolved remote call: base URL + endpoint, method, body, and the
/// per-attempt timeout the caller must honor.
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub url: String,
    pub method: HttpMethod,
    pub body: Value,
    pub timeout: Duration,
}

/// Failure modes of one remote call attempt.
#[derive(Debug, Error)]
pub enum RemoteCallError {
    #[error("network error: {0}")]
    Network(String),
    #[error("non-2xx response: {status}")]
    Status { status: u16 },
    #[error("response body was not valid JSON: {0}")]
    InvalidBody(String),
    #[error("call timed out")]
    Timeout,
}

/// Abstraction over "invoke a downstream HTTP JSON endpoint". The default
/// implementation wraps `reqwest::Client`; tests substitute an in-memory
/// mock.
#[async_trait]
pub trait RemoteCaller: Send + Sync {
    async fn call(&self, request: RemoteRequest) -> Result<Value, RemoteCallError>;
}

/// Default `RemoteCaller` backed by `reqwest`.
pub struct HttpRemoteCaller {
    client: reqwest::Client,
}

impl HttpRemoteCaller {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRemoteCaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteCaller for HttpRemoteCaller {
    async fn call(&self, request: RemoteRequest) -> Result<Value, RemoteCallError> {
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url).json(&request.body),
        };

        let response = tokio::time::timeout(request.timeout, builder.send())
            .await
            .map_err(|_| RemoteCallError::Timeout)?
            .map_err(|e| RemoteCallError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteCallError::Status {
                status: status.as_u16(),
            });
        }

        tokio::time::timeout(request.timeout, response.json::<Value>())
            .await
            .map_err(|_| RemoteCallError::Timeout)?
            .map_err(|e| RemoteCallError::InvalidBody(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn http_caller_parses_a_successful_json_response() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/analyze")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;

        let caller = HttpRemoteCaller::new();
        let result = caller
            .call(RemoteRequest {
                url: format!("{}/analyze", server.url()),
                method: HttpMethod::Post,
                body: serde_json::json!({"q": 1}),
                timeout: Duration::from_secs(5),
            })
            .await
            .unwrap();

        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn http_caller_surfaces_non_2xx_as_status_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/analyze")
            .with_status(500)
            .create_async()
            .await;

        let caller = HttpRemoteCaller::new();
        let err = caller
            .call(RemoteRequest {
                url: format!("{}/analyze", server.url()),
                method: HttpMethod::Post,
                body: serde_json::json!({}),
                timeout: Duration::from_secs(5),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteCallError::Status { status: 500 }));
    }

    #[tokio::test]
    async fn http_caller_rejects_non_json_body() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/analyze")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let caller = HttpRemoteCaller::new();
        let err = caller
            .call(RemoteRequest {
                url: format!("{}/analyze", server.url()),
                method: HttpMethod::Post,
                body: serde_json::json!({}),
                timeout: Duration::from_secs(5),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteCallError::InvalidBody(_)));
    }
}
