//! Remote data source boundary.
//!
//! The cache and sync layers only see a request/response interface returning
//! a JSON payload or a typed [`ApiError`]. `HttpRemote` is the production
//! implementation; tests substitute their own [`RemoteSource`].

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Typed failure from the remote API.
///
/// Classification drives retry behavior: timeouts, transport failures, and
/// 5xx are transient; 401 invalidates the auth category and propagates; 403
/// and other 4xx are surfaced as-is without retry. Whether a 404 on a
/// "current state" read means "error" or "valid empty result" is a
/// per-category interpretation left to the caller.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("transport error: {0}")]
  Transport(String),

  #[error("authentication required (401)")]
  Unauthorized { body: Option<String> },

  #[error("permission denied (403)")]
  Forbidden { body: Option<String> },

  #[error("not found (404)")]
  NotFound { body: Option<String> },

  #[error("client error ({status})")]
  Client { status: u16, body: Option<String> },

  #[error("server error ({status})")]
  Server { status: u16, body: Option<String> },

  /// Emitted by the cache when the effective policy forbids network
  /// attempts and no cached value exists to serve.
  #[error("offline: network attempts disabled and no cached value")]
  Offline,
}

impl ApiError {
  /// Map an HTTP-like status code into the taxonomy.
  pub fn from_status(status: u16, body: Option<String>) -> Self {
    match status {
      401 => Self::Unauthorized { body },
      403 => Self::Forbidden { body },
      404 => Self::NotFound { body },
      400..=499 => Self::Client { status, body },
      _ => Self::Server { status, body },
    }
  }

  /// Transient failures worth retrying against the category's retry bound.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Timeout(_) | Self::Transport(_) | Self::Server { .. })
  }

  /// Authentication-invalidation signal (401).
  pub fn is_auth(&self) -> bool {
    matches!(self, Self::Unauthorized { .. })
  }
}

/// HTTP method for an [`ApiRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

/// A request to the remote API: resource path plus parameters.
#[derive(Debug, Clone)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub params: Vec<(String, String)>,
  pub body: Option<Value>,
}

impl ApiRequest {
  pub fn get(path: impl Into<String>) -> Self {
    Self { method: Method::Get, path: path.into(), params: Vec::new(), body: None }
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self { method: Method::Post, path: path.into(), params: Vec::new(), body: Some(body) }
  }

  pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.params.push((name.into(), value.into()));
    self
  }
}

/// Request/response interface to the remote source of truth.
#[async_trait]
pub trait RemoteSource: Send + Sync {
  async fn request(&self, req: ApiRequest) -> Result<Value, ApiError>;
}

/// reqwest-backed [`RemoteSource`].
///
/// Every call carries a fixed timeout independent of the retry/backoff
/// policy; a timeout is a retryable failure like any other.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
  timeout: Duration,
}

impl HttpRemote {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base url {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client, base_url, timeout })
  }

  fn url_for(&self, req: &ApiRequest) -> Result<Url, ApiError> {
    let mut url = self
      .base_url
      .join(req.path.trim_start_matches('/'))
      .map_err(|e| ApiError::Transport(format!("invalid path {}: {}", req.path, e)))?;

    if !req.params.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for (name, value) in &req.params {
        pairs.append_pair(name, value);
      }
    }
    Ok(url)
  }
}

#[async_trait]
impl RemoteSource for HttpRemote {
  async fn request(&self, req: ApiRequest) -> Result<Value, ApiError> {
    let url = self.url_for(&req)?;

    let mut builder = match req.method {
      Method::Get => self.client.get(url),
      Method::Post => self.client.post(url),
      Method::Put => self.client.put(url),
      Method::Delete => self.client.delete(url),
    };
    if let Some(body) = &req.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        ApiError::Timeout(self.timeout)
      } else {
        ApiError::Transport(e.to_string())
      }
    })?;

    let status = response.status().as_u16();
    if !response.status().is_success() {
      let body = response.text().await.ok().filter(|b| !b.is_empty());
      return Err(ApiError::from_status(status, body));
    }

    response
      .json::<Value>()
      .await
      .map_err(|e| ApiError::Transport(format!("invalid response body: {}", e)))
  }
}
