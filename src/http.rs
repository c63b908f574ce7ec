//! Request executor: one HTTP call, timed from send to full body (or failure).
//!
//! The executor never writes metrics itself. [`Vu::request`](crate::Vu::request)
//! records the built-in HTTP metrics and scripts add their own trends on top.

use std::{borrow::Cow, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::error::Result;

pub use reqwest::Method;

/// An HTTP request against the target.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets a JSON body along with its content type.
    pub fn json(self, body: impl Into<Bytes>) -> Self {
        self.header("Content-Type", "application/json").body(body)
    }
}

/// What came back: a status code, or the reason no response arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Status(u16),
    Transport(String),
}

/// Outcome of one request plus its wall-clock duration.
#[derive(Debug, Clone)]
pub struct Response {
    pub outcome: Outcome,
    pub body: Bytes,
    pub elapsed: Duration,
}

impl Response {
    pub fn status(&self) -> Option<u16> {
        match self.outcome {
            Outcome::Status(status) => Some(status),
            Outcome::Transport(_) => None,
        }
    }

    /// Transport errors and statuses outside `200..400` count as failed requests.
    pub fn failed(&self) -> bool {
        !matches!(self.status(), Some(200..=399))
    }

    pub fn duration_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1_000.0
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Sends requests to the system under test.
///
/// Implementations must not fail: transport problems are part of the returned
/// [`Outcome`] so the caller can record them.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Response;
}

/// [`Transport`] backed by a shared `reqwest` client.
///
/// NEVER build one of these per iteration; the client holds the connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("volley/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Response {
        let Request {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.client.request(method, &url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let start = Instant::now();
        let result = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        }
        .await;
        let elapsed = start.elapsed();

        match result {
            Ok((status, body)) => Response {
                outcome: Outcome::Status(status),
                body,
                elapsed,
            },
            Err(e) => {
                tracing::debug!("Request to {url} failed: {e}");
                Response {
                    outcome: Outcome::Transport(e.to_string()),
                    body: Bytes::new(),
                    elapsed,
                }
            }
        }
    }
}
