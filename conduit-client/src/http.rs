//! HTTP connector seam and the retrying RPC POST wrapper.
//!
//! All HTTP traffic goes through the [`HttpConnector`] trait so that the
//! transport logic can be driven by an in-memory fake in tests; the default
//! implementation is [`ReqwestConnector`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{RequestError, TransportError};

/// Number of attempts the RPC POST wrapper makes before giving up.
const POST_ATTEMPTS: u32 = 3;

// ─── HttpResponse ─────────────────────────────────────────────────────────────

/// One HTTP exchange's outcome, as seen by the retry layer.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body:   Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ─── HttpConnector ────────────────────────────────────────────────────────────

/// Abstraction over the HTTP stack.
///
/// A transport error means the exchange never produced a response; a returned
/// [`HttpResponse`] may still carry a non-success status, which the caller
/// interprets.
#[async_trait]
pub trait HttpConnector: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;

    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, TransportError>;
}

// ─── ReqwestConnector ─────────────────────────────────────────────────────────

/// The default connector, backed by a shared `reqwest` client with the
/// configured user-agent, origin headers and overall request timeout.
pub struct ReqwestConnector {
    client: reqwest::Client,
}

impl ReqwestConnector {
    pub fn new(
        user_agent: &str,
        origin: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        use reqwest::header::{self, HeaderMap, HeaderValue};

        let bad = |e: &dyn std::fmt::Display| TransportError::Connection(e.to_string());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(user_agent).map_err(|e| bad(&e))?,
        );
        if let Some(origin) = origin {
            headers.insert(header::ORIGIN, HeaderValue::from_str(origin).map_err(|e| bad(&e))?);
            let referer = format!("{}/", origin.trim_end_matches('/'));
            headers.insert(header::REFERER, HeaderValue::from_str(&referer).map_err(|e| bad(&e))?);
        }
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| bad(&e))?;
        Ok(Self { client })
    }

    fn map_err(e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Connection(e.to_string())
        }
    }

    async fn read(resp: reqwest::Response) -> Result<HttpResponse, TransportError> {
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(Self::map_err)?;
        Ok(HttpResponse { status, body: body.to_vec() })
    }
}

#[async_trait]
impl HttpConnector for ReqwestConnector {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let resp = self.client.get(url).send().await.map_err(Self::map_err)?;
        Self::read(resp).await
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, TransportError> {
        use reqwest::header::{HeaderName, HeaderValue};

        let mut req = self.client.post(url).body(body);
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            req = req.header(name, value);
        }
        let resp = req.send().await.map_err(Self::map_err)?;
        Self::read(resp).await
    }
}

// ─── RpcTransport ─────────────────────────────────────────────────────────────

/// The retrying POST wrapper every RPC call goes through.
///
/// Fixed at [`POST_ATTEMPTS`] attempts with no sleep in between: the first
/// success short-circuits, transport failures and non-success statuses each
/// consume one attempt, and exhaustion surfaces as
/// [`RequestError::GaveUp`] carrying the final attempt's error.
pub(crate) struct RpcTransport {
    connector: std::sync::Arc<dyn HttpConnector>,
}

impl RpcTransport {
    pub(crate) fn new(connector: std::sync::Arc<dyn HttpConnector>) -> Self {
        Self { connector }
    }

    pub(crate) async fn post_json(&self, url: &str, payload: &Value) -> Result<Value, RequestError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| RequestError::InvalidInput(e.to_string()))?;

        let mut attempt = 0u32;
        let last = loop {
            attempt += 1;
            let err = match self.connector.post(url, &[], body.clone()).await {
                Ok(resp) if resp.is_success() => {
                    return serde_json::from_slice(&resp.body)
                        .map_err(|e| RequestError::BadResponse(e.to_string()));
                }
                Ok(resp) => {
                    tracing::warn!(url, status = resp.status, attempt, "rpc answered non-success");
                    RequestError::Status(resp.status)
                }
                Err(e) => {
                    tracing::warn!(url, attempt, error = %e, "rpc POST failed");
                    RequestError::Transport(e)
                }
            };
            if attempt >= POST_ATTEMPTS {
                break err;
            }
        };
        Err(RequestError::GaveUp { attempts: attempt, last: Box::new(last) })
    }
}
