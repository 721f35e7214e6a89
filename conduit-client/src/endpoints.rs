//! Endpoint discovery against the bootstrap directory service.
//!
//! Nothing else in the client can make progress without a resolved endpoint
//! set, so the resolver absorbs transient failures itself and only reports a
//! terminal error once its whole backoff budget is spent.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::time::sleep;

use crate::errors::RequestError;
use crate::http::HttpConnector;
use crate::retry::{Backoff, RetryContext, RetryPolicy};

// ─── EndpointSet ──────────────────────────────────────────────────────────────

/// The resolved service endpoints.
///
/// Exactly one set is active at a time; re-resolution replaces the whole
/// snapshot rather than merging into it. Components clone one `Arc` snapshot
/// and use it for the duration of a connection attempt.
#[derive(Debug, Clone)]
pub struct EndpointSet {
    /// Base URL for RPC calls, always with a trailing slash.
    pub api_url:     String,
    /// URL of the push stream endpoint.
    pub stream_url:  String,
    /// When this snapshot was produced.
    pub resolved_at: Instant,
}

// ─── Directory wire format ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Directory {
    data: DirectoryData,
}

#[derive(Deserialize)]
struct DirectoryData {
    #[serde(rename = "API")]
    api:            HashMap<String, String>,
    default_api:    String,
    socket:         HashMap<String, String>,
    default_socket: String,
}

// ─── EndpointResolver ─────────────────────────────────────────────────────────

pub(crate) struct EndpointResolver {
    bootstrap_url: String,
    connector:     Arc<dyn HttpConnector>,
    policy:        Backoff,
}

impl EndpointResolver {
    pub(crate) fn new(
        bootstrap_url: String,
        connector: Arc<dyn HttpConnector>,
        policy: Backoff,
    ) -> Self {
        Self { bootstrap_url, connector, policy }
    }

    /// Query the bootstrap directory until it yields a usable endpoint set.
    ///
    /// Transient network errors and non-success statuses both consume one
    /// attempt of the backoff budget; exhausting it surfaces as
    /// [`RequestError::GaveUp`].
    pub(crate) async fn resolve(&self) -> Result<EndpointSet, RequestError> {
        let mut fail_count   = NonZeroU32::new(1).unwrap();
        let mut slept_so_far = Duration::default();
        loop {
            let err = match self.attempt().await {
                Ok(set) => return Ok(set),
                Err(e)  => e,
            };
            let ctx = RetryContext { fail_count, slept_so_far };
            match self.policy.should_retry(&ctx) {
                ControlFlow::Continue(delay) => {
                    tracing::warn!(
                        attempt = fail_count.get(),
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "bootstrap query failed — retrying",
                    );
                    sleep(delay).await;
                    slept_so_far += delay;
                    fail_count = fail_count.saturating_add(1);
                }
                ControlFlow::Break(()) => {
                    return Err(RequestError::GaveUp {
                        attempts: fail_count.get(),
                        last:     Box::new(err),
                    });
                }
            }
        }
    }

    async fn attempt(&self) -> Result<EndpointSet, RequestError> {
        let resp = self
            .connector
            .get(&self.bootstrap_url)
            .await
            .map_err(RequestError::Transport)?;
        if !resp.is_success() {
            return Err(RequestError::Status(resp.status));
        }

        let dir: Directory = serde_json::from_slice(&resp.body)
            .map_err(|e| RequestError::BadResponse(e.to_string()))?;
        let data = dir.data;

        let api = data.api.get(&data.default_api).ok_or_else(|| {
            RequestError::BadResponse(format!("directory has no API entry {:?}", data.default_api))
        })?;
        let stream = data.socket.get(&data.default_socket).ok_or_else(|| {
            RequestError::BadResponse(format!(
                "directory has no socket entry {:?}",
                data.default_socket
            ))
        })?;

        Ok(EndpointSet {
            api_url:     format!("{}/", api.trim_end_matches('/')),
            stream_url:  stream.clone(),
            resolved_at: Instant::now(),
        })
    }
}
