//! # conduit-client
//!
//! Async transport core for the conduit messaging protocol.
//!
//! ## Features
//! - Endpoint discovery from the bootstrap directory, with bounded
//!   exponential backoff and a terminal give-up error
//! - Signed / sealed RPC envelopes across four protocol variants
//!   (encrypted, legacy plain, plain v4, bot)
//! - Fixed-budget retrying POST transport — a failed exchange is always a
//!   typed error, never a silent empty result
//! - Persistent push stream: handshake, keepalive pings, supervised
//!   per-connection task group, bounded reconnect
//! - Update dispatch to registered category handlers, with isolated
//!   failures reported to an injectable diagnostics sink
//! - Chunked uploads (cancellable via the progress callback) and ranged
//!   chunked downloads against per-datacenter storage hosts
//!
//! The cryptographic capability is injected through
//! [`conduit_crypto::CryptoProvider`]; this crate never implements crypto
//! itself.

#![deny(unsafe_code)]

mod endpoints;
mod errors;
mod http;
mod retry;

pub mod dispatch;
pub mod envelope;
pub mod media;
pub mod storage_map;
pub mod stream;

pub use endpoints::EndpointSet;
pub use errors::{DownloadError, RequestError, StreamError, TransportError, UploadError};
pub use retry::{Backoff, NoRetries, RetryContext, RetryPolicy};

pub use dispatch::{
    DiagnosticsSink, FilterDecision, Handler, HandlerError, TracingSink, UpdatePackage,
};
pub use envelope::{ApiVersion, Platform, SendOptions};
pub use http::{HttpConnector, HttpResponse, ReqwestConnector};
pub use media::{
    DOWNLOAD_CHUNK_SIZE, DownloadProgress, TransferDescriptor, TransferResult, UPLOAD_CHUNK_SIZE,
    UploadProgress, UploadSource,
};
pub use storage_map::StorageMap;
pub use stream::{FrameSink, FrameSource, RefreshHook, StreamConnector, WsConnector};

/// Re-export of the crypto capability boundary.
pub use conduit_crypto as crypto;

use std::sync::Arc;
use std::time::Duration;

use conduit_crypto::CryptoProvider;
use tokio::sync::{OnceCell, RwLock};
use tokio_util::sync::CancellationToken;

use dispatch::Dispatcher;
use endpoints::EndpointResolver;
use http::RpcTransport;
use stream::StreamClient;

// ─── Config ───────────────────────────────────────────────────────────────────

/// Client configuration.
///
/// `auth`, `session_key` and `bootstrap_url` must be set for the non-bot
/// variants; everything else has a workable default. Handlers are registered
/// here — the registry is frozen when the [`Client`] is built.
pub struct Config {
    /// Raw session token.
    pub auth:               String,
    /// Symmetric session key used to seal envelopes and open push frames.
    pub session_key:        String,
    /// Private signing key; required by the encrypted variant outside
    /// temporary sessions.
    pub private_key:        Option<String>,
    /// Bot token — enables the bot variant.
    pub bot_token:          String,
    /// Base URL of the bot API, combined with the bot token per call.
    pub bot_api_base:       String,
    /// Protocol variant used when a call does not override it.
    pub api_version:        ApiVersion,
    /// Client descriptor sent in every envelope.
    pub platform:           Platform,
    /// User-agent for HTTP requests and download headers.
    pub user_agent:         String,
    /// Origin header (the referer is derived from it).
    pub origin:             Option<String>,
    /// URL of the bootstrap directory service.
    pub bootstrap_url:      String,
    /// Datacenter → storage host table, loaded from configuration.
    pub storage_map:        StorageMap,
    /// Update handlers, evaluated in registration order.
    pub handlers:           Vec<Handler>,
    /// Sink for isolated dispatch failures.
    pub diagnostics:        Arc<dyn DiagnosticsSink>,
    /// Backoff budget for endpoint resolution.
    pub resolver_retry:     Backoff,
    /// Backoff budget for stream reconnects.
    pub reconnect_retry:    Backoff,
    /// Backoff budget for re-posting a failing upload part.
    pub part_retry:         Backoff,
    /// Interval between keepalive pings on the stream.
    pub keepalive_interval: Duration,
    /// Overall timeout applied to each HTTP request.
    pub request_timeout:    Duration,
    /// Async hook invoked after each keepalive ping.
    pub refresh_hook:       Option<RefreshHook>,
    /// Override the HTTP stack (defaults to [`ReqwestConnector`]).
    pub http:               Option<Arc<dyn HttpConnector>>,
    /// Override the stream stack (defaults to [`WsConnector`]).
    pub stream:             Option<Arc<dyn StreamConnector>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth:               String::new(),
            session_key:        String::new(),
            private_key:        None,
            bot_token:          String::new(),
            bot_api_base:       String::new(),
            api_version:        ApiVersion::Encrypted,
            platform:           Platform::default(),
            user_agent:         concat!("conduit/", env!("CARGO_PKG_VERSION")).to_string(),
            origin:             None,
            bootstrap_url:      String::new(),
            storage_map:        StorageMap::new(),
            handlers:           Vec::new(),
            diagnostics:        Arc::new(TracingSink),
            resolver_retry:     Backoff::default(),
            reconnect_retry:    Backoff::default(),
            part_retry:         Backoff::new(5, Duration::from_millis(500), Duration::from_secs(10)),
            keepalive_interval: Duration::from_secs(10),
            request_timeout:    Duration::from_secs(20),
            refresh_hook:       None,
            http:               None,
            stream:             None,
        }
    }
}

impl Config {
    /// Register an update handler. Order matters: handlers are evaluated in
    /// registration order per category.
    pub fn register_handler(&mut self, handler: Handler) {
        self.handlers.push(handler);
    }
}

// ─── ClientInner ──────────────────────────────────────────────────────────────

pub(crate) struct ClientInner {
    pub(crate) auth:               String,
    pub(crate) session_key:        String,
    pub(crate) private_key:        Option<String>,
    pub(crate) bot_api_url:        Option<String>,
    pub(crate) api_version:        ApiVersion,
    pub(crate) platform:           Platform,
    pub(crate) user_agent:         String,
    pub(crate) storage_map:        StorageMap,
    pub(crate) part_retry:         Backoff,
    pub(crate) crypto:             Arc<dyn CryptoProvider>,
    pub(crate) http:               Arc<dyn HttpConnector>,
    pub(crate) transport:          RpcTransport,
    /// The envelope auth field, derived from the raw token exactly once.
    decoded_auth:                  OnceCell<String>,
    /// Identifier of the logged-in user, set by the auth flow.
    user_guid:                     std::sync::Mutex<Option<String>>,
    /// The active endpoint snapshot; replaced whole on re-resolution.
    endpoints:                     RwLock<Option<Arc<EndpointSet>>>,
    resolver:                      EndpointResolver,
    dispatcher:                    Dispatcher,
    stream_connector:              Arc<dyn StreamConnector>,
    keepalive_interval:            Duration,
    refresh_hook:                  Option<RefreshHook>,
    reconnect_retry:               Backoff,
    shutdown:                      CancellationToken,
}

// ─── Client ───────────────────────────────────────────────────────────────────

/// The transport client. Cheap to clone — internally Arc-wrapped.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client from the configuration and the crypto capability.
    ///
    /// The handler registry is frozen here; register handlers on the
    /// [`Config`] before calling this.
    pub fn new(config: Config, crypto: Arc<dyn CryptoProvider>) -> Result<Self, RequestError> {
        if config.bootstrap_url.is_empty() && config.api_version != ApiVersion::Bot {
            return Err(RequestError::InvalidInput("bootstrap_url is required".into()));
        }

        let http: Arc<dyn HttpConnector> = match config.http {
            Some(connector) => connector,
            None => Arc::new(ReqwestConnector::new(
                &config.user_agent,
                config.origin.as_deref(),
                config.request_timeout,
            )?),
        };
        let stream_connector: Arc<dyn StreamConnector> = match config.stream {
            Some(connector) => connector,
            None => Arc::new(WsConnector),
        };

        let bot_api_url = if config.bot_token.is_empty() {
            None
        } else {
            Some(format!(
                "{}/{}/",
                config.bot_api_base.trim_end_matches('/'),
                config.bot_token,
            ))
        };

        let handlers: Arc<[Handler]> = config.handlers.into();
        let dispatcher = Dispatcher::new(
            crypto.clone(),
            config.session_key.clone(),
            handlers,
            config.diagnostics,
        );
        let resolver = EndpointResolver::new(
            config.bootstrap_url,
            http.clone(),
            config.resolver_retry,
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                auth:               config.auth,
                session_key:        config.session_key,
                private_key:        config.private_key,
                bot_api_url,
                api_version:        config.api_version,
                platform:           config.platform,
                user_agent:         config.user_agent,
                storage_map:        config.storage_map,
                part_retry:         config.part_retry,
                crypto,
                transport:          RpcTransport::new(http.clone()),
                http,
                decoded_auth:       OnceCell::new(),
                user_guid:          std::sync::Mutex::new(None),
                endpoints:          RwLock::new(None),
                resolver,
                dispatcher,
                stream_connector,
                keepalive_interval: config.keepalive_interval,
                refresh_hook:       config.refresh_hook,
                reconnect_retry:    config.reconnect_retry,
                shutdown:           CancellationToken::new(),
            }),
        })
    }

    // ── Endpoints ──────────────────────────────────────────────────────────

    /// The active endpoint snapshot, resolving it on first use.
    ///
    /// Concurrent callers coalesce into a single bootstrap query: the write
    /// lock is held across resolution, so exactly one snapshot is ever
    /// active.
    pub async fn endpoints(&self) -> Result<Arc<EndpointSet>, RequestError> {
        if let Some(set) = self.inner.endpoints.read().await.clone() {
            return Ok(set);
        }
        let mut slot = self.inner.endpoints.write().await;
        if let Some(set) = slot.clone() {
            return Ok(set);
        }
        let set = Arc::new(self.inner.resolver.resolve().await?);
        *slot = Some(set.clone());
        tracing::info!(api = %set.api_url, stream = %set.stream_url, "endpoints resolved");
        Ok(set)
    }

    /// Drop the active endpoint snapshot so the next call re-resolves from
    /// scratch.
    pub async fn invalidate_endpoints(&self) {
        *self.inner.endpoints.write().await = None;
    }

    // ── Context ────────────────────────────────────────────────────────────

    /// The envelope auth field, computed from the raw token on first use and
    /// cached for the lifetime of the client.
    pub(crate) async fn decoded_auth(&self) -> Result<&str, RequestError> {
        self.inner
            .decoded_auth
            .get_or_try_init(|| async {
                self.inner
                    .crypto
                    .decode_auth(&self.inner.auth)
                    .map_err(RequestError::Crypto)
            })
            .await
            .map(String::as_str)
    }

    /// Identifier of the logged-in user, if the auth flow has set it.
    pub fn user_guid(&self) -> Option<String> {
        self.inner.user_guid.lock().ok().and_then(|g| g.clone())
    }

    /// Record the logged-in user's identifier (called by the auth flow).
    pub fn set_user_guid(&self, guid: impl Into<String>) {
        if let Ok(mut slot) = self.inner.user_guid.lock() {
            *slot = Some(guid.into());
        }
    }

    // ── Stream ─────────────────────────────────────────────────────────────

    fn stream_client(&self) -> StreamClient {
        StreamClient {
            connector:  self.inner.stream_connector.clone(),
            dispatcher: self.inner.dispatcher.clone(),
            auth:       self.inner.auth.clone(),
            keepalive:  self.inner.keepalive_interval,
            refresh:    self.inner.refresh_hook.clone(),
            reconnect:  self.inner.reconnect_retry,
        }
    }

    /// Run the push stream on the current task until [`Client::disconnect`]
    /// is called or the reconnect budget runs out.
    pub async fn run_stream(&self) -> Result<(), StreamError> {
        let endpoints = self
            .endpoints()
            .await
            .map_err(|e| StreamError::Resolve(Box::new(e)))?;
        let token = self.inner.shutdown.child_token();
        self.stream_client().run(endpoints, token).await
    }

    /// Spawn the push stream in the background and return its handle.
    pub async fn start_stream(
        &self,
    ) -> Result<tokio::task::JoinHandle<Result<(), StreamError>>, RequestError> {
        let endpoints = self.endpoints().await?;
        let client = self.stream_client();
        let token = self.inner.shutdown.child_token();
        Ok(tokio::spawn(async move { client.run(endpoints, token).await }))
    }

    /// Cancel the stream client and every task it supervises.
    pub fn disconnect(&self) {
        self.inner.shutdown.cancel();
    }
}
