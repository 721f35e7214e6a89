//! The persistent push stream: handshake, keepalive, receive loop and
//! supervised reconnect.
//!
//! The connection walks `Disconnected → Connecting → Handshaking → Streaming`
//! and unwinds back to `Disconnected` on any error. While streaming, the
//! keepalive task and every dispatch task run under a [`TaskTracker`] tied to
//! a per-connection [`CancellationToken`], so tearing the connection down
//! cancels all of its children deterministically — nothing is left running
//! fire-and-forget.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::dispatch::Dispatcher;
use crate::endpoints::EndpointSet;
use crate::errors::{StreamError, TransportError};
use crate::retry::{Backoff, RetryContext, RetryPolicy};

/// Async callback invoked on every keepalive tick, after the ping frame is
/// sent. Applications use it to poll state that is not pushed.
pub type RefreshHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

// ─── Connector seam ───────────────────────────────────────────────────────────

/// Outbound half of a duplex stream connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, frame: &str) -> Result<(), TransportError>;
}

/// Inbound half of a duplex stream connection.
#[async_trait]
pub trait FrameSource: Send {
    /// The next text frame, or `Ok(None)` once the peer closed the stream.
    async fn next_text(&mut self) -> Result<Option<String>, TransportError>;
}

/// Opens duplex stream connections. The default is [`WsConnector`]; tests
/// substitute an in-memory pair.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>;
}

// ─── WebSocket connector ──────────────────────────────────────────────────────

/// The default connector: a WebSocket connection, split into its two halves.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => TransportError::Timeout,
        other => TransportError::Connection(other.to_string()),
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        let (ws, _response) = connect_async(url).await.map_err(ws_err)?;
        let (sink, source) = ws.split();
        Ok((Box::new(WsSink { inner: sink }), Box::new(WsSource { inner: source })))
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, frame: &str) -> Result<(), TransportError> {
        self.inner.send(Message::Text(frame.to_string())).await.map_err(ws_err)
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_text(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(message) = self.inner.next().await {
            match message.map_err(ws_err)? {
                Message::Text(text) => return Ok(Some(text)),
                Message::Close(_)   => return Ok(None),
                // Control and binary frames are not update frames.
                _ => continue,
            }
        }
        Ok(None)
    }
}

// ─── StreamClient ─────────────────────────────────────────────────────────────

/// How one connection ended.
enum ConnOutcome {
    /// Shutdown was requested — leave the run loop.
    Shutdown,
    /// The connection failed; `streamed` tells the reconnect loop whether
    /// streaming had been (re-)established, which resets its fail counter.
    Lost { error: TransportError, streamed: bool },
}

pub(crate) struct StreamClient {
    pub(crate) connector:  Arc<dyn StreamConnector>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) auth:       String,
    pub(crate) keepalive:  Duration,
    pub(crate) refresh:    Option<RefreshHook>,
    pub(crate) reconnect:  Backoff,
}

impl StreamClient {
    /// Run against one endpoint snapshot until shutdown is requested or the
    /// reconnect budget runs out.
    pub(crate) async fn run(
        &self,
        endpoints: Arc<EndpointSet>,
        shutdown: CancellationToken,
    ) -> Result<(), StreamError> {
        let mut fail_count   = NonZeroU32::new(1).unwrap();
        let mut slept_so_far = Duration::default();
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            tracing::info!(url = %endpoints.stream_url, "stream: connecting");
            match self.run_connection(&endpoints, &shutdown).await {
                ConnOutcome::Shutdown => return Ok(()),
                ConnOutcome::Lost { error, streamed } => {
                    if streamed {
                        // The connection was good before it broke; start the
                        // reconnect budget over.
                        fail_count   = NonZeroU32::new(1).unwrap();
                        slept_so_far = Duration::default();
                    }
                    let ctx = RetryContext { fail_count, slept_so_far };
                    match self.reconnect.should_retry(&ctx) {
                        ControlFlow::Continue(delay) => {
                            tracing::warn!(
                                attempt = fail_count.get(),
                                error = %error,
                                delay_ms = delay.as_millis() as u64,
                                "stream: connection lost — reconnecting",
                            );
                            tokio::select! {
                                _ = sleep(delay) => {}
                                _ = shutdown.cancelled() => return Ok(()),
                            }
                            slept_so_far += delay;
                            fail_count = fail_count.saturating_add(1);
                        }
                        ControlFlow::Break(()) => {
                            return Err(StreamError::GaveUp { attempts: fail_count.get() });
                        }
                    }
                }
            }
        }
    }

    async fn run_connection(
        &self,
        endpoints: &EndpointSet,
        shutdown: &CancellationToken,
    ) -> ConnOutcome {
        // Connecting
        let (mut sink, mut source) = match self.connector.connect(&endpoints.stream_url).await {
            Ok(pair) => pair,
            Err(error) => return ConnOutcome::Lost { error, streamed: false },
        };

        // Handshaking
        let handshake = json!({
            "method":      "handShake",
            "auth":        self.auth,
            "api_version": "5",
            "data":        "",
        });
        if let Err(error) = sink.send_text(&handshake.to_string()).await {
            return ConnOutcome::Lost { error, streamed: false };
        }
        tracing::info!("stream: handshake sent — streaming");

        // Streaming. Children live under this tracker and die with this token.
        let conn_token = shutdown.child_token();
        let tracker    = TaskTracker::new();

        {
            // The keepalive task owns the sink from here on: an empty ping
            // frame every interval, then the application refresh hook.
            let token   = conn_token.clone();
            let refresh = self.refresh.clone();
            let every   = self.keepalive;
            tracker.spawn(async move {
                let mut tick = tokio::time::interval(every);
                tick.tick().await; // the first tick completes immediately
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {
                            if sink.send_text("{}").await.is_err() {
                                token.cancel();
                                break;
                            }
                            if let Some(hook) = &refresh {
                                hook().await;
                            }
                        }
                    }
                }
            });
        }

        let outcome = loop {
            tokio::select! {
                _ = conn_token.cancelled() => {
                    break if shutdown.is_cancelled() {
                        ConnOutcome::Shutdown
                    } else {
                        ConnOutcome::Lost {
                            error:    TransportError::Connection("keepalive send failed".into()),
                            streamed: true,
                        }
                    };
                }
                frame = source.next_text() => match frame {
                    Ok(Some(text)) => {
                        // Frames are dispatched as independent tasks: receipt
                        // order is preserved at submission, completion order
                        // is not.
                        let dispatcher = self.dispatcher.clone();
                        let children   = tracker.clone();
                        tracker.spawn(async move {
                            dispatcher.dispatch_frame(&text, &children).await;
                        });
                    }
                    Ok(None) => break ConnOutcome::Lost {
                        error:    TransportError::Connection("peer closed the stream".into()),
                        streamed: true,
                    },
                    Err(error) => break ConnOutcome::Lost { error, streamed: true },
                }
            }
        };

        // Unwind: cancel the keepalive and wait for every child to finish.
        conn_token.cancel();
        tracker.close();
        tracker.wait().await;
        outcome
    }
}
