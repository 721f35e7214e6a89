//! In-memory fakes shared by the integration tests: a scriptable HTTP
//! connector, a counting crypto provider, and a scriptable stream connector.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conduit_client::crypto::{CryptoError, CryptoProvider, Passthrough};
use conduit_client::{
    Backoff, Config, FrameSink, FrameSource, HttpConnector, HttpResponse, StreamConnector,
    TransportError,
};
use futures_util::future;
use serde_json::{Value, json};

// ─── FakeHttp ─────────────────────────────────────────────────────────────────

/// One request as the fake saw it.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method:  String,
    pub url:     String,
    pub headers: Vec<(String, String)>,
    pub body:    Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("request body is JSON")
    }
}

type HttpHandler = Box<dyn Fn(&Recorded) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// HTTP connector driven by a routing closure; records every request.
pub struct FakeHttp {
    pub log: Mutex<Vec<Recorded>>,
    handler: HttpHandler,
}

impl FakeHttp {
    pub fn new(
        handler: impl Fn(&Recorded) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { log: Mutex::new(Vec::new()), handler: Box::new(handler) })
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    /// Recorded requests whose URL starts with `prefix`.
    pub fn requests_to(&self, prefix: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.starts_with(prefix))
            .collect()
    }

    fn dispatch(&self, recorded: Recorded) -> Result<HttpResponse, TransportError> {
        let result = (self.handler)(&recorded);
        self.log.lock().unwrap().push(recorded);
        result
    }
}

#[async_trait]
impl HttpConnector for FakeHttp {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.dispatch(Recorded {
            method:  "GET".into(),
            url:     url.into(),
            headers: Vec::new(),
            body:    Vec::new(),
        })
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, TransportError> {
        self.dispatch(Recorded {
            method:  "POST".into(),
            url:     url.into(),
            headers: headers.to_vec(),
            body,
        })
    }
}

pub fn ok_json(value: &Value) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse { status: 200, body: value.to_string().into_bytes() })
}

pub fn ok_bytes(body: Vec<u8>) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse { status: 200, body })
}

pub fn status(code: u16) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse { status: code, body: Vec::new() })
}

/// A bootstrap directory answer pointing at the test endpoints.
pub fn directory_json() -> Value {
    json!({
        "data": {
            "API": { "1": API_URL.trim_end_matches('/') },
            "default_api": "1",
            "socket": { "1": STREAM_URL },
            "default_socket": "1",
        }
    })
}

pub const BOOT_URL:   &str = "http://boot.test/";
pub const API_URL:    &str = "http://api.test/";
pub const STREAM_URL: &str = "ws://stream.test";

// ─── CountingCrypto ───────────────────────────────────────────────────────────

/// Passthrough crypto that counts `decode_auth` calls and marks its outputs
/// so tests can tell the decoded field from the raw token.
#[derive(Default)]
pub struct CountingCrypto {
    pub decode_calls: AtomicUsize,
}

impl CryptoProvider for CountingCrypto {
    fn decode_auth(&self, auth: &str) -> Result<String, CryptoError> {
        self.decode_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("decoded-{auth}"))
    }

    fn encrypt(&self, payload: &Value, key: &str) -> Result<String, CryptoError> {
        Passthrough.encrypt(payload, key)
    }

    fn decrypt(&self, ciphertext: &str, key: &str) -> Result<Value, CryptoError> {
        Passthrough.decrypt(ciphertext, key)
    }

    fn sign(&self, private_key: &str, ciphertext: &str) -> Result<String, CryptoError> {
        Ok(format!("sig-{private_key}-{}", ciphertext.len()))
    }
}

// ─── Scripted stream connector ────────────────────────────────────────────────

/// What one scripted connection does.
pub enum ConnScript {
    /// The connect call itself fails.
    FailConnect,
    /// Deliver these frames, then keep the connection open until cancelled.
    Frames(Vec<String>),
    /// Deliver these frames, then report the peer closing the stream.
    FramesThenClose(Vec<String>),
}

/// Stream connector that replays one [`ConnScript`] per connect call and
/// records every outbound frame.
pub struct ScriptedStream {
    scripts:      Mutex<VecDeque<ConnScript>>,
    pub sent:     Arc<Mutex<Vec<String>>>,
    pub connects: AtomicUsize,
}

impl ScriptedStream {
    pub fn new(scripts: Vec<ConnScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts:  Mutex::new(scripts.into()),
            sent:     Arc::new(Mutex::new(Vec::new())),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamConnector for ScriptedStream {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConnScript::FailConnect);
        let (frames, close_at_end) = match script {
            ConnScript::FailConnect => {
                return Err(TransportError::Connection("scripted connect failure".into()));
            }
            ConnScript::Frames(f)          => (f, false),
            ConnScript::FramesThenClose(f) => (f, true),
        };
        Ok((
            Box::new(RecordingSink { sent: self.sent.clone() }),
            Box::new(ScriptedSource { frames: frames.into(), close_at_end }),
        ))
    }
}

struct RecordingSink {
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_text(&mut self, frame: &str) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(frame.to_string());
        Ok(())
    }
}

struct ScriptedSource {
    frames:       VecDeque<String>,
    close_at_end: bool,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_text(&mut self) -> Result<Option<String>, TransportError> {
        if let Some(frame) = self.frames.pop_front() {
            return Ok(Some(frame));
        }
        if self.close_at_end {
            return Ok(None);
        }
        future::pending::<()>().await;
        unreachable!()
    }
}

// ─── Config / helpers ─────────────────────────────────────────────────────────

/// Retry policies tuned so failing tests finish in milliseconds.
pub fn fast_backoff(budget: u32) -> Backoff {
    Backoff::new(budget, Duration::from_millis(1), Duration::from_millis(4))
}

/// A config wired to the fake HTTP connector and fast retry budgets.
pub fn test_config(http: Arc<FakeHttp>) -> Config {
    Config {
        auth:            "TOKEN".into(),
        session_key:     "KEY".into(),
        private_key:     Some("PRIV".into()),
        bootstrap_url:   BOOT_URL.into(),
        http:            Some(http),
        resolver_retry:  fast_backoff(3),
        reconnect_retry: fast_backoff(3),
        part_retry:      fast_backoff(3),
        ..Config::default()
    }
}

/// Poll until `predicate` holds, failing the test after two seconds.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within two seconds");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
