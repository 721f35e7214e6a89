//! Update decryption and handler dispatch.
//!
//! Each inbound stream frame carries an encrypted blob of named packages.
//! The dispatcher opens it, splits it into [`UpdatePackage`]s and walks the
//! registered handlers per category. Handler callbacks run as independent
//! supervised tasks: one slow or failing handler never blocks the next
//! package or the receive loop, and failures are reported to the
//! [`DiagnosticsSink`] instead of being silently lost.

use std::sync::Arc;

use conduit_crypto::CryptoProvider;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::task::TaskTracker;

// ─── UpdatePackage ────────────────────────────────────────────────────────────

/// One decrypted unit of push data: a category name, the raw update records
/// under it, and the user the frame was addressed to. Consumed exactly once.
#[derive(Clone, Debug)]
pub struct UpdatePackage {
    pub category:  String,
    pub records:   Vec<Value>,
    pub user_guid: Option<String>,
}

// ─── Handler ──────────────────────────────────────────────────────────────────

/// What a handler's filter decided about a package.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterDecision {
    /// Run this handler's callback and keep evaluating later handlers.
    Accept,
    /// Not interested — stop evaluating this category's handler chain.
    Reject,
    /// The distinguished stop signal: halt this category's chain, leaving
    /// other categories in the same frame untouched.
    Stop,
}

/// Error type handler callbacks may fail with. Failures are isolated and
/// reported to the [`DiagnosticsSink`]; they never reach the stream loop.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Filter   = Arc<dyn Fn(&UpdatePackage) -> FilterDecision + Send + Sync>;
type Callback = Arc<dyn Fn(UpdatePackage) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// A registered (category, filter, callback) triple.
///
/// Handlers are registered on [`crate::Config`] before the client is built;
/// the registry is frozen from then on.
#[derive(Clone)]
pub struct Handler {
    category: String,
    filter:   Filter,
    callback: Callback,
}

impl Handler {
    pub fn new<F, C, Fut>(category: impl Into<String>, filter: F, callback: C) -> Self
    where
        F:   Fn(&UpdatePackage) -> FilterDecision + Send + Sync + 'static,
        C:   Fn(UpdatePackage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            category: category.into(),
            filter:   Arc::new(filter),
            callback: Arc::new(move |pkg| Box::pin(callback(pkg))),
        }
    }

    /// A handler that accepts every package of its category.
    pub fn for_category<C, Fut>(category: impl Into<String>, callback: C) -> Self
    where
        C:   Fn(UpdatePackage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::new(category, |_| FilterDecision::Accept, callback)
    }

    pub fn category(&self) -> &str {
        &self.category
    }
}

// ─── DiagnosticsSink ──────────────────────────────────────────────────────────

/// Where isolated dispatch failures are reported.
pub trait DiagnosticsSink: Send + Sync {
    /// A handler callback returned an error. The dispatch of other handlers
    /// and categories was not affected.
    fn handler_failed(&self, category: &str, error: &HandlerError);

    /// An inbound frame could not be decoded into packages.
    fn frame_rejected(&self, reason: &str);
}

/// The default sink — reports through `tracing` at warn level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn handler_failed(&self, category: &str, error: &HandlerError) {
        tracing::warn!(category, error = %error, "update handler failed");
    }

    fn frame_rejected(&self, reason: &str) {
        tracing::warn!(reason, "inbound frame rejected");
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) struct Dispatcher {
    crypto:      Arc<dyn CryptoProvider>,
    session_key: String,
    handlers:    Arc<[Handler]>,
    sink:        Arc<dyn DiagnosticsSink>,
}

impl Dispatcher {
    pub(crate) fn new(
        crypto: Arc<dyn CryptoProvider>,
        session_key: String,
        handlers: Arc<[Handler]>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Self { crypto, session_key, handlers, sink }
    }

    /// Decrypt one raw stream frame and fan its packages out to the handler
    /// chains. Each category runs as its own task under `tracker`.
    pub(crate) async fn dispatch_frame(&self, raw: &str, tracker: &TaskTracker) {
        let frame: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                self.sink.frame_rejected(&format!("frame is not JSON: {e}"));
                return;
            }
        };
        // Frames without a payload (acks, status notices) are not updates.
        let Some(cipher) = frame.get("data_enc").and_then(Value::as_str) else {
            return;
        };

        let decrypted = match self.crypto.decrypt(cipher, &self.session_key) {
            Ok(v) => v,
            Err(e) => {
                self.sink.frame_rejected(&format!("data_enc did not decrypt: {e}"));
                return;
            }
        };
        let Value::Object(mut map) = decrypted else {
            self.sink.frame_rejected("decrypted payload is not an object");
            return;
        };

        let user_guid = match map.remove("user_guid") {
            Some(Value::String(guid)) => Some(guid),
            _ => None,
        };

        for (category, value) in map {
            let Value::Array(records) = value else {
                continue;
            };
            let package = UpdatePackage {
                category,
                records,
                user_guid: user_guid.clone(),
            };
            let this = self.clone();
            let children = tracker.clone();
            tracker.spawn(async move { this.run_category(package, &children) });
        }
    }

    /// Walk the handler chain for one package, in registration order.
    fn run_category(&self, package: UpdatePackage, tracker: &TaskTracker) {
        for handler in self.handlers.iter() {
            if !category_matches(&handler.category, &package.category) {
                continue;
            }
            match (handler.filter)(&package) {
                FilterDecision::Reject | FilterDecision::Stop => break,
                FilterDecision::Accept => {
                    let callback = handler.callback.clone();
                    let sink     = self.sink.clone();
                    let package  = package.clone();
                    let category = package.category.clone();
                    tracker.spawn(async move {
                        if let Err(e) = callback(package).await {
                            sink.handler_failed(&category, &e);
                        }
                    });
                }
            }
        }
    }
}

/// Case- and underscore-insensitive category comparison, so a package named
/// `"chat_updates"` reaches a handler registered for `"ChatUpdates"`.
fn category_matches(registered: &str, incoming: &str) -> bool {
    normalize_category(registered) == normalize_category(incoming)
}

fn normalize_category(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
