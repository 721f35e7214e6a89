//! Request envelope construction for the four protocol variants.
//!
//! Every RPC call is wrapped in an envelope whose shape depends on the
//! protocol variant in use. The encrypted variant seals a
//! `{client, method, input}` triple under the session key and signs the
//! ciphertext; the plain variants lay their fields out directly; the bot
//! variant bypasses the envelope entirely and posts the input to a
//! token-scoped URL.

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::Client;
use crate::errors::RequestError;

// ─── ApiVersion ───────────────────────────────────────────────────────────────

/// Protocol variant selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiVersion {
    /// Version 6 — sealed and signed envelopes. The default.
    Encrypted,
    /// Version 0 — auth, client, input and method sent in the clear.
    LegacyPlain,
    /// Version 4 — client descriptor and method only.
    PlainV4,
    /// Bot API — input posted as-is to a bot-token URL.
    Bot,
}

impl ApiVersion {
    /// The wire tag carried in the envelope's `api_version` field.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Encrypted   => "6",
            Self::LegacyPlain => "0",
            Self::PlainV4     => "4",
            Self::Bot         => "bot",
        }
    }
}

// ─── Platform ─────────────────────────────────────────────────────────────────

/// Client descriptor sent in every envelope.
#[derive(Clone, Debug, Serialize)]
pub struct Platform {
    pub app_name:    String,
    pub app_version: String,
    pub platform:    String,
    pub package:     String,
    pub lang_code:   String,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            app_name:    "Conduit".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            platform:    "Web".to_string(),
            package:     "web".to_string(),
            lang_code:   "en".to_string(),
        }
    }
}

// ─── SendOptions ──────────────────────────────────────────────────────────────

/// Per-call options for [`Client::send`].
#[derive(Clone, Debug)]
pub struct SendOptions {
    /// Override the client's protocol variant for this call.
    pub version:     Option<ApiVersion>,
    /// Seal the payload (encrypted variant only). On by default.
    pub encrypt:     bool,
    /// Use the temporary-session token instead of the decoded auth field.
    /// Temporary sessions are never signed.
    pub tmp_session: bool,
    /// POST to this URL instead of the resolved API endpoint.
    pub url:         Option<String>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self { version: None, encrypt: true, tmp_session: false, url: None }
    }
}

// ─── Client::send ─────────────────────────────────────────────────────────────

impl Client {
    /// Invoke an RPC method.
    ///
    /// Builds the envelope for the active protocol variant, derives and
    /// caches the decoded auth field on first use, and posts through the
    /// retrying transport. The decoded response is returned as-is; callers
    /// check its `status` field.
    pub async fn send(
        &self,
        method: &str,
        input: Value,
        options: SendOptions,
    ) -> Result<Value, RequestError> {
        let version = options.version.unwrap_or(self.inner.api_version);

        if version == ApiVersion::Bot {
            let base = self.inner.bot_api_url.as_ref().ok_or_else(|| {
                RequestError::InvalidInput("bot variant requires a bot token".into())
            })?;
            return self.inner.transport.post_json(&format!("{base}{method}"), &input).await;
        }

        let url = match &options.url {
            Some(u) => u.clone(),
            None    => self.endpoints().await?.api_url.clone(),
        };

        let mut data = Map::new();
        data.insert("api_version".into(), json!(version.tag()));
        if options.tmp_session {
            data.insert("tmp_session".into(), json!(self.inner.auth));
        } else {
            let decoded = self.decoded_auth().await?;
            data.insert("auth".into(), json!(decoded));
        }

        match version {
            ApiVersion::Encrypted => {
                let triple = json!({
                    "client": self.inner.platform,
                    "method": method,
                    "input":  input,
                });
                let sealed = if options.encrypt {
                    self.inner.crypto.encrypt(&triple, &self.inner.session_key)?
                } else {
                    // The plaintext triple still rides in data_enc so the
                    // server sees one payload field either way.
                    serde_json::to_string(&triple)
                        .map_err(|e| RequestError::InvalidInput(e.to_string()))?
                };
                if !options.tmp_session {
                    let private_key = self.inner.private_key.as_deref().ok_or_else(|| {
                        RequestError::InvalidInput("signing requires a private key".into())
                    })?;
                    let signature = self.inner.crypto.sign(private_key, &sealed)?;
                    data.insert("sign".into(), json!(signature));
                }
                data.insert("data_enc".into(), json!(sealed));
            }
            ApiVersion::LegacyPlain => {
                // The legacy variant carries the raw token, not the decoded one.
                data.insert("auth".into(), json!(self.inner.auth));
                data.insert("client".into(), json!(self.inner.platform));
                data.insert("data".into(), input);
                data.insert("method".into(), json!(method));
            }
            ApiVersion::PlainV4 => {
                data.insert("client".into(), json!(self.inner.platform));
                data.insert("method".into(), json!(method));
            }
            ApiVersion::Bot => unreachable!("handled above"),
        }

        self.inner.transport.post_json(&url, &Value::Object(data)).await
    }
}
