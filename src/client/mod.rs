//! Client construction and lifecycle.
//!
//! A [`Client`] bundles the transport, auth, and the span export pipeline.
//! Build one explicitly with [`Client::builder`], or use the module-level
//! convenience functions backed by a lazily-initialized default client
//! configured from environment variables.
//!
//! Creating two clients with identical configuration returns the same
//! instance (the full option set is fingerprinted). Closing a client is
//! idempotent; afterwards every public call is a safe no-op or returns
//! [`LoopError::ClientClosed`].
//!
//! # Quick Start
//!
//! ```no_run
//! use looptrace::{Client, Context, StartSpanOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .workspace_id("my-workspace")
//!         .api_token("pat-...")
//!         .build()?;
//!
//!     let (_ctx, span) = client.start_span(
//!         &Context::new(),
//!         "root",
//!         "custom",
//!         StartSpanOptions::default(),
//!     );
//!     span.set_input("what's the weather like?");
//!     span.finish();
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::{Lazy, OnceCell};
use tracing::{info, warn};

use crate::error::{LoopError, Result};
use crate::trace::provider::{Provider, ProviderOptions};
use crate::trace::span::SpanContext;
use crate::trace::{Context, Span, StartSpanOptions};
use crate::transport::{
    Auth, HttpTransport, JwtAuth, TokenAuth, Transport, TransportOptions, DEFAULT_TIMEOUT,
    DEFAULT_UPLOAD_TIMEOUT,
};

// Environment keys read at client construction; explicit builder options
// take precedence.
pub const ENV_API_BASE_URL: &str = "LOOP_API_BASE_URL";
pub const ENV_WORKSPACE_ID: &str = "LOOP_WORKSPACE_ID";
pub const ENV_API_TOKEN: &str = "LOOP_API_TOKEN";
pub const ENV_JWT_OAUTH_CLIENT_ID: &str = "LOOP_JWT_OAUTH_CLIENT_ID";
pub const ENV_JWT_OAUTH_PRIVATE_KEY: &str = "LOOP_JWT_OAUTH_PRIVATE_KEY";
pub const ENV_JWT_OAUTH_PUBLIC_KEY_ID: &str = "LOOP_JWT_OAUTH_PUBLIC_KEY_ID";

/// Default ingest endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://api.looptrace.io";

/// Drain window granted to the signal-triggered shutdown.
const SIGNAL_DRAIN_WINDOW: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct ClientOptions {
    api_base_url: String,
    workspace_id: String,
    api_token: String,
    jwt_oauth_client_id: String,
    jwt_oauth_private_key: String,
    jwt_oauth_public_key_id: String,
    timeout: Duration,
    upload_timeout: Duration,
    ultra_large_report: bool,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientOptions {
    fn from_env() -> Self {
        let env = |key: &str| std::env::var(key).unwrap_or_default();
        let base_url = env(ENV_API_BASE_URL);
        Self {
            api_base_url: if base_url.is_empty() {
                DEFAULT_API_BASE_URL.to_string()
            } else {
                base_url
            },
            workspace_id: env(ENV_WORKSPACE_ID),
            api_token: env(ENV_API_TOKEN),
            jwt_oauth_client_id: env(ENV_JWT_OAUTH_CLIENT_ID),
            jwt_oauth_private_key: env(ENV_JWT_OAUTH_PRIVATE_KEY),
            jwt_oauth_public_key_id: env(ENV_JWT_OAUTH_PUBLIC_KEY_ID),
            timeout: DEFAULT_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            ultra_large_report: false,
            transport: None,
        }
    }

    /// Fingerprint over every option; identical configurations share one
    /// client instance.
    fn fingerprint(&self) -> String {
        let transport_ptr = self
            .transport
            .as_ref()
            .map(|t| format!("{:p}", Arc::as_ptr(t)))
            .unwrap_or_default();
        let joined = [
            self.api_base_url.as_str(),
            self.workspace_id.as_str(),
            self.api_token.as_str(),
            self.jwt_oauth_client_id.as_str(),
            self.jwt_oauth_private_key.as_str(),
            self.jwt_oauth_public_key_id.as_str(),
            &format!("{:?}", self.timeout),
            &format!("{:?}", self.upload_timeout),
            &format!("{}", self.ultra_large_report),
            &transport_ptr,
        ]
        .join("\t");
        format!("{:x}", md5::compute(joined.as_bytes()))
    }
}

/// Builder for [`Client`]. Starts from environment-variable defaults.
pub struct ClientBuilder {
    options: ClientOptions,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            options: ClientOptions::from_env(),
        }
    }

    /// Override the API base URL.
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.options.api_base_url = url.into();
        self
    }

    /// Set the workspace all spans report into. Required.
    pub fn workspace_id(mut self, workspace_id: impl Into<String>) -> Self {
        self.options.workspace_id = workspace_id.into();
        self
    }

    /// Authenticate with a personal access token. Intended for testing;
    /// prefer JWT OAuth in production.
    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.options.api_token = token.into();
        self
    }

    /// Authenticate with a JWT OAuth application (client id, RSA private
    /// key PEM, public key id).
    pub fn jwt_oauth(
        mut self,
        client_id: impl Into<String>,
        private_key_pem: impl Into<String>,
        public_key_id: impl Into<String>,
    ) -> Self {
        self.options.jwt_oauth_client_id = client_id.into();
        self.options.jwt_oauth_private_key = private_key_pem.into();
        self.options.jwt_oauth_public_key_id = public_key_id.into();
        self
    }

    /// Timeout for JSON calls to the ingest service.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Timeout for attachment uploads.
    pub fn upload_timeout(mut self, timeout: Duration) -> Self {
        self.options.upload_timeout = timeout;
        self
    }

    /// Report oversized input/output as separate attachments instead of
    /// truncating them on the wire.
    pub fn ultra_large_report(mut self, enable: bool) -> Self {
        self.options.ultra_large_report = enable;
        self
    }

    /// Replace the HTTP transport. Useful for tests and custom stacks.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.options.transport = Some(transport);
        self
    }

    /// Build the client, or return the cached one for an identical
    /// configuration. Must be called within a tokio runtime: the pipeline
    /// spawns its queue workers on it.
    pub fn build(self) -> Result<Client> {
        let mut options = self.options;
        options.api_base_url = options.api_base_url.trim().trim_end_matches('/').to_string();
        if options.api_base_url.is_empty() {
            return Err(LoopError::invalid_param("api_base_url is required"));
        }
        if options.workspace_id.is_empty() {
            return Err(LoopError::invalid_param("workspace_id is required"));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(LoopError::invalid_param(
                "client must be built inside a tokio runtime",
            ));
        }

        let fingerprint = options.fingerprint();
        {
            let cache = client_cache().lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(&fingerprint) {
                warn!("a client with identical configuration already exists, returning it");
                return Ok(cached.clone());
            }
        }

        let transport: Arc<dyn Transport> = match options.transport.clone() {
            Some(transport) => transport,
            None => {
                let auth = build_auth(&options)?;
                Arc::new(HttpTransport::new(
                    options.api_base_url.clone(),
                    auth,
                    TransportOptions {
                        timeout: options.timeout,
                        upload_timeout: options.upload_timeout,
                    },
                )?)
            }
        };

        let provider = Provider::new(
            transport,
            ProviderOptions {
                workspace_id: options.workspace_id.clone(),
                ultra_large_report: options.ultra_large_report,
            },
        );

        let client = Client {
            core: Arc::new(ClientCore::Active(ActiveClient {
                workspace_id: options.workspace_id.clone(),
                provider,
                closed: AtomicBool::new(false),
            })),
        };

        client_cache()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fingerprint, client.clone());
        Ok(client)
    }
}

fn build_auth(options: &ClientOptions) -> Result<Arc<dyn Auth>> {
    if !options.jwt_oauth_client_id.is_empty()
        && !options.jwt_oauth_private_key.is_empty()
        && !options.jwt_oauth_public_key_id.is_empty()
    {
        let auth = JwtAuth::new(
            options.jwt_oauth_client_id.clone(),
            &options.jwt_oauth_private_key,
            options.jwt_oauth_public_key_id.clone(),
            options.api_base_url.clone(),
        )?;
        return Ok(Arc::new(auth));
    }
    if !options.api_token.is_empty() {
        return Ok(Arc::new(TokenAuth::new(options.api_token.clone())));
    }
    Err(LoopError::AuthInfoRequired)
}

fn client_cache() -> &'static Mutex<HashMap<String, Client>> {
    static CACHE: Lazy<Mutex<HashMap<String, Client>>> = Lazy::new(|| Mutex::new(HashMap::new()));
    &CACHE
}

enum ClientCore {
    Active(ActiveClient),
    Noop { error: LoopError },
}

struct ActiveClient {
    workspace_id: String,
    provider: Provider,
    closed: AtomicBool,
}

/// Handle to the SDK. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    /// Start building a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn noop(error: LoopError) -> Self {
        Self {
            core: Arc::new(ClientCore::Noop { error }),
        }
    }

    fn active(&self) -> Option<&ActiveClient> {
        match self.core.as_ref() {
            ClientCore::Active(active) => {
                if active.closed.load(Ordering::Acquire) {
                    None
                } else {
                    Some(active)
                }
            }
            ClientCore::Noop { error } => {
                warn!(error = %error, "operation on a noop client");
                None
            }
        }
    }

    /// The configured workspace id (empty for a noop client).
    pub fn workspace_id(&self) -> String {
        self.active()
            .map(|a| a.workspace_id.clone())
            .unwrap_or_default()
    }

    /// Start a span linked to the one bound in `ctx` (unless the options say
    /// otherwise) and return a child context with the new span bound.
    ///
    /// On a closed or noop client the returned span is the no-op sentinel
    /// whose methods are all safe.
    pub fn start_span(
        &self,
        ctx: &Context,
        name: &str,
        span_type: &str,
        opts: StartSpanOptions,
    ) -> (Context, Span) {
        match self.active() {
            Some(active) => active.provider.start_span(ctx, name, span_type, opts),
            None => (ctx.clone(), Span::noop()),
        }
    }

    /// The span bound in `ctx`, or the no-op sentinel.
    pub fn get_span_from_context(&self, ctx: &Context) -> Span {
        match self.active() {
            Some(active) => active.provider.get_span_from_context(ctx),
            None => Span::noop(),
        }
    }

    /// Decode inbound propagation headers into a [`SpanContext`].
    pub fn get_span_from_header(&self, headers: &HashMap<String, String>) -> SpanContext {
        match self.active() {
            Some(active) => active.provider.get_span_from_header(headers),
            None => SpanContext::default(),
        }
    }

    /// Force the reporting of everything currently queued. Suspends until
    /// drained; bound it with `tokio::time::timeout` to enforce a deadline.
    pub async fn flush(&self) {
        if let Some(active) = self.active() {
            let _ = active.provider.flush().await;
        }
    }

    /// Drain the pipeline and shut it down. Idempotent; subsequent public
    /// calls are no-ops. Bound it with `tokio::time::timeout` to enforce a
    /// deadline; items not drained by then are lost.
    pub async fn close(&self) {
        let ClientCore::Active(active) = self.core.as_ref() else {
            return;
        };
        if active.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = active.provider.shutdown().await;
        info!("loop client closed");
    }
}

static DEFAULT_CLIENT: OnceCell<Client> = OnceCell::new();

/// The process-wide default client, built from environment variables on
/// first use. Construction failure yields a noop client that logs on every
/// call instead of failing the application.
pub fn default_client() -> Client {
    DEFAULT_CLIENT
        .get_or_init(|| match Client::builder().build() {
            Ok(client) => {
                install_signal_shutdown(client.clone());
                client
            }
            Err(error) => {
                warn!(error = %error, "failed to build default client, tracing is disabled");
                Client::noop(error)
            }
        })
        .clone()
}

/// Best-effort close on SIGINT/SIGTERM with a bounded drain window.
fn install_signal_shutdown(client: Client) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                return;
            };
            let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
                return;
            };
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, draining trace queues"),
                _ = sigint.recv() => info!("received SIGINT, draining trace queues"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("received ctrl-c, draining trace queues");
        }
        let _ = tokio::time::timeout(SIGNAL_DRAIN_WINDOW, client.close()).await;
    });
}

/// Start a span on the default client. See [`Client::start_span`].
pub fn start_span(
    ctx: &Context,
    name: &str,
    span_type: &str,
    opts: StartSpanOptions,
) -> (Context, Span) {
    default_client().start_span(ctx, name, span_type, opts)
}

/// Get the span bound in `ctx` from the default client.
pub fn get_span_from_context(ctx: &Context) -> Span {
    default_client().get_span_from_context(ctx)
}

/// Decode propagation headers with the default client.
pub fn get_span_from_header(headers: &HashMap<String, String>) -> SpanContext {
    default_client().get_span_from_header(headers)
}

/// Flush the default client's queues.
pub async fn flush() {
    default_client().flush().await
}

/// Close the default client. Should be called before program exit.
pub async fn close() {
    default_client().close().await
}
