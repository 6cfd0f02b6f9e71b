//! The session: credentials, executor, pools, and policies in one place.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use api_kit::{ApiClient, Backoff};
use dashmap::DashMap;
use http::HeaderValue;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::application::{ApplicationKey, AuthSlot, Authorization};
use crate::bucket::CachedBucket;
use crate::cache::{UrlPool, UPLOAD_URL_TTL};
use crate::config::TransferConfig;
use crate::errors::Error;
use crate::file::FileId;
use crate::policy::Bulkhead;
use crate::progress::ProgressFn;

/// Per-transfer knobs: a progress observer and a cancellation signal.
///
/// The default observes nothing and never cancels.
#[derive(Clone, Default)]
pub struct TransferOptions {
    /// Called after each flushed buffer; must not block.
    pub progress: Option<ProgressFn>,

    /// Cancels the transfer at its next suspension point.
    pub cancel: CancellationToken,
}

impl TransferOptions {
    /// Options with no observer and no cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a progress observer.
    pub fn with_progress(mut self, observer: ProgressFn) -> Self {
        self.progress = Some(observer);
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("progress", &self.progress.as_ref().map(|_| "..."))
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// A client session for one B2 application key.
///
/// The session starts unauthorized; [`Session::connect`] exchanges the key
/// pair for an authorization token and the account geometry. Expired tokens
/// are refreshed transparently by the retry policies, with concurrent
/// refreshes collapsed into a single authorize call. Cloning is cheap and
/// clones share credentials, URL pools, and concurrency limits.
#[derive(Debug, Clone)]
pub struct Session {
    api: ApiClient<AuthSlot>,
    keys: Arc<ApplicationKey>,
    config: Arc<TransferConfig>,

    pub(crate) upload_urls: Arc<UrlPool<crate::bucket::BucketId>>,
    pub(crate) part_urls: Arc<UrlPool<FileId>>,
    pub(crate) uploads: Bulkhead,
    pub(crate) downloads: Bulkhead,
    pub(crate) buckets: Arc<DashMap<String, CachedBucket>>,

    backoff: Backoff,
    reauth: Arc<tokio::sync::Mutex<()>>,
    generation: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl Session {
    /// Create an unauthorized session over a fresh HTTPS transport.
    pub fn new(keys: ApplicationKey, config: TransferConfig) -> Self {
        let mut builder = hyperdriver::Client::build_tcp_http();
        let tcp = builder.transport();
        tcp.connect_timeout = Some(crate::DEFAULT_CONNECT_TIMEOUT);
        let service = builder.with_timeout(crate::DEFAULT_TIMEOUT).build_service();
        let service = tower::ServiceBuilder::new()
            .layer(tower::util::MapResponseLayer::new(
                |response: http::Response<hyper::body::Incoming>| {
                    response.map(hyperdriver::Body::from)
                },
            ))
            .service(service);

        Self::from_api(
            ApiClient::new_with_inner_service(AuthSlot::Anonymous, service),
            keys,
            config,
        )
    }

    /// Create an unauthorized session over an existing transport service.
    ///
    /// This is how tests drive the engine against a scripted transport, and
    /// how embedders share one connection pool across clients.
    pub fn with_service<S>(service: S, keys: ApplicationKey, config: TransferConfig) -> Self
    where
        S: tower::Service<
                http::Request<hyperdriver::Body>,
                Response = http::Response<hyperdriver::Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Self::from_api(
            ApiClient::new_with_inner_service(AuthSlot::Anonymous, service),
            keys,
            config,
        )
    }

    fn from_api(api: ApiClient<AuthSlot>, keys: ApplicationKey, config: TransferConfig) -> Self {
        let config = config.normalized();

        Session {
            upload_urls: Arc::new(UrlPool::new(UPLOAD_URL_TTL, config.upload_connections)),
            part_urls: Arc::new(UrlPool::new(UPLOAD_URL_TTL, config.upload_connections)),
            uploads: Bulkhead::new(config.upload_connections),
            downloads: Bulkhead::new(config.download_connections),
            buckets: Arc::new(DashMap::new()),
            backoff: Backoff::default(),
            reauth: Arc::new(tokio::sync::Mutex::new(())),
            generation: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            keys: Arc::new(keys),
            config: Arc::new(config),
            api,
        }
    }

    /// The session tunables.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// The current authorization, when the session is connected.
    pub fn authorization(&self) -> Option<Arc<Authorization>> {
        self.api.auth().authorization().cloned()
    }

    /// Exchange the application key for a fresh authorization.
    ///
    /// Idempotent; also invoked by the retry policies when a token expires.
    /// Rejected credentials surface immediately and are never retried.
    pub async fn connect(&self) -> Result<(), Error> {
        let _guard = self.reauth.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let mut auth = self
            .keys
            .fetch_authorization(self.api.inner().clone())
            .await?;
        auth.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.api.refresh_auth(AuthSlot::Authorized(Arc::new(auth)));

        // Pooled URLs were issued under the old token.
        self.upload_urls.clear();
        self.part_urls.clear();

        tracing::debug!("authorized b2 session");
        Ok(())
    }

    /// Refresh the authorization after a task observed an authentication
    /// failure under generation `seen`. When several tasks fail at once,
    /// only the first performs the authorize call; the rest see the bumped
    /// generation and return immediately.
    pub(crate) async fn reauthorize(&self, seen: u64) -> Result<(), Error> {
        let _guard = self.reauth.lock().await;
        if self.generation.load(Ordering::SeqCst) != seen {
            return Ok(());
        }

        tracing::debug!(
            key = self.keys.key_id().revealed(),
            "refreshing b2 authorization"
        );
        self.connect_locked().await
    }

    /// Close the session. Terminal: subsequent calls fail with
    /// [`Error::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.api.refresh_auth(AuthSlot::Anonymous);
        self.upload_urls.clear();
        self.part_urls.clear();
        tracing::debug!("closed b2 session");
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub(crate) fn require_authorization(&self) -> Result<Arc<Authorization>, Error> {
        self.authorization().ok_or(Error::NotConnected)
    }

    /// The authorization, connecting first if the session never has.
    pub(crate) async fn ensure_connected(&self) -> Result<Arc<Authorization>, Error> {
        if let Some(auth) = self.authorization() {
            return Ok(auth);
        }
        self.connect().await?;
        self.require_authorization()
    }

    /// Send a prepared request, stamping the configured test mode.
    pub(crate) async fn execute(
        &self,
        op: &'static str,
        mut req: http::Request<hyperdriver::Body>,
    ) -> Result<api_kit::Response, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        if let Some(mode) = self.config.test_mode {
            req.headers_mut()
                .insert("x-bz-test-mode", HeaderValue::from_static(mode.as_str()));
        }

        tracing::trace!(op, uri = %req.uri(), "sending b2 request");
        Ok(self.api.execute(req).await?)
    }

    /// POST a JSON body to a B2 API operation under the session token.
    pub(crate) async fn post_api<T: Serialize>(
        &self,
        op: &'static str,
        body: &T,
    ) -> Result<api_kit::Response, Error> {
        let auth = self.require_authorization()?;
        self.execute(op, auth.post(op, body)).await
    }

    #[cfg(test)]
    pub(crate) fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}
