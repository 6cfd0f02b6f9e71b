//! Shared plumbing for asynchronous HTTP API clients.
//!
//! The central type is [`ApiClient`], a thin wrapper over a shared `tower`
//! service with a swappable [`Authentication`] mechanism, so credentials can
//! rotate without tearing down connections.

use std::future::Future;
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use hyperdriver::service::SharedService;
use tower::ServiceExt as _;

mod auth;
mod error;
pub mod mock;
pub mod request;
pub mod response;
mod retry;
mod secret;
pub mod uri;

pub use self::auth::{basic_auth, Authentication, AuthenticationLayer, AuthenticationService};
pub use self::error::HttpResponseError;
pub use self::request::RequestExt;
pub use self::response::Response;
pub use self::retry::Backoff;
pub use self::secret::Secret;

/// Boxed future alias used at the crate's async seams.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A client for accessing APIs over HTTP / HTTPS.
///
/// Useful inner object to wrap for individual API clients.
#[derive(Debug, Clone)]
pub struct ApiClient<A> {
    inner: hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>,
    authentication: Arc<ArcSwap<A>>,
}

impl<A> ApiClient<A>
where
    A: Authentication + Send + Sync + 'static,
{
    /// Create a new API client from an authentication method, over a fresh
    /// HTTPS transport.
    pub fn new(authentication: A) -> Self {
        let authentication = Arc::new(ArcSwap::new(Arc::new(authentication)));
        let inner = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .layer(AuthenticationLayer::new(authentication.clone()))
            .build_service();

        let inner = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .layer(tower::util::MapResponseLayer::new(
                |response: http::Response<hyper::body::Incoming>| {
                    response.map(hyperdriver::Body::from)
                },
            ))
            .service(inner);

        ApiClient {
            inner,
            authentication,
        }
    }

    /// Create a new API client over an existing transport service.
    pub fn new_with_inner_service<S>(authentication: A, inner: S) -> Self
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
        let authentication = Arc::new(ArcSwap::new(Arc::new(authentication)));

        let service = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .layer(AuthenticationLayer::new(authentication.clone()))
            .service(inner);

        ApiClient {
            inner: service,
            authentication,
        }
    }

    /// Replace the authentication object, affecting all clones of this client.
    pub fn refresh_auth(&self, authentication: A) {
        self.authentication.store(Arc::new(authentication));
    }

    /// Access the current authentication object.
    pub fn auth(&self) -> Guard<Arc<A>> {
        self.authentication.as_ref().load()
    }

    /// Access the underlying shared service.
    pub fn inner(
        &self,
    ) -> &hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body> {
        &self.inner
    }

    /// Send a prepared request through the service stack and wrap the
    /// response together with the request parts that produced it.
    pub async fn execute(
        &self,
        req: http::Request<hyperdriver::Body>,
    ) -> Result<Response, hyperdriver::client::Error> {
        let parts = req.parts();
        let response = self.inner.clone().oneshot(req).await?;
        Ok(Response::new(parts, response))
    }
}
