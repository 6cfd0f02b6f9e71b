use std::env::VarError;
use std::fmt;
use std::sync::Arc;

use api_kit::uri::UriExtension as _;
use api_kit::{RequestExt as _, Secret};
use http::{HeaderValue, Method, Request, Uri};
use hyperdriver::Body;
use serde::{Deserialize, Serialize};
use tower::ServiceExt as _;

use crate::errors::{EnvelopeExt as _, Error};

const B2_AUTHORIZE_URL: &str = "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";
const B2_KEY_ID_ENV: &str = "B2_KEY_ID";
const B2_KEY_ENV: &str = "B2_KEY";

/// B2 application key, which consists of an ID and a secret key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationKey {
    key_id: Secret,
    key: Secret,
}

impl ApplicationKey {
    /// Create a new application key.
    pub fn new<I, K>(key_id: I, key: K) -> Self
    where
        I: Into<Secret>,
        K: Into<Secret>,
    {
        let key_id = key_id.into();
        let key = key.into();

        if !key_id.revealed().starts_with('0') {
            tracing::warn!("B2 key id does not start with 0");
        }

        if !key.revealed().starts_with('K') {
            tracing::warn!("B2 key does not start with K");
        }

        Self { key_id, key }
    }

    /// Load the application key from the environment.
    pub fn from_env() -> Result<Self, VarError> {
        let key_id = Secret::from_env(B2_KEY_ID_ENV)?;
        let key = Secret::from_env(B2_KEY_ENV)?;

        Ok(ApplicationKey::new(key_id, key))
    }

    /// The key ID, this is the less secret part of the authentication pair.
    pub fn key_id(&self) -> &Secret {
        &self.key_id
    }

    /// The key, this is the secret part of the authentication pair.
    pub fn key(&self) -> &Secret {
        &self.key
    }

    #[cfg(test)]
    pub(crate) fn test() -> Self {
        ApplicationKey::new("001B2-key-id-test", "K001B2-key-test")
    }

    /// Exchange the key pair for a fresh authorization over the given
    /// transport. Credential rejection here is fatal; the caller decides
    /// whether to surface or retry.
    pub(crate) async fn fetch_authorization<S>(&self, service: S) -> Result<Authorization, Error>
    where
        S: tower::Service<
                http::Request<Body>,
                Response = http::Response<Body>,
                Error = hyperdriver::client::Error,
            > + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let request = Request::builder()
            .method(Method::GET)
            .version(http::Version::HTTP_11)
            .uri(B2_AUTHORIZE_URL)
            .basic_auth(self.key_id.revealed(), Some(self.key.revealed()))
            .body(Body::empty())
            .expect("valid authorize request");

        let parts = request.parts();
        let response = service.oneshot(request).await?;
        let response = api_kit::Response::new(parts, response);

        let auth: Authorization = response.deserialize("b2_authorize_account").await?;
        tracing::trace!(api = %auth.api_url, "got b2 authorization");
        Ok(auth)
    }
}

/// The authorization response from the B2 API: the session token plus the
/// account geometry transfers are planned against.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub(crate) account_id: Secret,
    pub(crate) authorization_token: Secret,

    #[serde(with = "api_kit::uri::serde")]
    pub(crate) api_url: Uri,
    #[serde(with = "api_kit::uri::serde")]
    pub(crate) download_url: Uri,

    pub(crate) recommended_part_size: u64,
    pub(crate) absolute_minimum_part_size: u64,

    #[serde(default)]
    pub(crate) allowed: Allowed,

    /// Stamp assigned by the session when the authorization is stored, used
    /// to collapse concurrent refresh attempts into a single authorize call.
    #[serde(skip)]
    pub(crate) generation: u64,
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorization")
            .field("account_id", &self.account_id)
            .field("authorization_token", &self.authorization_token)
            .field("api_url", &self.api_url.to_string())
            .field("download_url", &self.download_url.to_string())
            .field("generation", &self.generation)
            .finish()
    }
}

impl Authorization {
    /// The API base URL for this account.
    pub fn api_url(&self) -> &Uri {
        &self.api_url
    }

    /// The download base URL for this account.
    pub fn download_url(&self) -> &Uri {
        &self.download_url
    }

    /// The part size the service recommends for large files.
    pub fn recommended_part_size(&self) -> u64 {
        self.recommended_part_size
    }

    /// The smallest part size the service accepts for any non-final part.
    pub fn minimum_part_size(&self) -> u64 {
        self.absolute_minimum_part_size
    }

    /// The capability restrictions attached to this key.
    pub fn allowed(&self) -> &Allowed {
        &self.allowed
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn endpoint(&self, name: &str) -> Uri {
        self.api_url
            .clone()
            .join(format!("{}/{name}", crate::B2_API_PATH))
    }

    /// Build an authorized JSON POST to a B2 API operation.
    pub(crate) fn post<T: Serialize>(&self, name: &'static str, body: &T) -> Request<Body> {
        let url = self.endpoint(name);
        tracing::trace!("POST {}", url);

        let mut req = Request::builder()
            .method(Method::POST)
            .version(http::Version::HTTP_11)
            .uri(url)
            .body(
                serde_json::to_string(body)
                    .expect("serialize body to JSON")
                    .into(),
            )
            .expect("valid api request");
        self.stamp(&mut req);

        req
    }

    fn stamp(&self, req: &mut Request<Body>) {
        if !req.headers().contains_key(http::header::AUTHORIZATION) {
            let mut value: HeaderValue = self
                .authorization_token
                .to_header()
                .expect("authorization should be a valid http header value");
            value.set_sensitive(true);

            req.headers_mut().insert(http::header::AUTHORIZATION, value);
        }
    }

    #[cfg(test)]
    pub(crate) fn test() -> Self {
        Authorization {
            account_id: Secret::from("b2-account-id"),
            authorization_token: Secret::from("b2-authorization-token"),
            api_url: "https://api999.backblazeb2.test".parse().expect("test uri"),
            download_url: "https://f999.backblazeb2.test".parse().expect("test uri"),
            recommended_part_size: 100 * 1024 * 1024,
            absolute_minimum_part_size: 5 * 1024 * 1024,
            allowed: Allowed::default(),
            generation: 1,
        }
    }
}

/// The capability restrictions attached to an application key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Allowed {
    /// Capabilities this key grants (`writeFiles`, `readFiles`, ...).
    pub capabilities: Vec<String>,

    /// When present, the key only reaches this bucket.
    pub bucket_id: Option<String>,

    /// The name of the restricted bucket, when one is set.
    pub bucket_name: Option<String>,

    /// When present, the key only reaches files under this prefix.
    pub name_prefix: Option<String>,
}

impl Allowed {
    /// Whether the key grants a capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// The session's swappable credential slot. Anonymous until the first
/// connect; demoted back only when the session is closed.
#[derive(Debug, Clone, Default)]
pub(crate) enum AuthSlot {
    #[default]
    Anonymous,
    Authorized(Arc<Authorization>),
}

impl AuthSlot {
    pub(crate) fn authorization(&self) -> Option<&Arc<Authorization>> {
        match self {
            AuthSlot::Anonymous => None,
            AuthSlot::Authorized(auth) => Some(auth),
        }
    }
}

impl api_kit::Authentication for AuthSlot {
    fn authenticate<B>(&self, mut req: http::Request<B>) -> http::Request<B> {
        if let AuthSlot::Authorized(auth) = self {
            if !req.headers().contains_key(http::header::AUTHORIZATION) {
                let value = auth
                    .authorization_token
                    .to_header()
                    .expect("authorization should be a valid http header value");

                req.headers_mut().insert(http::header::AUTHORIZATION, value);
            }
        }

        req
    }
}
