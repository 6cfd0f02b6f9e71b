//! URI utilities.

use ::serde::Serialize;
use camino::Utf8Path;
use http::Uri;
use thiserror::Error;

/// Error appending query parameters to a URI.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The new query parameters could not be serialized.
    #[error("failed to serialize query parameters: {0}")]
    Serialize(#[from] serde_urlencoded::ser::Error),

    /// The URI is invalid with new query parameters.
    #[error("uri is not valid: {0}")]
    InvalidUriParts(#[from] http::uri::InvalidUriParts),

    /// The query parameters are invalid.
    #[error("uri is not valid: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
}

/// Serialize and Deserialize a URI to and from a string.
pub mod serde {
    use http::Uri;
    use serde::{Deserialize as _, Deserializer};

    /// Deserialize a URI from a string.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Uri, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }

    /// Serialize a URI as a string.
    pub fn serialize<S>(uri: &Uri, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(uri)
    }
}

/// Extension trait for URIs.
pub trait UriExtension {
    /// Join a path to a URI.
    fn join<P: AsRef<str>>(self, path: P) -> Uri;

    /// Append query parameters to a URI.
    fn append_query<T: Serialize + ?Sized>(self, query: &T) -> Result<Uri, QueryError>;
}

impl UriExtension for Uri {
    fn join<P: AsRef<str>>(self, path: P) -> Uri {
        let mut parts = self.into_parts();

        parts.path_and_query = parts.path_and_query.as_ref().map(|pq| {
            let joined = Utf8Path::new(pq.path()).join(path.as_ref());
            http::uri::PathAndQuery::from_maybe_shared(joined.to_string()).expect("joined path")
        });
        Uri::from_parts(parts).expect("valid uri parts")
    }

    fn append_query<T: Serialize + ?Sized>(self, query: &T) -> Result<Uri, QueryError> {
        let qs = serde_urlencoded::to_string(query)?;
        let mut parts = self.into_parts();

        let mut query = String::new();
        let mut path = String::new();

        if let Some(pq) = parts.path_and_query {
            path.push_str(pq.path());
            if let Some(q) = pq.query() {
                query.push_str(q);
                if !(qs.is_empty() && q.is_empty()) {
                    query.push('&');
                }
            }
        }
        query.push_str(&qs);

        let pq = format!("{}?{}", path, query);
        parts.path_and_query = Some(http::uri::PathAndQuery::from_maybe_shared(pq)?);

        Ok(http::Uri::from_parts(parts)?)
    }
}
