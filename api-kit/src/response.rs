//! Response types for working with HTTP responses.

use http_body_util::BodyExt as _;
use hyperdriver::Body;

use crate::error::HttpResponseError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Wrapper around an HTTP response that keeps the request parts which
/// produced it, so errors can report the full exchange.
#[derive(Debug)]
pub struct Response {
    request: http::request::Parts,
    response: http::response::Parts,
    body: Body,
}

impl Response {
    /// Create a new `Response` instance.
    pub fn new(request: http::request::Parts, response: http::response::Response<Body>) -> Self {
        let (response, body) = response.into_parts();

        Self {
            request,
            response,
            body,
        }
    }

    /// The status code of the response.
    pub fn status(&self) -> http::StatusCode {
        self.response.status
    }

    /// The headers of the response.
    pub fn headers(&self) -> &http::HeaderMap {
        &self.response.headers
    }

    /// The URI of the request that generated the response.
    pub fn uri(&self) -> &http::Uri {
        &self.request.uri
    }

    /// The parts of the request that generated the response.
    pub fn request(&self) -> &http::request::Parts {
        &self.request
    }

    /// Unwrap into the response body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Convert the `Response` back into an `http::Response` instance.
    pub fn into_response(self) -> http::Response<Body> {
        http::Response::from_parts(self.response, self.body)
    }

    /// Collect the response body into a single `Bytes` buffer.
    pub async fn bytes(self) -> Result<bytes::Bytes, BoxError> {
        let collected = self.body.collect().await.map_err(BoxError::from)?;
        Ok(collected.to_bytes())
    }

    /// Collect the response body into a `String`.
    pub async fn text(self) -> Result<String, BoxError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(Into::into)
    }

    /// Convert the `Response` into an `HttpResponseError` instance.
    pub async fn into_error(self) -> HttpResponseError {
        HttpResponseError::from_response(self).await
    }

    /// Return the response, or an `HttpResponseError` if the status is not
    /// a success status.
    pub async fn error_for_status(self) -> Result<Self, HttpResponseError> {
        if self.status().is_success() {
            Ok(self)
        } else {
            Err(self.into_error().await)
        }
    }
}
