//! Error types for API clients.
use std::fmt;

use http::StatusCode;

use crate::response::Response;

/// A server returned an error response.
///
/// This carries no payload interpretation; clients layer their own error
/// envelopes on top where the service defines one.
#[derive(Debug, Clone)]
pub struct HttpResponseError {
    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The message body of the response.
    pub message: String,
}

impl HttpResponseError {
    /// Create a new HTTP response error from a response.
    pub async fn from_response(response: Response) -> Self {
        let status = response.status();
        let message = response
            .text()
            .await
            .unwrap_or_else(|err| format!("Failed to read response body: {}", err));

        Self { status, message }
    }
}

impl fmt::Display for HttpResponseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HTTP {} response: {}", self.status, self.message)
    }
}

impl std::error::Error for HttpResponseError {}
